//! Error kinds raised by the credential cache, bulk dispatch, delta sync and
//! upload paths. Network failures arrive as [`GraphError`] and are wrapped
//! with the operation and item they belong to.
use thiserror::Error;

use crate::graph::GraphError;
use crate::model::ByteRange;

/// The identity provider rejected the request or could not be reached.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("identity provider rejected the request ({code}): {message}")]
    Rejected { code: String, message: String },
    #[error("identity provider unreachable: {0}")]
    Unreachable(String),
    #[error("failed to persist credential: {0}")]
    Store(#[from] std::io::Error),
}

/// One bulk create/delete call failed. Logged, never fatal to the run.
#[derive(Debug, Error)]
#[error("{op} failed for {item}: {source}")]
pub struct ItemError {
    pub op: &'static str,
    pub item: String,
    #[source]
    pub source: GraphError,
}

impl ItemError {
    pub fn is_auth(&self) -> bool {
        matches!(self.source, GraphError::Auth(_))
    }

    /// The credential failure behind this item, if that is what failed it.
    pub fn into_auth(self) -> Result<AuthError, ItemError> {
        match self.source {
            GraphError::Auth(err) => Ok(err),
            source => Err(ItemError { source, ..self }),
        }
    }
}

/// A page fetch failed part-way through a target's extraction.
#[derive(Debug, Error)]
#[error("page {page} of '{target}' failed: {source}")]
pub struct PaginationError {
    pub target: String,
    pub page: usize,
    #[source]
    pub source: GraphError,
}

/// A delete-by-filter query matched nothing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no items found with {field} = '{key}'")]
pub struct QueryEmpty {
    pub field: String,
    pub key: String,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("could not read {file}: {source}")]
    Read {
        file: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not open an upload session for {file}: {source}")]
    Session {
        file: String,
        #[source]
        source: GraphError,
    },
    #[error("upload of {file} failed at bytes {range}: {source}")]
    Chunk {
        file: String,
        range: ByteRange,
        #[source]
        source: GraphError,
    },
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Pagination(PaginationError),
    #[error("watermark store: {0}")]
    Watermark(#[source] std::io::Error),
    #[error("output sink: {0}")]
    Sink(#[from] SinkError),
}

impl From<PaginationError> for SyncError {
    /// A page that failed because no token could be obtained is an auth
    /// failure, not a pagination one.
    fn from(err: PaginationError) -> Self {
        let PaginationError {
            target,
            page,
            source,
        } = err;
        match source {
            GraphError::Auth(auth) => SyncError::Auth(auth),
            source => SyncError::Pagination(PaginationError {
                target,
                page,
                source,
            }),
        }
    }
}

/// A bulk delete-all could not list the items or lost its credential.
#[derive(Debug, Error)]
pub enum BulkError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Listing(PaginationError),
}

impl From<PaginationError> for BulkError {
    fn from(err: PaginationError) -> Self {
        let PaginationError {
            target,
            page,
            source,
        } = err;
        match source {
            GraphError::Auth(auth) => BulkError::Auth(auth),
            source => BulkError::Listing(PaginationError {
                target,
                page,
                source,
            }),
        }
    }
}
