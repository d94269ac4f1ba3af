//! Delta extraction: read-and-advance the watermark, query every target for
//! rows completed since then, follow continuation cursors, and append the
//! shaped rows to a sink.
use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::config;
use crate::error::{PaginationError, SinkError, SyncError};
use crate::graph::{delta_filter, GraphError, ItemQuery, ListItem, ListService};
use crate::model::{Frame, SyncTarget};

/// Timestamp of the last extraction start.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn read(&self) -> std::io::Result<Option<DateTime<Utc>>>;
    async fn write(&self, at: DateTime<Utc>) -> std::io::Result<()>;
}

/// Destination for extracted frames. Appends, never overwrites.
pub trait RowSink {
    fn append(&mut self, frame: &Frame) -> Result<(), SinkError>;
}

/// Watermark kept as a single RFC 3339 timestamp in a text file.
#[derive(Debug, Clone)]
pub struct FileWatermarkStore {
    path: PathBuf,
}

impl FileWatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl WatermarkStore for FileWatermarkStore {
    async fn read(&self) -> std::io::Result<Option<DateTime<Utc>>> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        match DateTime::parse_from_rfc3339(raw.trim()) {
            Ok(ts) => Ok(Some(ts.with_timezone(&Utc))),
            Err(err) => {
                warn!(%err, path = %self.path.display(), "ignoring unparsable watermark");
                Ok(None)
            }
        }
    }

    async fn write(&self, at: DateTime<Utc>) -> std::io::Result<()> {
        fs::write(&self.path, at.to_rfc3339()).await
    }
}

/// Output schema and the completion predicate of a delta query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaSchema {
    pub columns: Vec<String>,
    pub status_column: String,
    pub done_value: String,
    pub page_size: Option<u32>,
}

impl DeltaSchema {
    pub fn from_config(cfg: &config::Extraction) -> Self {
        Self {
            columns: cfg.columns.clone(),
            status_column: cfg.status_column.clone(),
            done_value: cfg.done_value.clone(),
            page_size: cfg.page_size,
        }
    }

    pub fn query(&self, since: DateTime<Utc>) -> ItemQuery {
        ItemQuery {
            select: self.columns.clone(),
            filter: Some(delta_filter(&self.status_column, &self.done_value, since)),
            page_size: self.page_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Lower bound used in every target's query.
    pub since: DateTime<Utc>,
    /// Row count appended per target, in target order.
    pub targets: Vec<(String, usize)>,
}

pub struct DeltaSyncEngine {
    service: Arc<dyn ListService>,
    watermarks: Arc<dyn WatermarkStore>,
    clock: Arc<dyn Clock>,
    schema: DeltaSchema,
}

impl DeltaSyncEngine {
    pub fn new(
        service: Arc<dyn ListService>,
        watermarks: Arc<dyn WatermarkStore>,
        clock: Arc<dyn Clock>,
        schema: DeltaSchema,
    ) -> Self {
        Self {
            service,
            watermarks,
            clock,
            schema,
        }
    }

    /// Extract every target in order. A failed target stops the run; targets
    /// already appended stay appended, and nothing of the failed target
    /// reaches the sink.
    ///
    /// The watermark is advanced before any fetch. A run that fails afterwards
    /// does not retry its window on the next call.
    #[instrument(skip_all, fields(targets = targets.len()))]
    pub async fn sync(
        &self,
        targets: &[SyncTarget],
        sink: &mut dyn RowSink,
    ) -> Result<SyncReport, SyncError> {
        let since = self.begin_window().await?;
        let query = self.schema.query(since);
        let mut report = SyncReport {
            since,
            targets: Vec::with_capacity(targets.len()),
        };

        for target in targets {
            let items =
                fetch_all_pages(self.service.as_ref(), &target.name, &target.list_id, &query)
                    .await?;
            let frame = Frame::from_rows(
                &self.schema.columns,
                items.into_iter().map(|item| item.fields).collect(),
            );
            sink.append(&frame)?;
            info!(name = %target.name, rows = frame.len(), "target extracted");
            report.targets.push((target.name.clone(), frame.len()));
        }

        Ok(report)
    }

    /// Read the previous watermark and immediately store today's start in
    /// its place. Never moves the stored value backwards.
    async fn begin_window(&self) -> Result<DateTime<Utc>, SyncError> {
        let today = start_of_day(self.clock.now());
        let previous = self
            .watermarks
            .read()
            .await
            .map_err(SyncError::Watermark)?;
        let next = previous.map_or(today, |p| p.max(today));
        self.watermarks
            .write(next)
            .await
            .map_err(SyncError::Watermark)?;
        let since = previous.unwrap_or(today);
        debug!(%since, %next, "watermark advanced");
        Ok(since)
    }
}

pub fn start_of_day(at: DateTime<Utc>) -> DateTime<Utc> {
    at.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Fetch the first page of `query` and follow continuation cursors until
/// none is returned. Either every page arrives or nothing is returned.
pub async fn fetch_all_pages(
    service: &dyn ListService,
    target: &str,
    list_id: &str,
    query: &ItemQuery,
) -> Result<Vec<ListItem>, PaginationError> {
    let fail = |page: usize| {
        move |source: GraphError| PaginationError {
            target: target.to_string(),
            page,
            source,
        }
    };

    let mut page = 1;
    let first = service.query_items(list_id, query).await.map_err(fail(page))?;
    let mut items = first.items;
    let mut next = first.next;

    while let Some(cursor) = next {
        page += 1;
        debug!(list = target, page, "following continuation");
        let resp = service.next_page(&cursor).await.map_err(fail(page))?;
        items.extend(resp.items);
        next = resp.next;
    }

    Ok(items)
}
