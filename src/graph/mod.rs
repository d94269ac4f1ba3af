use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RETRY_AFTER};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::credential::TokenSource;
use crate::error::AuthError;
use crate::model::ByteRange;

pub mod model;

pub use model::{ColumnInfo, DriveInfo, ItemsPage, ListInfo, ListItem, PageCursor};
use model::{Collection, CreatedItem, ErrorEnvelope, UploadSession};

const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0/";

/// Lets `$filter` reach columns that are not indexed on the list.
const PREFER_NON_INDEXED: &str = "HonorNonIndexedQueriesWarningMayFailRandomly";

#[derive(Debug, Error)]
pub enum GraphError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("HTTP {status} {code}: {message}")]
    Api {
        status: StatusCode,
        code: String,
        message: String,
    },
    #[error("throttled by the service (retry after {retry_after:?}s)")]
    Throttled { retry_after: Option<u64> },
    #[error("invalid URL: {0}")]
    Url(String),
}

impl GraphError {
    /// Provider error code, when the service sent one.
    pub fn code(&self) -> Option<&str> {
        match self {
            GraphError::Api { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// Query against a list's items.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemQuery {
    /// Columns to return under `fields`; empty returns no fields.
    pub select: Vec<String>,
    pub filter: Option<String>,
    pub page_size: Option<u32>,
}

impl ItemQuery {
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if !self.select.is_empty() {
            pairs.push(("$expand", format!("fields($select={})", self.select.join(","))));
        }
        if let Some(filter) = &self.filter {
            pairs.push(("$filter", filter.clone()));
        }
        if let Some(top) = self.page_size {
            pairs.push(("$top", top.to_string()));
        }
        pairs
    }
}

/// OData string literal, quotes doubled.
pub fn odata_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `fields/<field> eq '<value>'`
pub fn eq_filter(field: &str, value: &str) -> String {
    format!("fields/{} eq {}", field, odata_literal(value))
}

/// Items whose status column equals `done_value` and that were modified
/// after `since`.
pub fn delta_filter(status_column: &str, done_value: &str, since: DateTime<Utc>) -> String {
    format!(
        "{} and fields/Modified gt '{}'",
        eq_filter(status_column, done_value),
        since.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

/// Remote list/drive operations the rest of the crate relies on.
#[async_trait]
pub trait ListService: Send + Sync {
    async fn lists(&self) -> Result<Vec<ListInfo>, GraphError>;

    async fn drives(&self) -> Result<Vec<DriveInfo>, GraphError>;

    /// Returns the new item's id.
    async fn create_item(
        &self,
        list_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<String, GraphError>;

    async fn delete_item(&self, list_id: &str, item_id: &str) -> Result<(), GraphError>;

    async fn query_items(&self, list_id: &str, query: &ItemQuery)
        -> Result<ItemsPage, GraphError>;

    async fn next_page(&self, cursor: &PageCursor) -> Result<ItemsPage, GraphError>;

    /// Opens an upload session for `remote_path` (relative to the drive
    /// root) and returns the session URL.
    async fn create_upload_session(&self, remote_path: &str) -> Result<String, GraphError>;

    async fn upload_chunk(
        &self,
        upload_url: &str,
        range: ByteRange,
        total: u64,
        data: Vec<u8>,
    ) -> Result<(), GraphError>;
}

#[derive(Clone)]
pub struct GraphClient {
    http: Client,
    base_url: Url,
    site_id: String,
    drive_id: String,
    tokens: Arc<dyn TokenSource>,
}

impl fmt::Debug for GraphClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphClient")
            .field("base_url", &self.base_url)
            .field("site_id", &self.site_id)
            .finish_non_exhaustive()
    }
}

impl GraphClient {
    pub fn new(
        site_id: String,
        drive_id: String,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self, GraphError> {
        let base_url = Url::parse(GRAPH_API_BASE).map_err(|e| GraphError::Url(e.to_string()))?;
        Self::with_base_url(base_url, site_id, drive_id, tokens)
    }

    pub fn with_base_url(
        base_url: Url,
        site_id: String,
        drive_id: String,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self, GraphError> {
        let http = Client::builder()
            .user_agent(concat!("listsync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url,
            site_id,
            drive_id,
            tokens,
        })
    }

    pub fn from_config(cfg: &Config, tokens: Arc<dyn TokenSource>) -> Result<Self, GraphError> {
        let base_url =
            Url::parse(&cfg.azure.graph_base).map_err(|e| GraphError::Url(e.to_string()))?;
        Self::with_base_url(
            base_url,
            cfg.azure.site_id.clone(),
            cfg.azure.drive_id.clone(),
            tokens,
        )
    }

    fn endpoint(&self, path: &str) -> Result<Url, GraphError> {
        self.base_url
            .join(path)
            .map_err(|e| GraphError::Url(format!("{path}: {e}")))
    }

    fn site_endpoint(&self, rest: &str) -> Result<Url, GraphError> {
        self.endpoint(&format!("sites/{}/{}", self.site_id, rest))
    }

    /// Request with bearer token and a fresh `client-request-id`.
    async fn authorized(&self, method: Method, url: Url) -> Result<RequestBuilder, GraphError> {
        let token = self.tokens.bearer().await?;
        let request_id = Uuid::new_v4();
        debug!(%method, %url, %request_id, "graph request");
        Ok(self
            .http
            .request(method, url)
            .bearer_auth(token)
            .header("client-request-id", request_id.to_string()))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, GraphError> {
        let res = request.send().await?;
        if res.status().is_success() {
            return Ok(res);
        }
        Err(error_from_response(res).await)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, GraphError> {
        let request = self.authorized(Method::GET, url).await?;
        Ok(self.send(request).await?.json().await?)
    }

    /// Follow `@odata.nextLink` until the collection is exhausted.
    async fn get_collection<T: DeserializeOwned>(&self, url: Url) -> Result<Vec<T>, GraphError> {
        let mut page: Collection<T> = self.get_json(url).await?;
        let mut out = std::mem::take(&mut page.value);
        while let Some(next) = page.next_link.take() {
            let url = Url::parse(&next).map_err(|e| GraphError::Url(e.to_string()))?;
            page = self.get_json(url).await?;
            out.append(&mut page.value);
        }
        Ok(out)
    }

    async fn get_page(&self, request: RequestBuilder) -> Result<ItemsPage, GraphError> {
        let page: Collection<ListItem> = self.send(request).await?.json().await?;
        Ok(ItemsPage {
            items: page.value,
            next: page.next_link.map(PageCursor),
        })
    }

    /// Column definitions of a list.
    pub async fn columns(&self, list_id: &str) -> Result<Vec<ColumnInfo>, GraphError> {
        let url = self.site_endpoint(&format!("lists/{list_id}/columns"))?;
        self.get_collection(url).await
    }
}

async fn error_from_response(res: Response) -> GraphError {
    let status = res.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = res
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        warn!(?retry_after, "throttled by graph");
        return GraphError::Throttled { retry_after };
    }
    let body = res.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(envelope) => GraphError::Api {
            status,
            code: envelope.error.code,
            message: envelope.error.message,
        },
        Err(_) => GraphError::Api {
            status,
            code: status.canonical_reason().unwrap_or("unknown").to_string(),
            message: body,
        },
    }
}

#[async_trait]
impl ListService for GraphClient {
    async fn lists(&self) -> Result<Vec<ListInfo>, GraphError> {
        let url = self.site_endpoint("lists")?;
        self.get_collection(url).await
    }

    async fn drives(&self) -> Result<Vec<DriveInfo>, GraphError> {
        let url = self.site_endpoint("drives")?;
        self.get_collection(url).await
    }

    async fn create_item(
        &self,
        list_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<String, GraphError> {
        let url = self.site_endpoint(&format!("lists/{list_id}/items"))?;
        let request = self
            .authorized(Method::POST, url)
            .await?
            .json(&json!({ "fields": fields }));
        let created: CreatedItem = self.send(request).await?.json().await?;
        Ok(created.id)
    }

    async fn delete_item(&self, list_id: &str, item_id: &str) -> Result<(), GraphError> {
        let url = self.site_endpoint(&format!("lists/{list_id}/items/{item_id}"))?;
        let request = self.authorized(Method::DELETE, url).await?;
        self.send(request).await?;
        Ok(())
    }

    async fn query_items(
        &self,
        list_id: &str,
        query: &ItemQuery,
    ) -> Result<ItemsPage, GraphError> {
        let url = self.site_endpoint(&format!("lists/{list_id}/items"))?;
        let mut request = self
            .authorized(Method::GET, url)
            .await?
            .query(&query.query_pairs());
        if query.filter.is_some() {
            request = request.header("Prefer", PREFER_NON_INDEXED);
        }
        self.get_page(request).await
    }

    async fn next_page(&self, cursor: &PageCursor) -> Result<ItemsPage, GraphError> {
        let url = Url::parse(&cursor.0).map_err(|e| GraphError::Url(e.to_string()))?;
        let request = self
            .authorized(Method::GET, url)
            .await?
            .header("Prefer", PREFER_NON_INDEXED);
        self.get_page(request).await
    }

    async fn create_upload_session(&self, remote_path: &str) -> Result<String, GraphError> {
        let url = self.endpoint(&format!(
            "sites/{}/drives/{}/root:/{}:/createUploadSession",
            self.site_id,
            self.drive_id,
            remote_path.trim_start_matches('/')
        ))?;
        let request = self.authorized(Method::POST, url).await?.json(&json!({
            "item": { "@microsoft.graph.conflictBehavior": "replace" }
        }));
        let session: UploadSession = self.send(request).await?.json().await?;
        Ok(session.upload_url)
    }

    async fn upload_chunk(
        &self,
        upload_url: &str,
        range: ByteRange,
        total: u64,
        data: Vec<u8>,
    ) -> Result<(), GraphError> {
        // Session URLs are pre-authenticated; a bearer header is rejected.
        let res = self
            .http
            .put(upload_url)
            .header(CONTENT_RANGE, range.content_range(total))
            .header(CONTENT_LENGTH, data.len())
            .body(data)
            .send()
            .await?;
        match res.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::ACCEPTED => Ok(()),
            _ => Err(error_from_response(res).await),
        }
    }
}
