#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use listsync::credential::{IdentityProvider, IssuedToken};
use listsync::error::{AuthError, SinkError};
use listsync::graph::{
    DriveInfo, GraphError, ItemQuery, ItemsPage, ListInfo, ListItem, ListService, PageCursor,
};
use listsync::model::{ByteRange, Frame};
use listsync::sync::{RowSink, WatermarkStore};
use reqwest::StatusCode;
use serde_json::{Map, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

pub fn item(id: &str, fields: Value) -> ListItem {
    ListItem {
        id: id.to_string(),
        fields: fields.as_object().cloned().unwrap_or_default(),
    }
}

pub fn page(items: Vec<ListItem>, next: Option<&str>) -> ItemsPage {
    ItemsPage {
        items,
        next: next.map(|n| PageCursor(n.to_string())),
    }
}

pub fn api_error(status: u16, code: &str) -> GraphError {
    GraphError::Api {
        status: StatusCode::from_u16(status).unwrap(),
        code: code.to_string(),
        message: format!("{code} from test"),
    }
}

/// Scripted stand-in for the remote list service. Pages are served in
/// queue order to both `query_items` and `next_page`; an exhausted queue
/// serves an empty final page.
#[derive(Clone, Default)]
pub struct RecordingLists {
    pages: Arc<Mutex<VecDeque<Result<ItemsPage, GraphError>>>>,
    failing_titles: Arc<Mutex<HashSet<String>>>,
    failing_deletes: Arc<Mutex<HashSet<String>>>,
    failing_chunk: Arc<Mutex<Option<usize>>>,
    revoked: Arc<Mutex<bool>>,
    pub queries: Arc<Mutex<Vec<(String, ItemQuery)>>>,
    pub cursors: Arc<Mutex<Vec<String>>>,
    pub created: Arc<Mutex<Vec<Map<String, Value>>>>,
    pub deleted: Arc<Mutex<Vec<String>>>,
    pub sessions: Arc<Mutex<Vec<String>>>,
    pub chunks: Arc<Mutex<Vec<(String, ByteRange, u64, usize)>>>,
}

impl RecordingLists {
    pub fn with_pages(pages: Vec<Result<ItemsPage, GraphError>>) -> Self {
        Self {
            pages: Arc::new(Mutex::new(VecDeque::from(pages))),
            ..Default::default()
        }
    }

    pub async fn fail_create_for(&self, title: &str) {
        self.failing_titles.lock().await.insert(title.to_string());
    }

    pub async fn fail_delete_for(&self, id: &str) {
        self.failing_deletes.lock().await.insert(id.to_string());
    }

    /// Fail the n-th chunk PUT (1-based, counted across sessions).
    pub async fn fail_chunk_at(&self, n: usize) {
        *self.failing_chunk.lock().await = Some(n);
    }

    /// Every later create, delete and query fails for lack of a credential.
    pub async fn revoke_credentials(&self) {
        *self.revoked.lock().await = true;
    }

    async fn check_credentials(&self) -> Result<(), GraphError> {
        if *self.revoked.lock().await {
            return Err(GraphError::Auth(AuthError::Rejected {
                code: "invalid_client".into(),
                message: "credential revoked".into(),
            }));
        }
        Ok(())
    }

    async fn pop_page(&self) -> Result<ItemsPage, GraphError> {
        self.pages
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(page(Vec::new(), None)))
    }

    pub async fn created(&self) -> Vec<Map<String, Value>> {
        self.created.lock().await.clone()
    }

    pub async fn deleted(&self) -> Vec<String> {
        self.deleted.lock().await.clone()
    }

    pub async fn queries(&self) -> Vec<(String, ItemQuery)> {
        self.queries.lock().await.clone()
    }

    pub async fn cursors(&self) -> Vec<String> {
        self.cursors.lock().await.clone()
    }

    pub async fn chunks(&self) -> Vec<(String, ByteRange, u64, usize)> {
        self.chunks.lock().await.clone()
    }

    pub async fn sessions(&self) -> Vec<String> {
        self.sessions.lock().await.clone()
    }
}

#[async_trait]
impl ListService for RecordingLists {
    async fn lists(&self) -> Result<Vec<ListInfo>, GraphError> {
        Ok(Vec::new())
    }

    async fn drives(&self) -> Result<Vec<DriveInfo>, GraphError> {
        Ok(Vec::new())
    }

    async fn create_item(
        &self,
        _list_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<String, GraphError> {
        let mut created = self.created.lock().await;
        created.push(fields.clone());
        self.check_credentials().await?;
        let title = fields.get("Title").and_then(Value::as_str).unwrap_or("");
        if self.failing_titles.lock().await.contains(title) {
            return Err(api_error(400, "invalidRequest"));
        }
        Ok(created.len().to_string())
    }

    async fn delete_item(&self, _list_id: &str, item_id: &str) -> Result<(), GraphError> {
        self.deleted.lock().await.push(item_id.to_string());
        self.check_credentials().await?;
        if self.failing_deletes.lock().await.contains(item_id) {
            return Err(api_error(404, "itemNotFound"));
        }
        Ok(())
    }

    async fn query_items(
        &self,
        list_id: &str,
        query: &ItemQuery,
    ) -> Result<ItemsPage, GraphError> {
        self.queries
            .lock()
            .await
            .push((list_id.to_string(), query.clone()));
        self.check_credentials().await?;
        self.pop_page().await
    }

    async fn next_page(&self, cursor: &PageCursor) -> Result<ItemsPage, GraphError> {
        self.cursors.lock().await.push(cursor.0.clone());
        self.pop_page().await
    }

    async fn create_upload_session(&self, remote_path: &str) -> Result<String, GraphError> {
        let mut sessions = self.sessions.lock().await;
        sessions.push(remote_path.to_string());
        Ok(format!("https://upload.test/session-{}", sessions.len()))
    }

    async fn upload_chunk(
        &self,
        upload_url: &str,
        range: ByteRange,
        total: u64,
        data: Vec<u8>,
    ) -> Result<(), GraphError> {
        let mut chunks = self.chunks.lock().await;
        chunks.push((upload_url.to_string(), range, total, data.len()));
        if *self.failing_chunk.lock().await == Some(chunks.len()) {
            return Err(api_error(500, "generalException"));
        }
        Ok(())
    }
}

/// Watermark kept in memory; counts writes.
#[derive(Default)]
pub struct MemoryWatermark {
    pub value: Mutex<Option<DateTime<Utc>>>,
    pub writes: Mutex<Vec<DateTime<Utc>>>,
}

impl MemoryWatermark {
    pub fn starting_at(at: DateTime<Utc>) -> Self {
        Self {
            value: Mutex::new(Some(at)),
            ..Default::default()
        }
    }

    pub async fn current(&self) -> Option<DateTime<Utc>> {
        *self.value.lock().await
    }

    pub async fn writes(&self) -> Vec<DateTime<Utc>> {
        self.writes.lock().await.clone()
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermark {
    async fn read(&self) -> std::io::Result<Option<DateTime<Utc>>> {
        Ok(*self.value.lock().await)
    }

    async fn write(&self, at: DateTime<Utc>) -> std::io::Result<()> {
        *self.value.lock().await = Some(at);
        self.writes.lock().await.push(at);
        Ok(())
    }
}

/// Keeps every appended frame.
#[derive(Default)]
pub struct VecSink {
    pub frames: Vec<Frame>,
}

impl RowSink for VecSink {
    fn append(&mut self, frame: &Frame) -> Result<(), SinkError> {
        self.frames.push(frame.clone());
        Ok(())
    }
}

/// Rejects every token request and counts them.
#[derive(Default)]
pub struct RejectingProvider {
    pub calls: std::sync::atomic::AtomicUsize,
}

impl RejectingProvider {
    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityProvider for RejectingProvider {
    async fn request_token(&self) -> Result<IssuedToken, AuthError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Err(AuthError::Rejected {
            code: "invalid_client".into(),
            message: "AADSTS7000215: Invalid client secret provided.".into(),
        })
    }
}

/// Hands out the same token every time.
pub struct FixedProvider(pub &'static str);

#[async_trait]
impl IdentityProvider for FixedProvider {
    async fn request_token(&self) -> Result<IssuedToken, AuthError> {
        Ok(IssuedToken {
            token: self.0.to_string(),
            expires_on: Utc::now() + chrono::Duration::hours(1),
        })
    }
}
