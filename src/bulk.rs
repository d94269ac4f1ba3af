//! Bulk create and delete against one list, driven through the
//! rate-limited dispatcher.
use chrono::SecondsFormat;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use crate::clock::Clock;
use crate::dispatcher::{DispatchReport, RateLimitedDispatcher};
use crate::error::{AuthError, BulkError, ItemError, QueryEmpty};
use crate::graph::{eq_filter, ItemQuery, ListService};
use crate::sync::fetch_all_pages;

/// Append-only `<timestamp> - ERROR - <message>` log of failed items.
pub struct ErrorLog {
    file: Mutex<File>,
    clock: Arc<dyn Clock>,
}

impl ErrorLog {
    pub async fn open(path: &Path, clock: Arc<dyn Clock>) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            file: Mutex::new(file),
            clock,
        })
    }

    pub async fn record(&self, message: &str) {
        let line = format!(
            "{} - ERROR - {}\n",
            self.clock.now().to_rfc3339_opts(SecondsFormat::Millis, true),
            message
        );
        let mut file = self.file.lock().await;
        let written = match file.write_all(line.as_bytes()).await {
            Ok(()) => file.flush().await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            warn!(?err, "failed to write error log");
        }
    }
}

/// Outcome of deleting by a key column.
#[derive(Debug, Default)]
pub struct RemovalReport {
    /// Keys that matched nothing.
    pub unmatched: Vec<QueryEmpty>,
    /// Keys whose lookup query failed.
    pub lookup_failures: usize,
    pub deletes: DispatchReport<(), ItemError>,
}

/// Create one item per row. Failures go to `errors` and do not stop the run,
/// except a credential failure, which ends it after the current batch.
#[instrument(skip_all, fields(list_id = %list_id, rows = rows.len()))]
pub async fn create_items(
    service: &dyn ListService,
    dispatcher: &RateLimitedDispatcher,
    list_id: &str,
    rows: Vec<Map<String, Value>>,
    errors: &ErrorLog,
) -> Result<DispatchReport<String, ItemError>, AuthError> {
    let report = dispatcher
        .run_until(
            rows,
            |fields| async move {
                match service.create_item(list_id, &fields).await {
                    Ok(id) => Ok(id),
                    Err(source) => {
                        let err = ItemError {
                            op: "create",
                            item: Value::Object(fields).to_string(),
                            source,
                        };
                        error!(%err, "create failed");
                        errors.record(&err.to_string()).await;
                        Err(err)
                    }
                }
            },
            ItemError::is_auth,
        )
        .await;
    let report = auth_failure(report)?;
    info!(
        created = report.succeeded(),
        failed = report.failed(),
        batches = report.batches.len(),
        "bulk create finished"
    );
    Ok(report)
}

/// Delete the given item ids. A credential failure ends the run after the
/// current batch.
pub async fn delete_ids(
    service: &dyn ListService,
    dispatcher: &RateLimitedDispatcher,
    list_id: &str,
    ids: Vec<String>,
) -> Result<DispatchReport<(), ItemError>, AuthError> {
    let report = dispatcher
        .run_until(
            ids,
            |id| async move {
                service
                    .delete_item(list_id, &id)
                    .await
                    .map_err(|source| ItemError {
                        op: "delete",
                        item: id,
                        source,
                    })
            },
            ItemError::is_auth,
        )
        .await;
    auth_failure(report)
}

/// Surface the first credential failure of a dispatch as the run's error.
fn auth_failure<T>(
    report: DispatchReport<T, ItemError>,
) -> Result<DispatchReport<T, ItemError>, AuthError> {
    if !report.errors().any(ItemError::is_auth) {
        return Ok(report);
    }
    let DispatchReport {
        batches,
        outcomes,
        skipped,
    } = report;
    let mut kept = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        match outcome.map_err(ItemError::into_auth) {
            Err(Ok(auth)) => return Err(auth),
            Err(Err(err)) => kept.push(Err(err)),
            Ok(value) => kept.push(Ok(value)),
        }
    }
    Ok(DispatchReport {
        batches,
        outcomes: kept,
        skipped,
    })
}

/// Delete every item whose `match_field` equals one of `keys`. A key that
/// matches nothing is reported and skipped. A credential failure ends the
/// run.
#[instrument(skip_all, fields(list_id = %list_id, keys = keys.len()))]
pub async fn delete_matching(
    service: &dyn ListService,
    dispatcher: &RateLimitedDispatcher,
    list_id: &str,
    match_field: &str,
    keys: Vec<String>,
) -> Result<RemovalReport, AuthError> {
    let mut report = RemovalReport::default();
    let mut ids = Vec::new();

    for key in keys {
        let query = ItemQuery {
            select: vec![match_field.to_string()],
            filter: Some(eq_filter(match_field, &key)),
            page_size: None,
        };
        match fetch_all_pages(service, &key, list_id, &query).await {
            Ok(items) if items.is_empty() => {
                let miss = QueryEmpty {
                    field: match_field.to_string(),
                    key,
                };
                info!("{}", miss);
                report.unmatched.push(miss);
            }
            Ok(items) => ids.extend(items.into_iter().map(|item| item.id)),
            Err(err) => match BulkError::from(err) {
                BulkError::Auth(auth) => return Err(auth),
                BulkError::Listing(err) => {
                    warn!(%err, "lookup failed");
                    report.lookup_failures += 1;
                }
            },
        }
    }

    report.deletes = delete_ids(service, dispatcher, list_id, ids).await?;
    info!(
        deleted = report.deletes.succeeded(),
        failed = report.deletes.failed(),
        unmatched = report.unmatched.len(),
        "delete by key finished"
    );
    Ok(report)
}

/// Delete every item of the list. All ids are collected before the first
/// delete so pagination never runs over a shrinking list.
#[instrument(skip_all, fields(list_id = %list_id))]
pub async fn delete_all(
    service: &dyn ListService,
    dispatcher: &RateLimitedDispatcher,
    list_id: &str,
) -> Result<DispatchReport<(), ItemError>, BulkError> {
    let items = fetch_all_pages(service, list_id, list_id, &ItemQuery::default()).await?;
    info!(count = items.len(), "deleting all items");
    let ids = items.into_iter().map(|item| item.id).collect();
    Ok(delete_ids(service, dispatcher, list_id, ids).await?)
}
