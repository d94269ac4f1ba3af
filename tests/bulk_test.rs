mod common;

use chrono::{TimeZone, Utc};
use common::{api_error, item, page, RecordingLists};
use listsync::bulk::{self, ErrorLog};
use listsync::clock::ManualClock;
use listsync::dispatcher::RateLimitedDispatcher;
use listsync::error::{AuthError, BulkError, QueryEmpty};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

async fn error_log(path: &Path) -> ErrorLog {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 3, 5, 8, 0, 0).unwrap(),
    ));
    ErrorLog::open(path, clock).await.unwrap()
}

fn rows(n: usize) -> Vec<Map<String, Value>> {
    (1..=n)
        .map(|i| {
            json!({ "Title": format!("row-{i}"), "Qty": i })
                .as_object()
                .cloned()
                .unwrap()
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn create_runs_in_bounded_batches_and_logs_failures() {
    let td = tempdir().unwrap();
    let log_path = td.path().join("erreurs.log");
    let log = error_log(&log_path).await;
    let lists = RecordingLists::default();
    lists.fail_create_for("row-37").await;
    let dispatcher = RateLimitedDispatcher::new(200, Duration::from_secs(10));

    let report = bulk::create_items(&lists, &dispatcher, "list-a", rows(250), &log)
        .await
        .unwrap();

    assert_eq!(report.batches, vec![200, 50]);
    assert_eq!(report.attempted(), 250);
    assert_eq!(report.failed(), 1);
    assert_eq!(lists.created().await.len(), 250);

    let failed: Vec<_> = report.errors().collect();
    assert_eq!(failed[0].op, "create");
    assert!(failed[0].item.contains("row-37"));

    let content = std::fs::read_to_string(&log_path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("2024-03-05T08:00:00.000Z - ERROR - create failed for "));
    assert!(lines[0].contains("row-37"));
}

#[tokio::test(start_paused = true)]
async fn delete_matching_skips_unknown_keys() {
    let lists = RecordingLists::with_pages(vec![
        Ok(page(vec![item("11", json!({})), item("12", json!({}))], None)),
        Ok(page(Vec::new(), None)),
        Ok(page(vec![item("13", json!({}))], None)),
    ]);
    let dispatcher = RateLimitedDispatcher::new(200, Duration::from_secs(10));

    let report = bulk::delete_matching(
        &lists,
        &dispatcher,
        "list-a",
        "Title",
        vec!["A1".into(), "ZZ".into(), "O'Neil".into()],
    )
    .await
    .unwrap();

    assert_eq!(
        report.unmatched,
        vec![QueryEmpty {
            field: "Title".into(),
            key: "ZZ".into()
        }]
    );
    assert_eq!(report.lookup_failures, 0);
    assert_eq!(report.deletes.succeeded(), 3);
    assert_eq!(lists.deleted().await, vec!["11", "12", "13"]);

    let filters: Vec<_> = lists
        .queries()
        .await
        .into_iter()
        .map(|(_, q)| q.filter.unwrap())
        .collect();
    assert_eq!(
        filters,
        vec![
            "fields/Title eq 'A1'",
            "fields/Title eq 'ZZ'",
            "fields/Title eq 'O''Neil'",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn no_matches_means_no_deletes() {
    let lists = RecordingLists::default();
    let dispatcher = RateLimitedDispatcher::new(200, Duration::from_secs(10));

    let report = bulk::delete_matching(
        &lists,
        &dispatcher,
        "list-a",
        "Title",
        vec!["X1".into(), "X2".into()],
    )
    .await
    .unwrap();

    assert_eq!(report.unmatched.len(), 2);
    assert_eq!(
        report.unmatched[0].to_string(),
        "no items found with Title = 'X1'"
    );
    assert_eq!(report.deletes.attempted(), 0);
    assert!(lists.deleted().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_lookup_is_counted_and_others_proceed() {
    let lists = RecordingLists::with_pages(vec![
        Err(api_error(500, "generalException")),
        Ok(page(vec![item("21", json!({}))], None)),
    ]);
    lists.fail_delete_for("21").await;
    let dispatcher = RateLimitedDispatcher::new(200, Duration::from_secs(10));

    let report = bulk::delete_matching(
        &lists,
        &dispatcher,
        "list-a",
        "Title",
        vec!["A1".into(), "A2".into()],
    )
    .await
    .unwrap();

    assert_eq!(report.lookup_failures, 1);
    assert_eq!(report.deletes.attempted(), 1);
    assert_eq!(report.deletes.failed(), 1);
    let err = report.deletes.errors().next().unwrap();
    assert_eq!(err.item, "21");
    assert_eq!(err.source.code(), Some("itemNotFound"));
}

#[tokio::test(start_paused = true)]
async fn delete_all_collects_every_page_before_deleting() {
    let lists = RecordingLists::with_pages(vec![
        Ok(page(vec![item("1", json!({})), item("2", json!({}))], Some("next-2"))),
        Ok(page(vec![item("3", json!({}))], None)),
    ]);
    let dispatcher = RateLimitedDispatcher::new(2, Duration::from_secs(10));

    let report = bulk::delete_all(&lists, &dispatcher, "list-a").await.unwrap();

    assert_eq!(report.batches, vec![2, 1]);
    assert_eq!(report.succeeded(), 3);
    assert_eq!(lists.cursors().await, vec!["next-2"]);
    assert_eq!(lists.deleted().await, vec!["1", "2", "3"]);
}

#[tokio::test(start_paused = true)]
async fn delete_all_deletes_nothing_when_listing_fails() {
    let lists = RecordingLists::with_pages(vec![
        Ok(page(vec![item("1", json!({}))], Some("next-2"))),
        Err(api_error(503, "serviceNotAvailable")),
    ]);
    let dispatcher = RateLimitedDispatcher::new(200, Duration::from_secs(10));

    let err = bulk::delete_all(&lists, &dispatcher, "list-a").await.unwrap_err();

    match err {
        BulkError::Listing(err) => assert_eq!(err.page, 2),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(lists.deleted().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn lost_credential_stops_create_after_the_first_batch() {
    let td = tempdir().unwrap();
    let log = error_log(&td.path().join("erreurs.log")).await;
    let lists = RecordingLists::default();
    lists.revoke_credentials().await;
    let dispatcher = RateLimitedDispatcher::new(200, Duration::from_secs(10));

    let err = bulk::create_items(&lists, &dispatcher, "list-a", rows(450), &log)
        .await
        .unwrap_err();

    assert!(matches!(err, AuthError::Rejected { ref code, .. } if code == "invalid_client"));
    assert_eq!(lists.created().await.len(), 200);
}

#[tokio::test(start_paused = true)]
async fn lost_credential_stops_delete_by_key_at_the_first_lookup() {
    let lists = RecordingLists::default();
    lists.revoke_credentials().await;
    let dispatcher = RateLimitedDispatcher::new(200, Duration::from_secs(10));

    let err = bulk::delete_matching(
        &lists,
        &dispatcher,
        "list-a",
        "Title",
        vec!["A1".into(), "A2".into(), "A3".into()],
    )
    .await
    .unwrap_err();

    assert!(matches!(err, AuthError::Rejected { .. }));
    assert_eq!(lists.queries().await.len(), 1);
    assert!(lists.deleted().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn lost_credential_halts_deletes_after_the_current_batch() {
    let lists = RecordingLists::default();
    lists.revoke_credentials().await;
    let dispatcher = RateLimitedDispatcher::new(2, Duration::from_secs(10));
    let ids = (1..=5).map(|i| i.to_string()).collect();

    let err = bulk::delete_ids(&lists, &dispatcher, "list-a", ids)
        .await
        .unwrap_err();

    assert!(matches!(err, AuthError::Rejected { .. }));
    assert_eq!(lists.deleted().await, vec!["1", "2"]);
}

#[tokio::test(start_paused = true)]
async fn lost_credential_while_listing_is_an_auth_error() {
    let lists = RecordingLists::default();
    lists.revoke_credentials().await;
    let dispatcher = RateLimitedDispatcher::new(200, Duration::from_secs(10));

    let err = bulk::delete_all(&lists, &dispatcher, "list-a").await.unwrap_err();

    assert!(matches!(err, BulkError::Auth(AuthError::Rejected { .. })));
    assert!(lists.deleted().await.is_empty());
}
