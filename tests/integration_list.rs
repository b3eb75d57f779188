//! The `list` surface over a real `file://` destination: grouping, ordering,
//! glob and time filters, and the injected-writer JSON output.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{backup_options, backup_payload, file_destination, job, send_stream, snapshot};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use zbak::cli::actions::{Action, list};
use zbak::cli::globals::GlobalArgs;
use zbak::compress::Compressor;

async fn seed_backups(store: &TempDir) {
    let work = TempDir::new().unwrap();
    let dests = vec![file_destination(store)];
    let options = backup_options(&work, 32 * 1024, Compressor::None, None);

    let full = job(
        "tank/data",
        None,
        snapshot("tank/data", "a", 1),
        Compressor::None,
        32 * 1024,
    );
    backup_payload(&send_stream(48 * 1024), full, &dests, &options)
        .await
        .unwrap();

    let incr = job(
        "tank/data",
        Some(snapshot("tank/data", "a", 1)),
        snapshot("tank/data", "b", 2),
        Compressor::None,
        32 * 1024,
    );
    backup_payload(&send_stream(16 * 1024), incr, &dests, &options)
        .await
        .unwrap();
}

fn list_action(store: &TempDir) -> Action {
    Action::List {
        destinations: vec![format!("file://{}", store.path().display())],
        volume_glob: None,
        before: None,
        after: None,
        json: true,
    }
}

async fn run_list(action: Action) -> serde_json::Value {
    let mut out = Vec::new();
    list::handle(
        action,
        &GlobalArgs::default(),
        &CancellationToken::new(),
        &mut out,
    )
    .await
    .unwrap();
    serde_json::from_slice(&out).unwrap()
}

#[tokio::test]
async fn test_list_groups_and_orders_by_target_creation() {
    let store = TempDir::new().unwrap();
    seed_backups(&store).await;

    let listing = run_list(list_action(&store)).await;

    let jobs = listing["tank/data"].as_array().unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0]["to"]["name"], "a");
    assert_eq!(jobs[1]["to"]["name"], "b");
    assert!(jobs[1]["from"]["name"].as_str().is_some());
}

#[tokio::test]
async fn test_list_volume_glob_filter() {
    let store = TempDir::new().unwrap();
    seed_backups(&store).await;

    let mut action = list_action(&store);
    if let Action::List { volume_glob, .. } = &mut action {
        *volume_glob = Some("v*".to_string());
    }
    let listing = run_list(action).await;
    assert!(listing.as_object().unwrap().is_empty());

    let mut action = list_action(&store);
    if let Action::List { volume_glob, .. } = &mut action {
        *volume_glob = Some("tank/*".to_string());
    }
    let listing = run_list(action).await;
    assert_eq!(listing.as_object().unwrap().len(), 1);
}

#[tokio::test]
async fn test_list_time_filters_are_monotone() {
    let store = TempDir::new().unwrap();
    seed_backups(&store).await;

    // the snapshots carry creation stamps in 2025; "now + 1h" keeps all,
    // "now - 24h" relative to those stamps keeps none
    let mut keep_all = list_action(&store);
    if let Action::List { before, .. } = &mut keep_all {
        *before = Some(Utc::now() + ChronoDuration::hours(1));
    }
    let listing = run_list(keep_all).await;
    assert_eq!(listing["tank/data"].as_array().unwrap().len(), 2);

    let mut keep_newer = list_action(&store);
    if let Action::List { after, .. } = &mut keep_newer {
        *after = Some(snapshot("tank/data", "a", 1).creation);
    }
    let listing = run_list(keep_newer).await;
    // strictly-after drops the full backup, keeps the incremental
    assert_eq!(listing["tank/data"].as_array().unwrap().len(), 1);

    let mut keep_none = list_action(&store);
    if let Action::List { after, .. } = &mut keep_none {
        *after = Some(Utc::now() + ChronoDuration::hours(1));
    }
    let listing = run_list(keep_none).await;
    assert!(listing.as_object().unwrap().is_empty());
}

#[tokio::test]
async fn test_list_empty_destination_is_not_an_error() {
    let store = TempDir::new().unwrap();
    let listing = run_list(list_action(&store)).await;
    assert!(listing.as_object().unwrap().is_empty());
}
