//! Shared helpers for the integration tests: `file://` destinations, a
//! deterministic pseudo-send-stream, and pipeline option builders.

#![allow(dead_code)]

use chrono::DateTime;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use zbak::backends::Destination;
use zbak::backup::{
    BackupOptions, BackupOutcome, run_backup, scheduler::FailurePolicy,
    stage::{JobCrypto, StageOptions},
};
use zbak::compress::Compressor;
use zbak::manifest::{JobInfo, SnapshotRef};
use zbak::restore::{RestoreCrypto, RestoreOptions};
use zbak::retry::RetryPolicy;

pub fn snapshot(dataset: &str, name: &str, guid: u64) -> SnapshotRef {
    SnapshotRef {
        dataset: dataset.to_string(),
        name: name.to_string(),
        guid,
        txg: guid * 16,
        creation: DateTime::from_timestamp(1_753_000_000 + i64::try_from(guid).unwrap() * 60, 0)
            .unwrap(),
        bookmark: false,
    }
}

pub fn file_destination(dir: &TempDir) -> Arc<Destination> {
    let uri = format!("file://{}", dir.path().display());
    Arc::new(Destination::open(&uri, Duration::from_secs(5)).unwrap())
}

/// Deterministic, mildly compressible byte stream standing in for `zfs send`
/// output.
pub fn send_stream(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| {
            let word = (i / 8) as u64;
            word.wrapping_mul(0x9e37_79b9_7f4a_7c15).to_le_bytes()[i % 8]
        })
        .collect()
}

pub fn quick_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        max_backoff: Duration::from_millis(5),
    }
}

pub fn backup_options(
    work: &TempDir,
    volume_size: u64,
    compressor: Compressor,
    crypto: Option<JobCrypto>,
) -> BackupOptions {
    BackupOptions {
        volume_size,
        max_in_flight: 3,
        separator: '|',
        work_dir: work.path().to_path_buf(),
        stage: Arc::new(StageOptions {
            compressor,
            level: 3,
            crypto,
        }),
        retry: quick_retry(),
        failure_policy: FailurePolicy::FailFast,
        quiet: true,
    }
}

pub fn restore_options(work: &TempDir, crypto: Option<RestoreCrypto>) -> RestoreOptions {
    RestoreOptions {
        separator: '|',
        work_dir: work.path().to_path_buf(),
        max_in_flight: 3,
        retry: quick_retry(),
        crypto,
        quiet: true,
    }
}

pub fn job(
    dataset: &str,
    from: Option<SnapshotRef>,
    to: SnapshotRef,
    compressor: Compressor,
    volume_size: u64,
) -> JobInfo {
    JobInfo::new(dataset, from, to, compressor.id(), 3, None, None, volume_size)
}

/// Run a backup of `payload` and return the committed outcome.
pub async fn backup_payload(
    payload: &[u8],
    job: JobInfo,
    dests: &[Arc<Destination>],
    options: &BackupOptions,
) -> anyhow::Result<BackupOutcome> {
    run_backup(
        Cursor::new(payload.to_vec()),
        job,
        dests,
        options,
        &CancellationToken::new(),
    )
    .await
}
