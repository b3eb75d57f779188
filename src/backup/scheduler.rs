//! Fan-out of finalized volumes to every destination.
//!
//! One bounded worker pool per destination (the backend's
//! `max_parallel_uploads` hint), one task per (volume, destination), shared
//! retry policy around each task. A volume's staged file is released only
//! after the last destination is done with it; the in-flight permit rides
//! along, so releasing the file is also what re-opens the splitter's window.

use crate::backends::Destination;
use crate::backup::stage::StagedVolume;
use crate::manifest::JobInfo;
use crate::progress::Progress;
use crate::retry::{BackendError, RetryPolicy, retry};
use anyhow::{Result, bail};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use tempfile::TempPath;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// What a post-retry destination failure does to the rest of the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Abort the whole job on the first destination that fails.
    FailFast,
    /// Keep the surviving destinations going and record the failure.
    ContinueOthers,
}

impl FromStr for FailurePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fail-fast" => Ok(Self::FailFast),
            "continue-others" => Ok(Self::ContinueOthers),
            other => bail!("unknown failure policy: {other} (fail-fast, continue-others)"),
        }
    }
}

/// Aggregate outcome of the fan-out.
#[derive(Debug, Default)]
pub struct SchedulerReport {
    /// First post-retry error per destination URI.
    pub failed: BTreeMap<String, String>,
    /// Volumes confirmed by every destination that was still live.
    pub confirmed: u64,
    pub bytes_uploaded: u64,
}

/// The staged payload plus everything that must stay alive until the last
/// destination acknowledges it.
struct InFlight {
    _path_guard: TempPath,
    _permit: OwnedSemaphorePermit,
    path: std::path::PathBuf,
}

struct TaskDone {
    dest: String,
    index: u64,
    bytes: u64,
    result: Result<(), BackendError>,
}

/// Drain `staged` volumes, uploading each to every live destination.
///
/// Returns once every spawned upload settled. Under
/// [`FailurePolicy::FailFast`] the first destination failure cancels the
/// token, which also stops the splitter upstream.
///
/// # Errors
/// Task join failures only; destination outcomes are in the report.
pub async fn run_uploads(
    mut staged: mpsc::Receiver<StagedVolume>,
    destinations: &[Arc<Destination>],
    job: &JobInfo,
    separator: char,
    policy: &RetryPolicy,
    failure_policy: FailurePolicy,
    cancel: &CancellationToken,
    progress: &Progress,
) -> Result<SchedulerReport> {
    let pools: Vec<Arc<Semaphore>> = destinations
        .iter()
        .map(|d| Arc::new(Semaphore::new(d.max_parallel_uploads())))
        .collect();

    let mut report = SchedulerReport::default();
    let mut tasks: JoinSet<TaskDone> = JoinSet::new();
    // volume index -> (outstanding destinations, failed somewhere)
    let mut outstanding: HashMap<u64, (usize, bool)> = HashMap::new();
    let mut input_open = true;

    loop {
        tokio::select! {
            received = staged.recv(), if input_open => {
                match received {
                    Some(volume) => {
                        let index = volume.record.index;
                        let spawned = spawn_volume(
                            &mut tasks,
                            volume,
                            destinations,
                            &pools,
                            job,
                            separator,
                            policy,
                            cancel,
                            &report.failed,
                        );

                        // a volume with no live destination left is dropped
                        // on the floor; its temp file went with it
                        if spawned > 0 {
                            outstanding.insert(index, (spawned, false));
                        }
                    }
                    None => input_open = false,
                }
            }

            joined = tasks.join_next(), if !tasks.is_empty() => {
                let Some(joined) = joined else { continue };
                let done = joined?;
                settle(&mut report, &mut outstanding, done, failure_policy, cancel, progress);
            }

            else => break,
        }
    }

    Ok(report)
}

#[allow(clippy::too_many_arguments)]
fn spawn_volume(
    tasks: &mut JoinSet<TaskDone>,
    volume: StagedVolume,
    destinations: &[Arc<Destination>],
    pools: &[Arc<Semaphore>],
    job: &JobInfo,
    separator: char,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    failed: &BTreeMap<String, String>,
) -> usize {
    let StagedVolume {
        record,
        path,
        permit,
    } = volume;

    let key = job.volume_key(separator, &record);
    let in_flight = Arc::new(InFlight {
        path: path.to_path_buf(),
        _path_guard: path,
        _permit: permit,
    });

    let mut spawned = 0;

    for (dest, pool) in destinations.iter().zip(pools) {
        if failed.contains_key(dest.uri()) {
            continue;
        }

        let dest = dest.clone();
        let pool = pool.clone();
        let key = key.clone();
        let record = record.clone();
        let in_flight = in_flight.clone();
        let policy = policy.clone();
        let cancel = cancel.clone();

        tasks.spawn(async move {
            let result = upload_one(&dest, &pool, &key, &record, &in_flight, &policy, &cancel).await;

            TaskDone {
                dest: dest.uri().to_string(),
                index: record.index,
                bytes: record.stored_size,
                result,
            }
        });

        spawned += 1;
    }

    spawned
}

async fn upload_one(
    dest: &Destination,
    pool: &Semaphore,
    key: &str,
    record: &crate::manifest::VolumeRecord,
    in_flight: &InFlight,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<(), BackendError> {
    let _worker = tokio::select! {
        () = cancel.cancelled() => {
            return Err(BackendError::Permanent("cancelled".to_string()));
        }
        permit = pool.acquire() => permit
            .map_err(|_| BackendError::Permanent("worker pool closed".to_string()))?,
    };

    let what = format!("upload {key} -> {}", dest.uri());

    retry(policy, cancel, &what, || async {
        let etag = dest
            .upload(key, &in_flight.path, record.stored_size, Some(record.md5.as_str()))
            .await?;

        // a verifying backend that reports a different digest than ours is
        // an integrity failure; retry re-sends the payload
        if dest.verifies_md5() && !etag.is_empty() && etag != record.md5 {
            return Err(BackendError::Transient(format!(
                "{what}: backend digest {etag} != {}",
                record.md5
            )));
        }

        Ok(())
    })
    .await
}

fn settle(
    report: &mut SchedulerReport,
    outstanding: &mut HashMap<u64, (usize, bool)>,
    done: TaskDone,
    failure_policy: FailurePolicy,
    cancel: &CancellationToken,
    progress: &Progress,
) {
    let Some(entry) = outstanding.get_mut(&done.index) else {
        return;
    };

    match done.result {
        Ok(()) => {
            report.bytes_uploaded += done.bytes;
            progress.add_bytes(done.bytes);
            log::info!("volume {} confirmed by {}", done.index, done.dest);
        }
        Err(err) => {
            entry.1 = true;
            log::error!("volume {} failed at {}: {err}", done.index, done.dest);

            report
                .failed
                .entry(done.dest.clone())
                .or_insert_with(|| err.to_string());

            if failure_policy == FailurePolicy::FailFast {
                cancel.cancel();
            }
        }
    }

    entry.0 -= 1;
    if entry.0 == 0 {
        let (_, failed_somewhere) = outstanding.remove(&done.index).unwrap_or((0, true));
        if !failed_somewhere {
            report.confirmed += 1;
            log::debug!("volume {} released", done.index);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::manifest::{SnapshotRef, VolumeRecord};
    use chrono::DateTime;
    use std::io::Write;
    use tempfile::{Builder, TempDir};

    #[test]
    fn test_failure_policy_parse() {
        assert_eq!(
            "fail-fast".parse::<FailurePolicy>().unwrap(),
            FailurePolicy::FailFast
        );
        assert_eq!(
            "continue-others".parse::<FailurePolicy>().unwrap(),
            FailurePolicy::ContinueOthers
        );
        assert!("explode".parse::<FailurePolicy>().is_err());
    }

    fn snap(name: &str, guid: u64) -> SnapshotRef {
        SnapshotRef {
            dataset: "tank/data".to_string(),
            name: name.to_string(),
            guid,
            txg: guid,
            creation: DateTime::from_timestamp(1_753_000_000, 0).unwrap(),
            bookmark: false,
        }
    }

    fn staged(dir: &TempDir, index: u64, payload: &[u8]) -> StagedVolume {
        let mut file = Builder::new().tempfile_in(dir.path()).unwrap();
        file.write_all(payload).unwrap();
        let (_, path) = file.into_parts();

        let slots = Arc::new(Semaphore::new(8));
        let permit = slots.try_acquire_owned().unwrap();

        let mut md5 = md5::Context::new();
        md5.consume(payload);
        let mut sha = ring::digest::Context::new(&ring::digest::SHA256);
        sha.update(payload);

        StagedVolume {
            record: VolumeRecord {
                index,
                raw_size: payload.len() as u64,
                stored_size: payload.len() as u64,
                md5: crate::backends::s3::write_hex_bytes(md5.compute().as_ref()),
                sha256: crate::backends::s3::write_hex_bytes(sha.finish().as_ref()),
                extension: String::new(),
            },
            path,
            permit,
        }
    }

    #[tokio::test]
    async fn test_fan_out_to_two_file_destinations() {
        let work = TempDir::new().unwrap();
        let store_a = TempDir::new().unwrap();
        let store_b = TempDir::new().unwrap();

        let dests: Vec<Arc<Destination>> = [&store_a, &store_b]
            .iter()
            .map(|d| {
                let uri = format!("file://{}", d.path().display());
                Arc::new(Destination::open(&uri, std::time::Duration::from_secs(5)).unwrap())
            })
            .collect();

        let job = JobInfo::new("tank/data", None, snap("a", 1), "none", 0, None, None, 1024);

        let (tx, rx) = mpsc::channel(8);
        tx.send(staged(&work, 0, b"volume zero")).await.unwrap();
        tx.send(staged(&work, 1, b"volume one")).await.unwrap();
        drop(tx);

        let report = run_uploads(
            rx,
            &dests,
            &job,
            '|',
            &RetryPolicy::default(),
            FailurePolicy::FailFast,
            &CancellationToken::new(),
            &Progress::default(),
        )
        .await
        .unwrap();

        assert!(report.failed.is_empty());
        assert_eq!(report.confirmed, 2);
        assert_eq!(report.bytes_uploaded, 21 * 2);

        for store in [&store_a, &store_b] {
            assert!(store.path().join("tank/data||a|0").is_file());
            assert!(store.path().join("tank/data||a|1").is_file());
        }
    }

    #[tokio::test]
    async fn test_staged_files_released_after_fan_out() {
        let work = TempDir::new().unwrap();
        let store = TempDir::new().unwrap();
        let uri = format!("file://{}", store.path().display());
        let dests = vec![Arc::new(
            Destination::open(&uri, std::time::Duration::from_secs(5)).unwrap(),
        )];

        let job = JobInfo::new("tank/data", None, snap("a", 1), "none", 0, None, None, 1024);

        let volume = staged(&work, 0, b"payload");
        let staged_path = volume.path.to_path_buf();
        assert!(staged_path.exists());

        let (tx, rx) = mpsc::channel(2);
        tx.send(volume).await.unwrap();
        drop(tx);

        let report = run_uploads(
            rx,
            &dests,
            &job,
            '|',
            &RetryPolicy::default(),
            FailurePolicy::ContinueOthers,
            &CancellationToken::new(),
            &Progress::default(),
        )
        .await
        .unwrap();

        assert_eq!(report.confirmed, 1);
        assert!(!staged_path.exists(), "temp file must be gone after release");
    }
}
