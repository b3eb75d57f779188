//! The backup pipeline: splitter -> stage chain -> upload fan-out ->
//! manifest commit.
//!
//! The orchestrator is the sole writer of the manifest. Stages and uploads
//! publish per-volume facts through channels and the orchestrator folds them
//! in; the manifest object is written last, per destination, only after that
//! destination confirmed every volume.

pub mod scheduler;
pub mod splitter;
pub mod stage;

use crate::backends::Destination;
use crate::manifest::JobInfo;
use crate::progress::Progress;
use crate::retry::{BackendError, RetryPolicy, retry};
use anyhow::{Context, Result, bail};
use bytesize::ByteSize;
use scheduler::FailurePolicy;
use stage::StageOptions;
use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::Builder;
use tokio::io::AsyncRead;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub struct BackupOptions {
    /// Bytes per volume; 200 MiB unless `--volsize` says otherwise.
    pub volume_size: u64,
    /// Splitter window; the RAM+disk ceiling is this times `volume_size`.
    pub max_in_flight: usize,
    pub separator: char,
    pub work_dir: PathBuf,
    pub stage: Arc<StageOptions>,
    pub retry: RetryPolicy,
    pub failure_policy: FailurePolicy,
    pub quiet: bool,
}

pub struct BackupOutcome {
    pub job: JobInfo,
    /// Destinations holding a complete copy plus the manifest.
    pub written: Vec<String>,
    /// Destinations that failed, with their first error.
    pub failed: BTreeMap<String, String>,
}

/// Run one backup job end to end.
///
/// `input` is the raw send stream (the CLI wires `zfs send` stdout, tests
/// wire whatever they like); `job` carries the source identity and stage
/// options and gets its volume list and timestamps folded in here.
///
/// # Errors
/// Pipeline failures, cancellation, or — depending on the failure policy —
/// destination failures. Under continue-others a partial success returns
/// `Ok` as long as one destination committed; the rest are in `failed`.
pub async fn run_backup<R>(
    input: R,
    mut job: JobInfo,
    destinations: &[Arc<Destination>],
    options: &BackupOptions,
    cancel: &CancellationToken,
) -> Result<BackupOutcome>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    if destinations.is_empty() {
        bail!("no destinations");
    }

    let progress = Progress::for_upload(options.quiet);

    let slots = Arc::new(Semaphore::new(options.max_in_flight));
    let (spill_tx, spill_rx) = mpsc::channel(options.max_in_flight);
    let (staged_tx, staged_rx) = mpsc::channel(options.max_in_flight);

    let splitter = tokio::spawn({
        let work_dir = options.work_dir.clone();
        let volume_size = options.volume_size;
        let slots = slots.clone();
        let cancel = cancel.clone();
        async move {
            splitter::split_stream(input, volume_size, &work_dir, slots, spill_tx, cancel).await
        }
    });

    let stages = tokio::spawn(pump_stages(
        spill_rx,
        staged_tx,
        options.stage.clone(),
        options.work_dir.clone(),
    ));

    let report = scheduler::run_uploads(
        staged_rx,
        destinations,
        &job,
        options.separator,
        &options.retry,
        options.failure_policy,
        cancel,
        &progress,
    )
    .await?;

    let split_result = splitter.await.context("splitter task")?;
    let stage_result = stages.await.context("stage task")?;

    progress.done();

    // a destination failure under fail-fast is the root cause; the splitter,
    // the stages and the other destinations only report the cancellation it
    // triggered
    if options.failure_policy == FailurePolicy::FailFast && !report.failed.is_empty() {
        let (uri, err) = report
            .failed
            .iter()
            .find(|(_, e)| !e.contains("cancelled"))
            .or_else(|| report.failed.iter().next())
            .map(|(uri, err)| (uri.clone(), err.clone()))
            .unwrap_or_default();
        bail!("destination {uri} failed: {err}");
    }

    let produced = split_result?;
    let mut records = stage_result?;

    if records.len() as u64 != produced {
        bail!(
            "pipeline accounting mismatch: {produced} volumes produced, {} staged",
            records.len()
        );
    }

    let failed = report.failed;

    if failed.len() == destinations.len() {
        let summary: Vec<String> = failed.iter().map(|(d, e)| format!("{d}: {e}")).collect();
        bail!("every destination failed: {}", summary.join("; "));
    }

    records.sort_by_key(|r| r.index);
    job.volumes = records;
    job.incomplete_destinations = failed.keys().cloned().collect();
    job.finish();

    // the atomic-commit point: each surviving destination gets the manifest
    // only now, after confirming every volume
    let mut written = Vec::new();
    let mut failed = failed;

    for dest in destinations {
        if failed.contains_key(dest.uri()) {
            continue;
        }

        match commit_manifest(dest, &job, options, cancel).await {
            Ok(()) => written.push(dest.uri().to_string()),
            Err(err) => {
                log::error!("manifest upload to {} failed: {err}", dest.uri());
                failed.insert(dest.uri().to_string(), err.to_string());
            }
        }
    }

    if written.is_empty() {
        let summary: Vec<String> = failed.iter().map(|(d, e)| format!("{d}: {e}")).collect();
        bail!("no destination committed: {}", summary.join("; "));
    }

    if options.failure_policy == FailurePolicy::FailFast && !failed.is_empty() {
        let summary: Vec<String> = failed.iter().map(|(d, e)| format!("{d}: {e}")).collect();
        bail!("destination failed: {}", summary.join("; "));
    }

    log::info!(
        "backup of {} committed to {} destination(s): {} volumes, {} uploaded",
        job.to.full_name(),
        written.len(),
        job.volumes.len(),
        ByteSize(report.bytes_uploaded)
    );

    Ok(BackupOutcome {
        job,
        written,
        failed,
    })
}

/// Stage volumes as they arrive, one task per in-flight volume, and forward
/// them to the scheduler. Returns the per-volume records for the manifest.
async fn pump_stages(
    mut spilled: mpsc::Receiver<splitter::SpilledVolume>,
    staged_tx: mpsc::Sender<stage::StagedVolume>,
    options: Arc<StageOptions>,
    work_dir: PathBuf,
) -> Result<Vec<crate::manifest::VolumeRecord>> {
    let mut records = Vec::new();
    let mut tasks: JoinSet<Result<stage::StagedVolume>> = JoinSet::new();
    let mut input_open = true;

    // compression and encryption are CPU-bound; don't oversubscribe the
    // blocking pool beyond the physical cores
    let workers = Arc::new(Semaphore::new(num_cpus::get_physical().max(1)));

    loop {
        tokio::select! {
            received = spilled.recv(), if input_open => {
                match received {
                    Some(volume) => {
                        let worker = workers
                            .clone()
                            .acquire_owned()
                            .await
                            .context("stage workers closed")?;
                        let options = options.clone();
                        let work_dir = work_dir.clone();
                        tasks.spawn(async move {
                            let staged = stage::stage_volume(volume, options, work_dir).await;
                            drop(worker);
                            staged
                        });
                    }
                    None => input_open = false,
                }
            }

            joined = tasks.join_next(), if !tasks.is_empty() => {
                let Some(joined) = joined else { continue };
                let staged = joined.context("stage task")??;

                records.push(staged.record.clone());
                if staged_tx.send(staged).await.is_err() {
                    bail!("upload scheduler went away");
                }
            }

            else => break,
        }
    }

    Ok(records)
}

async fn commit_manifest(
    dest: &Destination,
    job: &JobInfo,
    options: &BackupOptions,
    cancel: &CancellationToken,
) -> Result<()> {
    let bytes = job.to_vec()?;
    let key = job.manifest_key(options.separator);

    let mut temp = Builder::new()
        .prefix("zbak-manifest.")
        .tempfile_in(&options.work_dir)
        .context("create manifest temp file")?;
    temp.write_all(&bytes).context("write manifest temp file")?;

    let mut md5 = md5::Context::new();
    md5.consume(&bytes);
    let md5_hex = crate::backends::s3::write_hex_bytes(md5.compute().as_ref());

    let (file, path) = temp.into_parts();
    drop(file);

    let size = bytes.len() as u64;
    let what = format!("manifest {key} -> {}", dest.uri());

    retry(&options.retry, cancel, &what, || {
        let path = &path;
        let key = &key;
        let md5_hex = &md5_hex;
        async move {
            dest.upload(key, path, size, Some(md5_hex.as_str()))
                .await
                .map(|_| ())
        }
    })
    .await
    .map_err(|e: BackendError| anyhow::anyhow!("{e}"))?;

    Ok(())
}
