//! The `send` action: resolve the plan, spawn `zfs send`, run the backup
//! pipeline, report.

use crate::backends::Destination;
use crate::backup::{self, BackupOptions, BackupOutcome, stage::StageOptions};
use crate::catalog;
use crate::cli::actions::{Action, SendMode};
use crate::cli::globals::GlobalArgs;
use crate::manifest::{JobInfo, SnapshotRef};
use crate::planner::{self, Plan};
use crate::zfs;
use anyhow::{Context, Result, bail};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Azure Block Blobs cap a single PUT; volumes are uploaded in one shot.
const AZURE_SINGLE_PUT_LIMIT: u64 = 4750 * 1024 * 1024;

pub enum SendOutcome {
    Completed(BackupOutcome),
    /// The planner found nothing to do; surfaced as its own exit code.
    NoOp,
}

/// # Errors
/// Start-up validation, source/zfs failures, and destination failures per
/// the failure policy.
pub async fn handle(
    action: Action,
    globals: &GlobalArgs,
    cancel: &CancellationToken,
) -> Result<SendOutcome> {
    let Action::Send { mode, destinations } = action else {
        bail!("not a send action");
    };

    // everything that can fail without side effects fails here
    let crypto = globals.seal_crypto()?;

    let dests = open_destinations(&destinations, globals)?;

    for dest in &dests {
        if dest.scheme() == "azure" && globals.volume_size > AZURE_SINGLE_PUT_LIMIT {
            bail!(
                "--volsize exceeds the Azure single-upload limit ({} MiB)",
                AZURE_SINGLE_PUT_LIMIT / (1024 * 1024)
            );
        }
    }

    let (from, to) = match resolve_plan(&mode, &dests, globals, cancel).await? {
        Plan::NoOp => return Ok(SendOutcome::NoOp),
        Plan::Full { to } => (None, to),
        Plan::Incremental { from, to } => (Some(from), to),
    };

    log::info!(
        "sending {}{}",
        to.full_name(),
        from.as_ref()
            .map(|f| format!(" incremental from {}", f.full_name()))
            .unwrap_or_default()
    );

    let job = JobInfo::new(
        &to.dataset,
        from.clone(),
        to.clone(),
        globals.compressor.id(),
        globals.compression_level,
        globals.encrypt_to.clone(),
        globals.sign_from.clone(),
        globals.volume_size,
    );

    let options = BackupOptions {
        volume_size: globals.volume_size,
        max_in_flight: globals.max_in_flight,
        separator: globals.separator,
        work_dir: globals.working_directory.clone(),
        stage: Arc::new(StageOptions {
            compressor: globals.compressor,
            level: globals.compression_level,
            crypto,
        }),
        retry: globals.retry.clone(),
        failure_policy: globals.failure_policy,
        quiet: globals.quiet,
    };

    let mut stream = zfs::send(from.as_ref(), &to)?;
    let input = stream.take_stdout()?;

    let outcome = backup::run_backup(input, job, &dests, &options, cancel).await;

    match outcome {
        Ok(outcome) => {
            // the pipeline saw EOF; make sure the sender exited cleanly too
            stream.finish().await?;
            Ok(SendOutcome::Completed(outcome))
        }
        Err(err) => {
            stream.abort().await;
            Err(err)
        }
    }
}

fn open_destinations(uris: &[String], globals: &GlobalArgs) -> Result<Vec<Arc<Destination>>> {
    uris.iter()
        .map(|uri| {
            Destination::open(uri, globals.timeout)
                .map(Arc::new)
                .map_err(|e| anyhow::anyhow!("{e}"))
                .with_context(|| format!("open destination {uri}"))
        })
        .collect()
}

async fn resolve_plan(
    mode: &SendMode,
    dests: &[Arc<Destination>],
    globals: &GlobalArgs,
    cancel: &CancellationToken,
) -> Result<Plan> {
    match mode {
        SendMode::Full { source } => {
            let to = zfs::resolve_ref(source).await?;
            Ok(Plan::Full { to })
        }

        SendMode::Manual { from, to } => {
            let from = zfs::resolve_ref(from).await?;
            let to = resolve_snapshot_target(to).await?;
            if from.dataset != to.dataset {
                bail!(
                    "incremental base {} and target {} are different datasets",
                    from.full_name(),
                    to.full_name()
                );
            }
            Ok(Plan::Incremental { from, to })
        }

        SendMode::Smart {
            dataset,
            fallback_full,
        } => {
            let stored = catalog::load_all(dests, &globals.retry, cancel).await?;
            let manifests = catalog::reconcile(stored)?;
            let snapshots = zfs::list_snapshots(dataset).await?;
            let bookmarks = zfs::list_bookmarks(dataset).await?;

            planner::choose_plan(&manifests, &snapshots, &bookmarks, dataset, *fallback_full)
        }
    }
}

async fn resolve_snapshot_target(full: &str) -> Result<SnapshotRef> {
    let to = zfs::resolve_ref(full).await?;
    if to.bookmark {
        bail!("{full}: a bookmark cannot be a backup target");
    }
    Ok(to)
}
