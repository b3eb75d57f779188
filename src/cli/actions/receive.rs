//! The `receive` action: locate the manifest(s), run the restore pipeline
//! into `zfs receive`, one invocation per manifest in the chain.

use crate::backends::Destination;
use crate::catalog;
use crate::cli::actions::Action;
use crate::cli::globals::GlobalArgs;
use crate::manifest::JobInfo;
use crate::restore::{self, RestoreOptions};
use crate::zfs;
use anyhow::{Context, Result, bail};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// # Errors
/// Missing backups, a broken chain, an absent incremental base at the
/// target, or any pipeline failure.
pub async fn handle(
    action: Action,
    globals: &GlobalArgs,
    cancel: &CancellationToken,
) -> Result<()> {
    let Action::Receive {
        source,
        auto,
        incremental,
        force,
        props,
        destinations,
        target,
    } = action
    else {
        bail!("not a receive action");
    };

    let crypto = globals.open_crypto()?;

    // mirrored destinations are equivalent for restore; the first reachable
    // one is used
    let uri = destinations
        .first()
        .ok_or_else(|| anyhow::anyhow!("no destination"))?;
    let dest = Arc::new(
        Destination::open(uri, globals.timeout)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("open destination {uri}"))?,
    );

    let stored = catalog::load_manifests(&dest, &globals.retry, cancel).await?;
    let infos = catalog::reconcile(stored)?;

    let chain = if auto {
        catalog::restore_chain(&infos, &source, None)?
    } else {
        let (dataset, snap) = source
            .split_once('@')
            .with_context(|| format!("{source}: expected dataset@snapshot"))?;

        let job = infos
            .iter()
            .rfind(|info| info.volume_name == dataset && info.to.name == snap)
            .ok_or_else(|| anyhow::anyhow!("no backup of {source} at {uri}"))?
            .clone();

        if let Some(from) = &job.from {
            if !incremental {
                bail!(
                    "{source} is an incremental backup (base {}); pass -i, or --auto to chain from the full backup",
                    from.name
                );
            }
            require_base_at_target(&target, &job).await?;
        }

        vec![job]
    };

    if job_needs_keys(&chain) && crypto.as_ref().is_none_or(|c| c.secrets.is_empty()) {
        bail!("these backups are encrypted; pass --secretKeyRingPath");
    }

    let options = RestoreOptions {
        separator: globals.separator,
        work_dir: globals.working_directory.clone(),
        max_in_flight: globals.max_in_flight,
        retry: globals.retry.clone(),
        crypto,
        quiet: globals.quiet,
    };

    for job in &chain {
        log::info!(
            "receiving {} into {target} ({} volumes)",
            job.base_name(globals.separator),
            job.volumes.len()
        );

        let mut sink = zfs::receive(&target, force, &props)?;
        let mut stdin = sink.take_stdin()?;

        let result = restore::run_restore(job, &dest, &mut stdin, &options, cancel).await;
        drop(stdin);

        match result {
            Ok(()) => sink.finish().await?,
            Err(err) => {
                sink.abort().await;
                return Err(err);
            }
        }
    }

    log::info!("restore into {target} complete");

    Ok(())
}

fn job_needs_keys(chain: &[JobInfo]) -> bool {
    chain.iter().any(|job| job.encrypt_to.is_some())
}

/// `-i`: the incremental's base must already exist at the target, as a
/// snapshot or bookmark, identified by GUID.
async fn require_base_at_target(target: &str, job: &JobInfo) -> Result<()> {
    let Some(from) = &job.from else {
        return Ok(());
    };

    let mut present = zfs::list_snapshots(target).await.unwrap_or_default();
    present.extend(zfs::list_bookmarks(target).await.unwrap_or_default());

    if !present.iter().any(|r| r.guid == from.guid) {
        bail!(
            "incremental base {} (guid {}) is not present at {target}",
            from.name,
            from.guid
        );
    }

    Ok(())
}
