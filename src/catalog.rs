//! Reading manifests back from destinations: listing, duplicate
//! reconciliation, and restore-chain assembly. Shared by `list`, the smart
//! planner and the restore pipeline so they all see the same catalog.

use crate::backends::Destination;
use crate::manifest::{JobInfo, MANIFEST_SUFFIX};
use crate::retry::{BackendError, RetryPolicy, retry};
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

/// A manifest as found at one destination.
#[derive(Debug, Clone)]
pub struct StoredManifest {
    pub info: JobInfo,
    pub modified: DateTime<Utc>,
    pub destination: String,
}

/// Fetch and parse every manifest at one destination.
///
/// A destination with no manifests (or no container yet) yields an empty
/// catalog; that is how a first backup starts.
///
/// # Errors
/// Listing/download failures after retries, or unparsable manifests.
pub async fn load_manifests(
    dest: &Destination,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Vec<StoredManifest>> {
    let objects = match retry(policy, cancel, "list manifests", || dest.list()).await {
        Ok(objects) => objects,
        Err(err) if err.is_not_found() => Vec::new(),
        Err(err) => return Err(err).with_context(|| format!("list {}", dest.uri())),
    };

    let mut manifests = Vec::new();

    for object in objects {
        if !object.key.ends_with(MANIFEST_SUFFIX) {
            continue;
        }

        let bytes = retry(policy, cancel, &format!("fetch {}", object.key), || {
            fetch_object(dest, &object.key)
        })
        .await
        .with_context(|| format!("download {} from {}", object.key, dest.uri()))?;

        let info = JobInfo::from_slice(&bytes)
            .with_context(|| format!("{} at {}", object.key, dest.uri()))?;

        manifests.push(StoredManifest {
            info,
            modified: object.modified,
            destination: dest.uri().to_string(),
        });
    }

    Ok(manifests)
}

async fn fetch_object(dest: &Destination, key: &str) -> Result<Vec<u8>, BackendError> {
    let mut reader = dest.download(key).await?;
    let mut bytes = Vec::new();
    reader
        .read_to_end(&mut bytes)
        .await
        .map_err(|e| BackendError::from_io(&e, "read object"))?;
    Ok(bytes)
}

/// Fetch manifests from every destination and merge them.
///
/// # Errors
/// As [`load_manifests`].
pub async fn load_all(
    dests: &[Arc<Destination>],
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Vec<StoredManifest>> {
    let mut all = Vec::new();
    for dest in dests {
        all.extend(load_manifests(dest, policy, cancel).await?);
    }
    Ok(all)
}

/// Collapse duplicates: manifests describing the same logical job (mirrored
/// destinations, or re-written manifests) are presented once, newest by
/// mtime winning. Duplicates must agree on every volume digest.
///
/// The result is ordered by `to` snapshot creation.
///
/// # Errors
/// Digest disagreement between copies of the same job.
pub fn reconcile(mut manifests: Vec<StoredManifest>) -> Result<Vec<JobInfo>> {
    // newest first so the survivor of each duplicate group is the newest
    manifests.sort_by(|a, b| b.modified.cmp(&a.modified));

    let mut jobs: Vec<StoredManifest> = Vec::new();

    for candidate in manifests {
        match jobs.iter().find(|kept| kept.info.same_job(&candidate.info)) {
            Some(kept) => {
                if !kept.info.volumes_agree(&candidate.info) {
                    bail!(
                        "manifests for {} disagree on volume digests between {} and {}",
                        candidate.info.base_name('|'),
                        kept.destination,
                        candidate.destination
                    );
                }
            }
            None => jobs.push(candidate),
        }
    }

    let mut infos: Vec<JobInfo> = jobs.into_iter().map(|m| m.info).collect();
    infos.sort_by_key(|info| info.to.creation);
    Ok(infos)
}

/// Group reconciled jobs by dataset, each group ordered by `to` creation.
#[must_use]
pub fn group_by_volume(infos: Vec<JobInfo>) -> BTreeMap<String, Vec<JobInfo>> {
    let mut groups: BTreeMap<String, Vec<JobInfo>> = BTreeMap::new();
    for info in infos {
        groups.entry(info.volume_name.clone()).or_default().push(info);
    }
    // input is creation-ordered, groups inherit that
    groups
}

/// Assemble the ordered restore chain for `dataset`: the newest full backup
/// at or before the target, followed by every incremental up to the target
/// (`None` targets the newest backup).
///
/// # Errors
/// No backups, an unknown target snapshot, or a broken incremental link.
pub fn restore_chain(
    infos: &[JobInfo],
    dataset: &str,
    target_snap: Option<&str>,
) -> Result<Vec<JobInfo>> {
    let jobs: Vec<&JobInfo> = infos
        .iter()
        .filter(|info| info.volume_name == dataset)
        .collect();

    if jobs.is_empty() {
        bail!("no backups of {dataset} at the destination");
    }

    let tip = match target_snap {
        Some(name) => *jobs
            .iter()
            .rfind(|info| info.to.name == name)
            .ok_or_else(|| {
                anyhow::anyhow!("no backup of {dataset}@{name} at the destination")
            })?,
        None => *jobs.last().unwrap_or(&jobs[0]),
    };

    // walk from the tip back to a full backup via GUID links
    let mut chain = vec![tip.clone()];
    let mut cursor = tip;

    while let Some(from) = &cursor.from {
        if chain.len() > jobs.len() {
            bail!("cyclic incremental chain for {dataset}");
        }

        let parent = jobs
            .iter()
            .copied()
            .find(|info| info.to.guid == from.guid)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "broken chain for {dataset}: no backup ends at {} (guid {})",
                    from.name,
                    from.guid
                )
            })?;
        chain.push(parent.clone());
        cursor = parent;
    }

    chain.reverse();
    Ok(chain)
}
