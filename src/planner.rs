//! Smart incremental planning: reconcile what the destination already holds
//! with what exists on the source, and decide full vs incremental vs nothing.

use crate::manifest::{JobInfo, SnapshotRef};
use anyhow::{Result, bail};

/// The planner's verdict. `NoOp` is a first-class non-error outcome surfaced
/// as its own exit code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    NoOp,
    Full { to: SnapshotRef },
    Incremental { from: SnapshotRef, to: SnapshotRef },
}

/// Pick the next backup for `dataset`.
///
/// `manifests` is the reconciled destination catalog; `snapshots` and
/// `bookmarks` are the source state, oldest first. The newest manifest's `to`
/// becomes the incremental base; the newest source snapshot becomes the new
/// target (bookmarks are never targets). Bookmarks are preferred over
/// snapshots as the base since they are cheaper to retain.
///
/// With no prior manifest the plan is a full backup when `fallback_full` is
/// set (`--auto`) and an error otherwise (`--increment` asked for an
/// incremental that cannot exist).
///
/// # Errors
/// No snapshots on the source, a missing incremental base, or `--increment`
/// with no prior backup.
pub fn choose_plan(
    manifests: &[JobInfo],
    snapshots: &[SnapshotRef],
    bookmarks: &[SnapshotRef],
    dataset: &str,
    fallback_full: bool,
) -> Result<Plan> {
    let Some(target) = snapshots.iter().max_by_key(|s| s.creation) else {
        bail!("{dataset} has no snapshots to back up");
    };

    let base = manifests
        .iter()
        .filter(|info| info.volume_name == dataset)
        .max_by_key(|info| info.to.creation);

    let Some(base) = base else {
        if fallback_full {
            return Ok(Plan::Full { to: target.clone() });
        }
        bail!("no previous backup of {dataset} at the destination; run a full backup first");
    };

    if base.to.guid == target.guid {
        return Ok(Plan::NoOp);
    }

    if target.creation <= base.to.creation {
        // destination is already ahead of every local snapshot
        return Ok(Plan::NoOp);
    }

    // the base must still exist on the source; bookmarks win the tie because
    // holding a bookmark costs almost nothing
    let from = bookmarks
        .iter()
        .find(|b| b.guid == base.to.guid)
        .or_else(|| snapshots.iter().find(|s| s.guid == base.to.guid));

    let Some(from) = from else {
        if fallback_full {
            log::warn!(
                "incremental base {}@{} (guid {}) is gone from the source, taking a full backup",
                dataset,
                base.to.name,
                base.to.guid
            );
            return Ok(Plan::Full { to: target.clone() });
        }
        bail!(
            "incremental base {}@{} (guid {}) no longer exists on the source (snapshot or bookmark)",
            dataset,
            base.to.name,
            base.to.guid
        );
    };

    Ok(Plan::Incremental {
        from: from.clone(),
        to: target.clone(),
    })
}
