//! The `list` action. Output goes to an injected writer so the JSON surface
//! is testable without capturing the process stdout.

use crate::backends::Destination;
use crate::catalog;
use crate::cli::actions::Action;
use crate::cli::globals::GlobalArgs;
use crate::manifest::JobInfo;
use anyhow::{Context, Result, bail};
use bytesize::ByteSize;
use chrono::{DateTime, SecondsFormat, Utc};
use fast_glob::glob_match;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// # Errors
/// Destination failures or unparsable manifests; an empty destination is not
/// an error.
pub async fn handle(
    action: Action,
    globals: &GlobalArgs,
    cancel: &CancellationToken,
    out: &mut dyn Write,
) -> Result<()> {
    let Action::List {
        destinations,
        volume_glob,
        before,
        after,
        json,
    } = action
    else {
        bail!("not a list action");
    };

    let dests: Result<Vec<Arc<Destination>>> = destinations
        .iter()
        .map(|uri| {
            Destination::open(uri, globals.timeout)
                .map(Arc::new)
                .map_err(|e| anyhow::anyhow!("{e}"))
                .with_context(|| format!("open destination {uri}"))
        })
        .collect();

    let stored = catalog::load_all(&dests?, &globals.retry, cancel).await?;
    let infos = catalog::reconcile(stored)?;

    let filtered: Vec<JobInfo> = infos
        .into_iter()
        .filter(|info| {
            volume_glob
                .as_ref()
                .is_none_or(|glob| glob_match(glob, &info.volume_name))
        })
        .filter(|info| before.is_none_or(|t| info.to.creation < t))
        .filter(|info| after.is_none_or(|t| info.to.creation > t))
        .collect();

    let groups = catalog::group_by_volume(filtered);

    if json {
        serde_json::to_writer_pretty(&mut *out, &groups).context("write listing")?;
        writeln!(out)?;
    } else {
        render_text(out, &groups)?;
    }

    Ok(())
}

fn render_text(out: &mut dyn Write, groups: &BTreeMap<String, Vec<JobInfo>>) -> Result<()> {
    if groups.is_empty() {
        writeln!(out, "no backups found")?;
        return Ok(());
    }

    for (volume, jobs) in groups {
        writeln!(out, "{volume}:")?;

        for job in jobs {
            let kind = match &job.from {
                Some(from) => format!("{} -> {}", from.key_name(), job.to.name),
                None => format!("full -> {}", job.to.name),
            };

            let stored: u64 = job.volumes.iter().map(|v| v.stored_size).sum();

            writeln!(
                out,
                "  {kind:<30} {:>3} volume(s) {:>10}  {}",
                job.volumes.len(),
                ByteSize(stored).to_string(),
                render_time(job.to.creation),
            )?;
        }
    }

    Ok(())
}

fn render_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::manifest::SnapshotRef;

    fn job(name: &str, guid: u64) -> JobInfo {
        JobInfo::new(
            "tank/data",
            None,
            SnapshotRef {
                dataset: "tank/data".to_string(),
                name: name.to_string(),
                guid,
                txg: guid,
                creation: DateTime::from_timestamp(1_753_000_000, 0).unwrap(),
                bookmark: false,
            },
            "zstd",
            6,
            None,
            None,
            1024,
        )
    }

    #[test]
    fn test_render_text_empty() {
        let mut out = Vec::new();
        render_text(&mut out, &BTreeMap::new()).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "no backups found\n");
    }

    #[test]
    fn test_render_text_groups() {
        let mut groups = BTreeMap::new();
        groups.insert("tank/data".to_string(), vec![job("a", 1)]);

        let mut out = Vec::new();
        render_text(&mut out, &groups).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("tank/data:"));
        assert!(text.contains("full -> a"));
        assert!(text.contains("2025-07-20T08:26:40Z"));
    }
}
