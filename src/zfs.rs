//! Thin wrapper around the ZFS toolchain.
//!
//! Everything here talks to `zfs` subprocesses at their textual or stream
//! interface; no libzfs binding. The send stream is owned by [`SendStream`]
//! and the receive side by [`ReceiveSink`] so the orchestrator can kill and
//! reap them on every exit path.

use crate::manifest::SnapshotRef;
use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use std::process::Stdio;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

/// List the snapshots of `dataset`, oldest first.
///
/// # Errors
/// The dataset not existing, or `zfs` being unavailable.
pub async fn list_snapshots(dataset: &str) -> Result<Vec<SnapshotRef>> {
    list_refs(dataset, "snapshot").await
}

/// List the bookmarks of `dataset`, oldest first.
///
/// # Errors
/// Same as [`list_snapshots`].
pub async fn list_bookmarks(dataset: &str) -> Result<Vec<SnapshotRef>> {
    list_refs(dataset, "bookmark").await
}

async fn list_refs(dataset: &str, kind: &str) -> Result<Vec<SnapshotRef>> {
    let output = Command::new("zfs")
        .args([
            "list", "-H", "-p", "-d", "1", "-t", kind, "-o", "name,guid,createtxg,creation",
            "-s", "creation", dataset,
        ])
        .stdin(Stdio::null())
        .output()
        .await
        .context("spawn zfs list")?;

    if !output.status.success() {
        bail!(
            "zfs list -t {kind} {dataset}: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    parse_refs(&String::from_utf8_lossy(&output.stdout), kind == "bookmark")
}

fn parse_refs(stdout: &str, bookmark: bool) -> Result<Vec<SnapshotRef>> {
    stdout
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| parse_ref_line(line, bookmark))
        .collect()
}

fn parse_ref_line(line: &str, bookmark: bool) -> Result<SnapshotRef> {
    let fields: Vec<&str> = line.split('\t').collect();
    let [name, guid, txg, creation] = fields.as_slice() else {
        bail!("unexpected zfs list line: {line}");
    };

    let marker = if bookmark { '#' } else { '@' };
    let (dataset, short) = name
        .split_once(marker)
        .with_context(|| format!("no {marker} in {name}"))?;

    let guid: u64 = guid.parse().with_context(|| format!("bad guid in {line}"))?;
    let txg: u64 = txg.parse().with_context(|| format!("bad txg in {line}"))?;
    let creation: i64 = creation
        .parse()
        .with_context(|| format!("bad creation in {line}"))?;
    let creation = DateTime::<Utc>::from_timestamp(creation, 0)
        .with_context(|| format!("bad creation in {line}"))?;

    Ok(SnapshotRef {
        dataset: dataset.to_string(),
        name: short.to_string(),
        guid,
        txg,
        creation,
        bookmark,
    })
}

/// Resolve `dataset@snap` or `dataset#bookmark` to its identity.
///
/// # Errors
/// The reference not existing on the source.
pub async fn resolve_ref(full: &str) -> Result<SnapshotRef> {
    let (dataset, short, bookmark) = if let Some((ds, name)) = full.split_once('@') {
        (ds, name, false)
    } else if let Some((ds, name)) = full.split_once('#') {
        (ds, name, true)
    } else {
        bail!("{full}: expected dataset@snapshot or dataset#bookmark");
    };

    let refs = if bookmark {
        list_bookmarks(dataset).await?
    } else {
        list_snapshots(dataset).await?
    };

    refs.into_iter()
        .find(|r| r.name == short)
        .ok_or_else(|| anyhow!("{full}: not found on the source"))
}

/// A running `zfs send`, stdout owned by the splitter.
pub struct SendStream {
    child: Child,
    stdout: Option<ChildStdout>,
}

/// Start `zfs send [-i from] to`.
///
/// # Errors
/// `zfs` not being spawnable; send-time failures surface in [`SendStream::finish`].
pub fn send(from: Option<&SnapshotRef>, to: &SnapshotRef) -> Result<SendStream> {
    let mut cmd = Command::new("zfs");
    cmd.arg("send");

    if let Some(from) = from {
        cmd.arg("-i").arg(from.full_name());
    }

    cmd.arg(to.full_name())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("spawn zfs send")?;
    let stdout = child.stdout.take();

    Ok(SendStream { child, stdout })
}

impl SendStream {
    /// Take the stream to feed the splitter; callable once.
    ///
    /// # Errors
    /// Only if called twice.
    pub fn take_stdout(&mut self) -> Result<ChildStdout> {
        self.stdout
            .take()
            .ok_or_else(|| anyhow!("zfs send stdout already taken"))
    }

    /// Reap the process and fail if the send itself failed; called after the
    /// splitter saw EOF.
    ///
    /// # Errors
    /// Non-zero exit of `zfs send`, with its stderr.
    pub async fn finish(self) -> Result<()> {
        let output = self
            .child
            .wait_with_output()
            .await
            .context("wait for zfs send")?;

        if !output.status.success() {
            bail!(
                "zfs send failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(())
    }

    /// Kill the sender; used on cancellation and error paths.
    pub async fn abort(mut self) {
        let _ = self.child.kill().await;
    }
}

/// A running `zfs receive`, stdin owned by the restore pipeline.
pub struct ReceiveSink {
    child: Child,
    stdin: Option<ChildStdin>,
}

/// Start `zfs receive [-F] [-o prop=val]... target`.
///
/// # Errors
/// `zfs` not being spawnable.
pub fn receive(target: &str, force: bool, props: &[String]) -> Result<ReceiveSink> {
    let mut cmd = Command::new("zfs");
    cmd.arg("receive");

    if force {
        cmd.arg("-F");
    }

    for prop in props {
        cmd.arg("-o").arg(prop);
    }

    cmd.arg(target)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("spawn zfs receive")?;
    let stdin = child.stdin.take();

    Ok(ReceiveSink { child, stdin })
}

impl ReceiveSink {
    /// Take the stream the reassembled volumes are written into; callable
    /// once.
    ///
    /// # Errors
    /// Only if called twice.
    pub fn take_stdin(&mut self) -> Result<ChildStdin> {
        self.stdin
            .take()
            .ok_or_else(|| anyhow!("zfs receive stdin already taken"))
    }

    /// Close stdin (if still held) and reap the receiver.
    ///
    /// # Errors
    /// Non-zero exit of `zfs receive`, with its stderr.
    pub async fn finish(mut self) -> Result<()> {
        drop(self.stdin.take());

        let output = self
            .child
            .wait_with_output()
            .await
            .context("wait for zfs receive")?;

        if !output.status.success() {
            bail!(
                "zfs receive failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(())
    }

    /// Kill the receiver; used on cancellation and error paths.
    pub async fn abort(mut self) {
        drop(self.stdin.take());
        let _ = self.child.kill().await;
    }
}

/// `zfs bookmark snapshot bookmark`.
///
/// # Errors
/// Non-zero exit with stderr.
pub async fn bookmark(snapshot: &str, bookmark: &str) -> Result<()> {
    run_zfs(&["bookmark", snapshot, bookmark]).await
}

/// `zfs destroy name`, for snapshots and bookmarks.
///
/// # Errors
/// Non-zero exit with stderr.
pub async fn destroy(name: &str) -> Result<()> {
    run_zfs(&["destroy", name]).await
}

async fn run_zfs(args: &[&str]) -> Result<()> {
    let output = Command::new("zfs")
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("spawn zfs {}", args.first().unwrap_or(&"")))?;

    if !output.status.success() {
        bail!(
            "zfs {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_snapshot_lines() {
        let out = "tank/data@a\t11063544173240886123\t1024\t1753000000\n\
                   tank/data@b\t2233445566778899\t2048\t1753086400\n";
        let refs = parse_refs(out, false).unwrap();

        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].dataset, "tank/data");
        assert_eq!(refs[0].name, "a");
        assert_eq!(refs[0].guid, 11_063_544_173_240_886_123);
        assert_eq!(refs[0].txg, 1024);
        assert_eq!(refs[0].creation.timestamp(), 1_753_000_000);
        assert!(!refs[0].bookmark);
        assert_eq!(refs[1].name, "b");
    }

    #[test]
    fn test_parse_bookmark_line() {
        let out = "tank/data#base\t99887766\t512\t1753000000\n";
        let refs = parse_refs(out, true).unwrap();
        assert_eq!(refs[0].name, "base");
        assert!(refs[0].bookmark);
        assert_eq!(refs[0].full_name(), "tank/data#base");
    }

    #[test]
    fn test_parse_rejects_malformed_lines() {
        assert!(parse_refs("tank/data@a\tnot-a-guid\t1\t2\n", false).is_err());
        assert!(parse_refs("tank/data@a\t1\t2\n", false).is_err());
        // snapshot marker missing entirely
        assert!(parse_refs("tank/data\t1\t2\t3\n", false).is_err());
    }

    #[test]
    fn test_parse_empty_listing() {
        assert!(parse_refs("", false).unwrap().is_empty());
    }
}
