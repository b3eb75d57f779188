//! Remote filesystem adapter over the OpenSSH client.
//!
//! Keeps no persistent connection: every operation is one `ssh` invocation in
//! batch mode, so host keys and agents are the operator's business, exactly
//! as with any other scripted ssh use. Uploads land under a temporary name
//! and are `mv`ed into place, mirroring the `file://` adapter's durability
//! story.

use crate::backends::{Backend, ObjectReader, ParsedUri, RemoteObject};
use crate::retry::BackendError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    path::Path,
    pin::Pin,
    process::Stdio,
    task::{Context, Poll},
};
use tokio::{
    io::{AsyncRead, ReadBuf},
    process::{Child, ChildStdout, Command},
};

pub struct SshBackend {
    /// `user@host` or bare host.
    target: String,
    /// Absolute directory on the remote side.
    base: String,
}

impl SshBackend {
    /// # Errors
    /// `Permanent` when the URI has no usable path.
    pub fn open(parsed: &ParsedUri) -> Result<Self, BackendError> {
        if parsed.prefix.is_empty() {
            return Err(BackendError::Permanent(
                "ssh:// destinations need a path: ssh://user@host/dir".to_string(),
            ));
        }

        let target = match &parsed.user {
            Some(user) => format!("{user}@{}", parsed.container),
            None => parsed.container.clone(),
        };

        Ok(Self {
            target,
            base: format!("/{}", parsed.prefix),
        })
    }

    fn command(&self, remote: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg(&self.target)
            .arg(remote)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    fn remote_path(&self, key: &str) -> String {
        format!("{}/{key}", self.base)
    }
}

/// Single-quote a path for the remote shell.
fn quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', r"'\''"))
}

fn classify_exit(what: &str, code: Option<i32>, stderr: &str) -> BackendError {
    let detail = stderr.trim();
    // 255 is the ssh client itself failing (connection, auth transport),
    // anything else came from the remote command
    if code == Some(255) {
        BackendError::Transient(format!("{what}: ssh: {detail}"))
    } else {
        BackendError::Permanent(format!("{what}: {detail}"))
    }
}

#[async_trait]
impl Backend for SshBackend {
    fn scheme(&self) -> &'static str {
        "ssh"
    }

    fn max_parallel_uploads(&self) -> usize {
        2
    }

    async fn upload(
        &self,
        key: &str,
        source: &Path,
        _size: u64,
        md5_hex: Option<&str>,
    ) -> Result<String, BackendError> {
        let target = self.remote_path(key);
        let partial = format!("{target}.partial");
        let dir = target
            .rsplit_once('/')
            .map_or("/", |(dir, _)| dir)
            .to_string();

        let remote = format!(
            "mkdir -p {} && cat > {} && mv {} {}",
            quote(&dir),
            quote(&partial),
            quote(&partial),
            quote(&target)
        );

        let mut cmd = self.command(&remote);
        cmd.stdin(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| BackendError::from_io(&e, "spawn ssh"))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::Permanent("ssh stdin unavailable".to_string()))?;
        let mut file = tokio::fs::File::open(source)
            .await
            .map_err(|e| BackendError::from_io(&e, "open payload"))?;

        let copied = tokio::io::copy(&mut file, &mut stdin).await;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| BackendError::from_io(&e, "ssh"))?;

        if !output.status.success() {
            return Err(classify_exit(
                &format!("upload {key}"),
                output.status.code(),
                &String::from_utf8_lossy(&output.stderr),
            ));
        }

        copied.map_err(|e| BackendError::from_io(&e, "stream payload"))?;

        Ok(md5_hex.unwrap_or_default().to_string())
    }

    async fn download(&self, key: &str) -> Result<ObjectReader, BackendError> {
        let path = self.remote_path(key);

        // probe first so an absent object classifies as NotFound instead of
        // surfacing as a short read
        let probe = self
            .command(&format!("test -f {}", quote(&path)))
            .output()
            .await
            .map_err(|e| BackendError::from_io(&e, "ssh"))?;
        if !probe.status.success() {
            if probe.status.code() == Some(1) {
                return Err(BackendError::NotFound(format!("download {key}")));
            }
            return Err(classify_exit(
                &format!("download {key}"),
                probe.status.code(),
                &String::from_utf8_lossy(&probe.stderr),
            ));
        }

        let mut cmd = self.command(&format!("cat {}", quote(&path)));
        cmd.kill_on_drop(true);
        let mut child = cmd
            .spawn()
            .map_err(|e| BackendError::from_io(&e, "spawn ssh"))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Permanent("ssh stdout unavailable".to_string()))?;

        Ok(Box::pin(SshReader { _child: child, stdout }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>, BackendError> {
        let remote = format!(
            "find {} -type f -printf '%P\\t%s\\t%T@\\n' 2>/dev/null || true",
            quote(&self.base)
        );

        let output = self
            .command(&remote)
            .output()
            .await
            .map_err(|e| BackendError::from_io(&e, "ssh"))?;

        if !output.status.success() {
            return Err(classify_exit(
                "list",
                output.status.code(),
                &String::from_utf8_lossy(&output.stderr),
            ));
        }

        parse_listing(&String::from_utf8_lossy(&output.stdout), prefix)
    }

    async fn delete(&self, keys: &[String]) -> Result<(), BackendError> {
        if keys.is_empty() {
            return Ok(());
        }

        let quoted: Vec<String> = keys.iter().map(|k| quote(&self.remote_path(k))).collect();
        let output = self
            .command(&format!("rm -f -- {}", quoted.join(" ")))
            .output()
            .await
            .map_err(|e| BackendError::from_io(&e, "ssh"))?;

        if !output.status.success() {
            return Err(classify_exit(
                "delete",
                output.status.code(),
                &String::from_utf8_lossy(&output.stderr),
            ));
        }

        Ok(())
    }
}

fn parse_listing(stdout: &str, prefix: &str) -> Result<Vec<RemoteObject>, BackendError> {
    let mut objects = Vec::new();

    for line in stdout.lines().filter(|l| !l.is_empty()) {
        let mut fields = line.split('\t');
        let (Some(key), Some(size), Some(mtime)) =
            (fields.next(), fields.next(), fields.next())
        else {
            return Err(BackendError::Permanent(format!("bad listing line: {line}")));
        };

        if !key.starts_with(prefix) || key.ends_with(".partial") {
            continue;
        }

        let size: u64 = size
            .parse()
            .map_err(|_| BackendError::Permanent(format!("bad size in: {line}")))?;
        let epoch: f64 = mtime
            .parse()
            .map_err(|_| BackendError::Permanent(format!("bad mtime in: {line}")))?;
        let modified = DateTime::<Utc>::from_timestamp(epoch as i64, 0)
            .ok_or_else(|| BackendError::Permanent(format!("bad mtime in: {line}")))?;

        objects.push(RemoteObject {
            key: key.to_string(),
            size,
            modified,
        });
    }

    Ok(objects)
}

/// Keeps the ssh child alive for as long as its stdout is being read.
struct SshReader {
    _child: Child,
    stdout: ChildStdout,
}

impl AsyncRead for SshReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stdout).poll_read(cx, buf)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::backends::parse_uri;

    #[test]
    fn test_open_builds_target_and_base() {
        let parsed = parse_uri("ssh://backup@vault.example.com/srv/zfs").unwrap();
        let b = SshBackend::open(&parsed).unwrap();
        assert_eq!(b.target, "backup@vault.example.com");
        assert_eq!(b.base, "/srv/zfs");
        assert_eq!(b.remote_path("tank/a|0"), "/srv/zfs/tank/a|0");
    }

    #[test]
    fn test_open_requires_path() {
        let parsed = parse_uri("ssh://vault.example.com").unwrap();
        assert!(SshBackend::open(&parsed).is_err());
    }

    #[test]
    fn test_quote_escapes_single_quotes() {
        assert_eq!(quote("/plain/path"), "'/plain/path'");
        assert_eq!(quote("a'b"), r"'a'\''b'");
    }

    #[test]
    fn test_classify_exit() {
        assert!(classify_exit("x", Some(255), "lost connection").is_transient());
        assert!(!classify_exit("x", Some(1), "no such file").is_transient());
    }

    #[test]
    fn test_parse_listing() {
        let out = "tank/a|0\t100\t1720000000.123\ntank/a|0.partial\t5\t1720000000.0\nother\t7\t1720000001.0\n";
        let objects = parse_listing(out, "tank/").unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].key, "tank/a|0");
        assert_eq!(objects[0].size, 100);
        assert_eq!(objects[0].modified.timestamp(), 1_720_000_000);
    }

    #[test]
    fn test_parse_listing_rejects_garbage() {
        assert!(parse_listing("just-one-field\n", "").is_err());
    }
}
