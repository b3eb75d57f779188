//! Object-store backends behind one narrow contract.
//!
//! A destination URI (`scheme://container[/prefix]`) selects an adapter
//! through [`Destination::open`]. Adapters differ widely internally but all
//! uploads are durable on return, idempotent per key, and classified through
//! [`BackendError`](crate::retry::BackendError).

pub mod azure;
pub mod file;
pub mod s3;
pub mod ssh;

use crate::retry::BackendError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{path::Path, pin::Pin, time::Duration};
use tokio::io::AsyncRead;
use url::Url;

/// Reader handed back by [`Backend::download`].
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// One stored object, as reported by [`Backend::list`].
#[derive(Debug, Clone)]
pub struct RemoteObject {
    pub key: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// The uniform backend contract.
///
/// `upload` reads the finalized payload from a local file so that retries
/// never have to re-derive bytes from the (unseekable) send stream, and
/// returns the entity tag reported by the store. Listing handles pagination
/// internally and returns the complete result set for the prefix.
#[async_trait]
pub trait Backend: Send + Sync {
    fn scheme(&self) -> &'static str;

    /// Concurrency hint honored by the upload scheduler.
    fn max_parallel_uploads(&self) -> usize {
        4
    }

    /// Whether the store checks the supplied MD5 server-side and reflects it
    /// in the returned entity tag.
    fn verifies_md5(&self) -> bool {
        false
    }

    async fn upload(
        &self,
        key: &str,
        source: &Path,
        size: u64,
        md5_hex: Option<&str>,
    ) -> Result<String, BackendError>;

    async fn download(&self, key: &str) -> Result<ObjectReader, BackendError>;

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>, BackendError>;

    async fn delete(&self, keys: &[String]) -> Result<(), BackendError>;

    async fn close(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Parsed pieces of a destination URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUri {
    pub scheme: String,
    /// Bucket, container, host or root directory depending on the scheme.
    pub container: String,
    /// Key prefix under the container; empty for none, no trailing slash.
    pub prefix: String,
    /// `user@` part, only meaningful for `ssh://`.
    pub user: Option<String>,
}

/// Split a comma-separated destination argument into individual URIs.
#[must_use]
pub fn split_destinations(arg: &str) -> Vec<String> {
    arg.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Parse `scheme://container[/prefix]`.
///
/// # Errors
/// Returns `Permanent` for anything that does not look like a destination;
/// bad URIs must fail before any side effect.
pub fn parse_uri(uri: &str) -> Result<ParsedUri, BackendError> {
    let url = Url::parse(uri)
        .map_err(|e| BackendError::Permanent(format!("invalid destination {uri}: {e}")))?;

    let scheme = url.scheme().to_string();
    let path = url.path().trim_matches('/').to_string();

    let (container, prefix) = match scheme.as_str() {
        // the whole path is the root directory
        "file" => {
            if path.is_empty() {
                return Err(BackendError::Permanent(format!("{uri}: missing path")));
            }
            (format!("/{path}"), String::new())
        }
        "ssh" => {
            let host = url.host_str().filter(|h| !h.is_empty()).ok_or_else(|| {
                BackendError::Permanent(format!("{uri}: missing host"))
            })?;
            (host.to_string(), path)
        }
        _ => {
            let bucket = url.host_str().filter(|h| !h.is_empty()).ok_or_else(|| {
                BackendError::Permanent(format!("{uri}: missing container"))
            })?;
            (bucket.to_string(), path)
        }
    };

    let user = match url.username() {
        "" => None,
        name => Some(name.to_string()),
    };

    Ok(ParsedUri {
        scheme,
        container,
        prefix,
        user,
    })
}

/// A resolved destination: a backend plus the key prefix all object names are
/// joined under.
pub struct Destination {
    uri: String,
    prefix: String,
    backend: Box<dyn Backend>,
}

impl Destination {
    /// Resolve a URI to an adapter. Credentials come from per-backend
    /// environment variables; unknown schemes are rejected up front.
    ///
    /// # Errors
    /// `Permanent` on unparsable URIs, unknown schemes or missing credentials.
    pub fn open(uri: &str, timeout: Duration) -> Result<Self, BackendError> {
        let parsed = parse_uri(uri)?;

        let backend: Box<dyn Backend> = match parsed.scheme.as_str() {
            "aws" | "gs" | "b2" => Box::new(s3::S3Backend::open(&parsed, timeout)?),
            "azure" => Box::new(azure::AzureBackend::open(&parsed, timeout)?),
            "file" => Box::new(file::FileBackend::open(&parsed)),
            "ssh" => Box::new(ssh::SshBackend::open(&parsed)?),
            other => {
                return Err(BackendError::Permanent(format!(
                    "unsupported destination scheme: {other}://"
                )));
            }
        };

        // file and ssh adapters own their whole path; only the bucket-style
        // schemes carry a key prefix at this layer
        let prefix = match parsed.scheme.as_str() {
            "file" | "ssh" => String::new(),
            _ => parsed.prefix,
        };

        Ok(Self {
            uri: uri.to_string(),
            prefix,
            backend,
        })
    }

    /// Wrap an already-constructed backend; used by the integration tests to
    /// inject fault-injecting adapters.
    #[must_use]
    pub fn with_backend(uri: &str, prefix: &str, backend: Box<dyn Backend>) -> Self {
        Self {
            uri: uri.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
            backend,
        }
    }

    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    #[must_use]
    pub fn scheme(&self) -> &'static str {
        self.backend.scheme()
    }

    #[must_use]
    pub fn max_parallel_uploads(&self) -> usize {
        self.backend.max_parallel_uploads().max(1)
    }

    #[must_use]
    pub fn verifies_md5(&self) -> bool {
        self.backend.verifies_md5()
    }

    fn full_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{key}", self.prefix)
        }
    }

    /// # Errors
    /// Propagates the adapter's classified error.
    pub async fn upload(
        &self,
        key: &str,
        source: &Path,
        size: u64,
        md5_hex: Option<&str>,
    ) -> Result<String, BackendError> {
        self.backend
            .upload(&self.full_key(key), source, size, md5_hex)
            .await
    }

    /// # Errors
    /// Propagates the adapter's classified error.
    pub async fn download(&self, key: &str) -> Result<ObjectReader, BackendError> {
        self.backend.download(&self.full_key(key)).await
    }

    /// List all objects under this destination's prefix, keys returned
    /// relative to it.
    ///
    /// # Errors
    /// Propagates the adapter's classified error.
    pub async fn list(&self) -> Result<Vec<RemoteObject>, BackendError> {
        let prefix = if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        };

        let mut objects = self.backend.list(&prefix).await?;

        for object in &mut objects {
            if let Some(rest) = object.key.strip_prefix(&prefix) {
                object.key = rest.to_string();
            }
        }

        Ok(objects)
    }

    /// # Errors
    /// Propagates the adapter's classified error.
    pub async fn delete(&self, keys: &[String]) -> Result<(), BackendError> {
        let full: Vec<String> = keys.iter().map(|k| self.full_key(k)).collect();
        self.backend.delete(&full).await
    }

    /// # Errors
    /// Propagates the adapter's classified error.
    pub async fn close(&self) -> Result<(), BackendError> {
        self.backend.close().await
    }
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Destination")
            .field("uri", &self.uri)
            .field("prefix", &self.prefix)
            .field("scheme", &self.backend.scheme())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bucket_uri() {
        let parsed = parse_uri("aws://backups/pool").unwrap();
        assert_eq!(
            parsed,
            ParsedUri {
                scheme: "aws".into(),
                container: "backups".into(),
                prefix: "pool".into(),
                user: None,
            }
        );
    }

    #[test]
    fn test_parse_bucket_uri_no_prefix() {
        let parsed = parse_uri("azure://tank").unwrap();
        assert_eq!(parsed.container, "tank");
        assert_eq!(parsed.prefix, "");
    }

    #[test]
    fn test_parse_file_uri() {
        let parsed = parse_uri("file:///var/backups/zfs").unwrap();
        assert_eq!(parsed.scheme, "file");
        assert_eq!(parsed.container, "/var/backups/zfs");
        assert_eq!(parsed.prefix, "");
    }

    #[test]
    fn test_parse_ssh_uri() {
        let parsed = parse_uri("ssh://backup@vault.example.com/srv/zfs").unwrap();
        assert_eq!(parsed.container, "vault.example.com");
        assert_eq!(parsed.prefix, "srv/zfs");
        assert_eq!(parsed.user.as_deref(), Some("backup"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_uri("not a uri").is_err());
        assert!(parse_uri("aws://").is_err());
    }

    #[test]
    fn test_split_destinations() {
        assert_eq!(
            split_destinations("aws://a, azure://b,file:///c"),
            vec!["aws://a", "azure://b", "file:///c"]
        );
        assert_eq!(split_destinations("aws://a"), vec!["aws://a"]);
    }

    #[test]
    fn test_unknown_scheme_is_permanent() {
        let err = Destination::open("ftp://x/y", Duration::from_secs(1)).unwrap_err();
        assert!(!err.is_transient());
    }
}
