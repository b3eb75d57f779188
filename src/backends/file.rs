//! Local filesystem adapter.
//!
//! Objects are plain files under the destination root. Uploads stream into a
//! `.partial` sibling and are renamed into place after fsync, so a visible
//! object is always complete.

use crate::backends::s3::write_hex_bytes;
use crate::backends::{Backend, ObjectReader, ParsedUri, RemoteObject};
use crate::retry::BackendError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncWriteExt},
};

pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    #[must_use]
    pub fn open(parsed: &ParsedUri) -> Self {
        Self {
            root: PathBuf::from(&parsed.container),
        }
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl Backend for FileBackend {
    fn scheme(&self) -> &'static str {
        "file"
    }

    fn verifies_md5(&self) -> bool {
        true
    }

    async fn upload(
        &self,
        key: &str,
        source: &Path,
        _size: u64,
        _md5_hex: Option<&str>,
    ) -> Result<String, BackendError> {
        let target = self.object_path(key);

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| BackendError::from_io(&e, "create destination directory"))?;
        }

        let partial = PathBuf::from(format!("{}.partial", target.display()));

        let mut reader = fs::File::open(source)
            .await
            .map_err(|e| BackendError::from_io(&e, "open payload"))?;
        let mut writer = fs::File::create(&partial)
            .await
            .map_err(|e| BackendError::from_io(&e, "create object"))?;

        // hash while copying so the returned tag reflects what actually
        // landed on disk
        let mut md5 = md5::Context::new();
        let mut buf = vec![0u8; 1024 * 256];

        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| BackendError::from_io(&e, "read payload"))?;
            if n == 0 {
                break;
            }

            let chunk = buf.get(..n).unwrap_or_default();
            md5.consume(chunk);
            writer
                .write_all(chunk)
                .await
                .map_err(|e| BackendError::from_io(&e, "write object"))?;
        }

        writer
            .sync_all()
            .await
            .map_err(|e| BackendError::from_io(&e, "sync object"))?;
        drop(writer);

        fs::rename(&partial, &target)
            .await
            .map_err(|e| BackendError::from_io(&e, "publish object"))?;

        Ok(write_hex_bytes(md5.compute().as_ref()))
    }

    async fn download(&self, key: &str) -> Result<ObjectReader, BackendError> {
        let file = fs::File::open(self.object_path(key))
            .await
            .map_err(|e| BackendError::from_io(&e, &format!("download {key}")))?;

        Ok(Box::pin(file))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>, BackendError> {
        let mut objects = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                // an unused destination has no directory yet
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(BackendError::from_io(&e, "list")),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| BackendError::from_io(&e, "list"))?
            {
                let path = entry.path();
                let meta = entry
                    .metadata()
                    .await
                    .map_err(|e| BackendError::from_io(&e, "stat"))?;

                if meta.is_dir() {
                    pending.push(path);
                    continue;
                }

                let Ok(rel) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = rel.to_string_lossy().to_string();

                if !key.starts_with(prefix) || key.ends_with(".partial") {
                    continue;
                }

                let modified = meta
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .map_err(|e| BackendError::from_io(&e, "mtime"))?;

                objects.push(RemoteObject {
                    key,
                    size: meta.len(),
                    modified,
                });
            }
        }

        Ok(objects)
    }

    async fn delete(&self, keys: &[String]) -> Result<(), BackendError> {
        for key in keys {
            match fs::remove_file(self.object_path(key)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(BackendError::from_io(&e, &format!("delete {key}"))),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::backends::parse_uri;
    use std::io::Write;
    use tempfile::TempDir;

    fn backend(root: &TempDir) -> FileBackend {
        let uri = format!("file://{}", root.path().display());
        FileBackend::open(&parse_uri(&uri).unwrap())
    }

    #[tokio::test]
    async fn test_upload_download_round_trip() {
        let root = TempDir::new().unwrap();
        let b = backend(&root);

        let mut payload = tempfile::NamedTempFile::new().unwrap();
        payload.write_all(b"hello world").unwrap();

        let etag = b
            .upload("tank/data|a|b|0", payload.path(), 11, None)
            .await
            .unwrap();
        assert_eq!(etag, "5eb63bbbe01eeed093cb22bb8f5acdc3");

        let mut reader = b.download("tank/data|a|b|0").await.unwrap();
        let mut read_back = Vec::new();
        reader.read_to_end(&mut read_back).await.unwrap();
        assert_eq!(read_back, b"hello world");
    }

    #[tokio::test]
    async fn test_list_filters_prefix_and_partials() {
        let root = TempDir::new().unwrap();
        let b = backend(&root);

        let mut payload = tempfile::NamedTempFile::new().unwrap();
        payload.write_all(b"x").unwrap();

        b.upload("tank/a|0", payload.path(), 1, None).await.unwrap();
        b.upload("tank/a|1", payload.path(), 1, None).await.unwrap();
        b.upload("other/b|0", payload.path(), 1, None).await.unwrap();

        let mut keys: Vec<String> = b
            .list("tank/")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["tank/a|0", "tank/a|1"]);

        let all = b.list("").await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_list_empty_root() {
        let root = TempDir::new().unwrap();
        let missing = root.path().join("nothing-here");
        let uri = format!("file://{}", missing.display());
        let b = FileBackend::open(&parse_uri(&uri).unwrap());

        assert!(b.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let root = TempDir::new().unwrap();
        let b = backend(&root);

        let mut payload = tempfile::NamedTempFile::new().unwrap();
        payload.write_all(b"x").unwrap();
        b.upload("k", payload.path(), 1, None).await.unwrap();

        b.delete(&["k".to_string(), "absent".to_string()])
            .await
            .unwrap();
        assert!(matches!(
            b.download("k").await.err().unwrap(),
            BackendError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_download_missing_is_not_found() {
        let root = TempDir::new().unwrap();
        let b = backend(&root);
        assert!(b.download("nope").await.err().unwrap().is_not_found());
    }
}
