//! The manifest (`JobInfo`) is the record that ties one backup job together:
//! source identity, stage options and the ordered volume list. It is the last
//! object written to a destination; its presence is the signal that the job
//! committed there.
//!
//! Object keys are derived from the manifest at read time using the active
//! `--separator`, so the separator itself never appears inside a manifest and
//! can differ between backends with different reserved-character rules.

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Format version stamped into every manifest.
pub const MANIFEST_VERSION: u32 = 1;

/// Suffix of the manifest object at a destination.
pub const MANIFEST_SUFFIX: &str = ".manifest";

/// Default object-key separator; Azurite-style backends reject `|`, which is
/// what `--separator` exists for.
pub const DEFAULT_SEPARATOR: char = '|';

/// Identity of a snapshot or bookmark. The GUID survives renames and is the
/// authoritative identity everywhere; names are for humans and object keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub dataset: String,
    /// Short name, the part after `@` (or `#` for bookmarks).
    pub name: String,
    pub guid: u64,
    pub txg: u64,
    pub creation: DateTime<Utc>,
    #[serde(default)]
    pub bookmark: bool,
}

impl SnapshotRef {
    /// The `dataset@name` (or `dataset#name`) form ZFS commands expect.
    #[must_use]
    pub fn full_name(&self) -> String {
        if self.bookmark {
            format!("{}#{}", self.dataset, self.name)
        } else {
            format!("{}@{}", self.dataset, self.name)
        }
    }

    /// Short name as used in object keys: bookmarks keep a `#` marker so a
    /// bookmark-based incremental is distinguishable from a snapshot-based
    /// one with the same name.
    #[must_use]
    pub fn key_name(&self) -> String {
        if self.bookmark {
            format!("#{}", self.name)
        } else {
            self.name.clone()
        }
    }
}

/// One uploaded chunk of the send stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub index: u64,
    /// Bytes of raw send stream in this volume.
    pub raw_size: u64,
    /// Bytes actually uploaded, after compression/encryption.
    pub stored_size: u64,
    /// MD5 of the uploaded payload, hex; what MD5-verifying backends check.
    pub md5: String,
    /// SHA-256 of the uploaded payload, hex; end-to-end integrity independent
    /// of backend trust.
    pub sha256: String,
    /// Key extension, e.g. `zst`, `gz.pgp`, empty for raw.
    #[serde(default)]
    pub extension: String,
}

/// The complete description of one backup job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub version: u32,
    /// The backed-up dataset.
    pub volume_name: String,
    /// Incremental base; `None` for a full backup.
    pub from: Option<SnapshotRef>,
    pub to: SnapshotRef,
    pub compressor: String,
    pub compression_level: i32,
    pub encrypt_to: Option<String>,
    pub sign_from: Option<String>,
    /// Volume size policy the splitter ran with, bytes.
    pub volume_size: u64,
    pub volumes: Vec<VolumeRecord>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Destinations that did not confirm every volume, recorded in the
    /// copies that were written under the continue-others policy.
    #[serde(default)]
    pub incomplete_destinations: Vec<String>,
}

impl JobInfo {
    #[must_use]
    pub fn new(
        volume_name: &str,
        from: Option<SnapshotRef>,
        to: SnapshotRef,
        compressor: &str,
        compression_level: i32,
        encrypt_to: Option<String>,
        sign_from: Option<String>,
        volume_size: u64,
    ) -> Self {
        Self {
            version: MANIFEST_VERSION,
            volume_name: volume_name.to_string(),
            from,
            to,
            compressor: compressor.to_string(),
            compression_level,
            encrypt_to,
            sign_from,
            volume_size,
            volumes: Vec::new(),
            started_at: Utc::now().trunc_subsecs(0),
            finished_at: None,
            incomplete_destinations: Vec::new(),
        }
    }

    /// Base object name shared by all of this job's objects:
    /// `volume<sep>from<sep>to`.
    #[must_use]
    pub fn base_name(&self, separator: char) -> String {
        let from = self.from.as_ref().map(SnapshotRef::key_name).unwrap_or_default();
        format!(
            "{}{separator}{from}{separator}{}",
            self.volume_name, self.to.name
        )
    }

    /// Object key of one volume.
    #[must_use]
    pub fn volume_key(&self, separator: char, volume: &VolumeRecord) -> String {
        let base = self.base_name(separator);
        if volume.extension.is_empty() {
            format!("{base}{separator}{}", volume.index)
        } else {
            format!("{base}{separator}{}.{}", volume.index, volume.extension)
        }
    }

    /// Object key of the manifest itself.
    #[must_use]
    pub fn manifest_key(&self, separator: char) -> String {
        format!("{}{MANIFEST_SUFFIX}", self.base_name(separator))
    }

    /// Whether two manifests describe the same logical job.
    #[must_use]
    pub fn same_job(&self, other: &Self) -> bool {
        self.volume_name == other.volume_name
            && self.to.guid == other.to.guid
            && self.from.as_ref().map(|s| s.guid) == other.from.as_ref().map(|s| s.guid)
    }

    /// Whether two manifests for the same job agree on every volume digest.
    #[must_use]
    pub fn volumes_agree(&self, other: &Self) -> bool {
        self.volumes.len() == other.volumes.len()
            && self
                .volumes
                .iter()
                .zip(&other.volumes)
                .all(|(a, b)| a.index == b.index && a.sha256 == b.sha256 && a.md5 == b.md5)
    }

    /// Stamp the completion time, one-second resolution.
    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now().trunc_subsecs(0));
    }

    /// Serialize for upload.
    ///
    /// # Errors
    /// Serialization failures only.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).context("serialize manifest")
    }

    /// Parse and version-check a manifest document.
    ///
    /// # Errors
    /// Unparsable documents or unsupported versions.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let info: Self = serde_json::from_slice(bytes).context("parse manifest")?;

        if info.version == 0 || info.version > MANIFEST_VERSION {
            bail!(
                "unsupported manifest version {} (this build understands up to {MANIFEST_VERSION})",
                info.version
            );
        }

        Ok(info)
    }
}

/// Validate a `--separator` value: one ASCII punctuation character that can
/// never collide with dataset names, snapshot names or volume indices.
///
/// # Errors
/// Anything multi-character or reserved.
pub fn validate_separator(raw: &str) -> Result<char> {
    let mut chars = raw.chars();
    let (Some(c), None) = (chars.next(), chars.next()) else {
        bail!("separator must be exactly one character, got {raw:?}");
    };

    if !c.is_ascii_punctuation() {
        bail!("separator must be ASCII punctuation, got {c:?}");
    }

    // '/'' nests keys, '@'/'#' appear in snapshot names, '.' starts the
    // extension, '-' '_' ':' are legal inside ZFS names
    if matches!(c, '/' | '@' | '#' | '.' | '-' | '_' | ':' | '\'') {
        return Err(anyhow!("separator {c:?} collides with object-name syntax"));
    }

    Ok(c)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn snap(name: &str, guid: u64) -> SnapshotRef {
        SnapshotRef {
            dataset: "tank/data".to_string(),
            name: name.to_string(),
            guid,
            txg: guid * 10,
            creation: DateTime::from_timestamp(1_753_000_000 + i64::try_from(guid).unwrap(), 0)
                .unwrap(),
            bookmark: false,
        }
    }

    fn job() -> JobInfo {
        JobInfo::new(
            "tank/data",
            Some(snap("a", 1)),
            snap("b", 2),
            "zstd",
            6,
            None,
            None,
            200 * 1024 * 1024,
        )
    }

    #[test]
    fn test_full_and_bookmark_names() {
        let mut s = snap("a", 1);
        assert_eq!(s.full_name(), "tank/data@a");
        assert_eq!(s.key_name(), "a");

        s.bookmark = true;
        assert_eq!(s.full_name(), "tank/data#a");
        assert_eq!(s.key_name(), "#a");
    }

    #[test]
    fn test_object_keys_incremental() {
        let mut info = job();
        info.volumes.push(VolumeRecord {
            index: 0,
            raw_size: 10,
            stored_size: 8,
            md5: "aa".into(),
            sha256: "bb".into(),
            extension: "zst".into(),
        });

        assert_eq!(info.base_name('|'), "tank/data|a|b");
        assert_eq!(info.volume_key('|', &info.volumes[0]), "tank/data|a|b|0.zst");
        assert_eq!(info.manifest_key('|'), "tank/data|a|b.manifest");

        // alternate separator for backends that reject '|'
        assert_eq!(info.manifest_key('+'), "tank/data+a+b.manifest");
    }

    #[test]
    fn test_object_keys_full_backup_without_extension() {
        let mut info = job();
        info.from = None;
        info.volumes.push(VolumeRecord {
            index: 3,
            raw_size: 10,
            stored_size: 10,
            md5: "aa".into(),
            sha256: "bb".into(),
            extension: String::new(),
        });

        assert_eq!(info.volume_key('|', &info.volumes[0]), "tank/data||b|3");
    }

    #[test]
    fn test_bookmark_from_is_marked_in_keys() {
        let mut info = job();
        if let Some(from) = info.from.as_mut() {
            from.bookmark = true;
        }
        assert_eq!(info.base_name('|'), "tank/data|#a|b");
    }

    #[test]
    fn test_manifest_round_trip() {
        let mut info = job();
        info.finish();

        let bytes = info.to_vec().unwrap();
        let parsed = JobInfo::from_slice(&bytes).unwrap();
        assert_eq!(parsed, info);
        assert!(parsed.finished_at.is_some());
    }

    #[test]
    fn test_manifest_version_rejected() {
        let mut info = job();
        info.version = MANIFEST_VERSION + 1;
        let bytes = info.to_vec().unwrap();
        assert!(JobInfo::from_slice(&bytes).is_err());
    }

    #[test]
    fn test_same_job_and_digest_agreement() {
        let mut a = job();
        let mut b = job();
        assert!(a.same_job(&b));

        let record = VolumeRecord {
            index: 0,
            raw_size: 1,
            stored_size: 1,
            md5: "aa".into(),
            sha256: "bb".into(),
            extension: String::new(),
        };
        a.volumes.push(record.clone());
        b.volumes.push(record);
        assert!(a.volumes_agree(&b));

        if let Some(v) = b.volumes.first_mut() {
            v.sha256 = "cc".into();
        }
        assert!(!a.volumes_agree(&b));

        b.to.guid = 99;
        assert!(!a.same_job(&b));
    }

    #[test]
    fn test_validate_separator() {
        assert_eq!(validate_separator("|").unwrap(), '|');
        assert_eq!(validate_separator("+").unwrap(), '+');
        assert!(validate_separator("").is_err());
        assert!(validate_separator("||").is_err());
        assert!(validate_separator("/").is_err());
        assert!(validate_separator("@").is_err());
        assert!(validate_separator("a").is_err());
    }
}
