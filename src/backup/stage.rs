//! Per-volume stage chain: compress, encrypt/sign, digest.
//!
//! The chain is a composed `std::io::Write` stack running on a blocking
//! thread: spill file -> compressor -> OpenPGP writer -> hashing writer ->
//! staged temp file. Both digests cover the final uploaded bytes: the MD5 is
//! what MD5-verifying backends check server-side, the SHA-256 is the
//! end-to-end record in the manifest.

use crate::backup::splitter::SpilledVolume;
use crate::backends::s3::write_hex_bytes;
use crate::compress::{Compressor, Encoder};
use crate::manifest::VolumeRecord;
use crate::pgp;
use anyhow::{Context as _, Result};
use ring::digest::{Context, SHA256};
use sequoia_openpgp::Cert;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{Builder, TempPath};
use tokio::task;

/// Keys resolved at start-up for the job's OpenPGP layer.
#[derive(Debug)]
pub struct JobCrypto {
    pub recipients: Vec<Cert>,
    pub signer: Option<Cert>,
}

pub struct StageOptions {
    pub compressor: Compressor,
    pub level: i32,
    pub crypto: Option<JobCrypto>,
}

impl StageOptions {
    /// Object-key extension the staged payload will carry.
    #[must_use]
    pub fn extension(&self) -> String {
        match (self.compressor.extension(), &self.crypto) {
            ("", None) => String::new(),
            ("", Some(_)) => pgp::EXTENSION.to_string(),
            (ext, None) => ext.to_string(),
            (ext, Some(_)) => format!("{ext}.{}", pgp::EXTENSION),
        }
    }
}

/// A volume whose final payload is on disk, ready for fan-out.
pub struct StagedVolume {
    pub record: VolumeRecord,
    pub path: TempPath,
    pub permit: tokio::sync::OwnedSemaphorePermit,
}

/// Run one volume through the stage chain on a blocking thread.
///
/// # Errors
/// Any stage failure; the spill and staged temp files are cleaned up either
/// way.
pub async fn stage_volume(
    volume: SpilledVolume,
    options: Arc<StageOptions>,
    work_dir: PathBuf,
) -> Result<StagedVolume> {
    let SpilledVolume {
        index,
        raw_size,
        path: spill,
        permit,
    } = volume;

    let chain_options = options.clone();
    let staged = task::spawn_blocking(move || -> Result<(TempPath, String, String, u64)> {
        let staged = Builder::new()
            .prefix("zbak-vol.")
            .suffix(".staged")
            .tempfile_in(&work_dir)
            .context("create staged file")?;
        let (std_file, staged_path) = staged.into_parts();

        let (md5, sha256, stored_size) = run_chain(&spill, std_file, &chain_options)?;

        drop(spill); // the raw spill is no longer needed

        Ok((staged_path, md5, sha256, stored_size))
    })
    .await
    .context("stage task panicked or was cancelled")?;

    let (path, md5, sha256, stored_size) = staged?;

    log::debug!("volume {index}: staged {raw_size} -> {stored_size} bytes");

    Ok(StagedVolume {
        record: VolumeRecord {
            index,
            raw_size,
            stored_size,
            md5,
            sha256,
            extension: options.extension(),
        },
        path,
        permit,
    })
}

fn run_chain(
    spill: &Path,
    sink: std::fs::File,
    options: &StageOptions,
) -> Result<(String, String, u64)> {
    let mut reader = BufReader::new(
        std::fs::File::open(spill).context("reopen spill file")?,
    );
    let mut hashing = HashingWriter::new(BufWriter::new(sink));

    match &options.crypto {
        Some(crypto) => {
            pgp::seal(
                &crypto.recipients,
                crypto.signer.as_ref(),
                &mut hashing,
                |w| pump(&mut reader, options, w),
            )?;
        }
        None => pump(&mut reader, options, &mut hashing)?,
    }

    hashing.finalize()
}

fn pump(reader: &mut dyn Read, options: &StageOptions, sink: &mut dyn Write) -> Result<()> {
    let mut encoder = Encoder::new(options.compressor, options.level, sink)?;
    std::io::copy(reader, &mut encoder).context("stage volume")?;
    encoder.finish()?;
    Ok(())
}

/// `Write` adapter computing MD5 and SHA-256 over everything that passes
/// through it.
pub struct HashingWriter<W: Write> {
    inner: W,
    md5: md5::Context,
    sha: Context,
    count: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            md5: md5::Context::new(),
            sha: Context::new(&SHA256),
            count: 0,
        }
    }

    /// Flush the sink and return `(md5_hex, sha256_hex, bytes_written)`.
    ///
    /// # Errors
    /// Flush failures.
    pub fn finalize(mut self) -> Result<(String, String, u64)> {
        self.inner.flush().context("flush staged file")?;

        Ok((
            write_hex_bytes(self.md5.compute().as_ref()),
            write_hex_bytes(self.sha.finish().as_ref()),
            self.count,
        ))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        let written = buf.get(..n).unwrap_or_default();
        self.md5.consume(written);
        self.sha.update(written);
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
