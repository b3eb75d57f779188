//! The restore pipeline: download -> verify digests -> decrypt/verify
//! signature -> decompress -> ordered reassembly into a single writer.
//!
//! Volumes download concurrently inside a bounded prefetch window, but the
//! output writer consumes them in strict index order through a reassembly
//! buffer, because `zfs receive` wants the send stream exactly as it was.

use crate::backends::Destination;
use crate::compress::{self, Compressor};
use crate::manifest::{JobInfo, VolumeRecord};
use crate::pgp;
use crate::progress::Progress;
use crate::retry::{BackendError, RetryPolicy, retry};
use anyhow::{Context, Result, bail};
use sequoia_openpgp::Cert;
use std::collections::BTreeMap;
use std::io::{BufReader, BufWriter, Read, Write as _};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::{Builder, TempPath};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Keys for opening sealed volumes.
#[derive(Debug)]
pub struct RestoreCrypto {
    /// Secret certificates for decryption.
    pub secrets: Vec<Cert>,
    /// Public certificates the signature must verify against.
    pub verifiers: Vec<Cert>,
    /// Fail the restore if a valid signature is absent.
    pub require_signature: bool,
}

pub struct RestoreOptions {
    pub separator: char,
    pub work_dir: PathBuf,
    /// Prefetch window: how many volumes may exist on local disk at once.
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
    pub crypto: Option<RestoreCrypto>,
    pub quiet: bool,
}

/// Restore one job: every volume, in order, into `output`.
///
/// # Errors
/// Download failures after retries, digest mismatches after re-download
/// retries, decryption/signature failures, or cancellation.
pub async fn run_restore<W>(
    job: &JobInfo,
    dest: &Arc<Destination>,
    output: &mut W,
    options: &RestoreOptions,
    cancel: &CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    if job.encrypt_to.is_some()
        && options
            .crypto
            .as_ref()
            .is_none_or(|c| c.secrets.is_empty())
    {
        bail!(
            "backup {} is encrypted; a secret keyring is required to restore it",
            job.base_name(options.separator)
        );
    }

    let compressor: Compressor = job
        .compressor
        .parse()
        .with_context(|| format!("manifest compressor {:?}", job.compressor))?;

    let total: u64 = job.volumes.iter().map(|v| v.stored_size).sum();
    let progress = Progress::for_download(total, options.quiet);

    let window = Arc::new(Semaphore::new(options.max_in_flight.max(1)));
    let (tx, mut rx) = mpsc::channel::<Result<Decoded>>(options.max_in_flight.max(1));

    // scoped to this job's prefetchers: follows the caller's cancellation,
    // but a failed volume only tears down this restore
    let fetch_cancel = cancel.child_token();

    // prefetch supervisor: one task per volume, bounded by the window
    let supervisor = tokio::spawn({
        let mut tasks: JoinSet<Result<Decoded>> = JoinSet::new();

        for record in job.volumes.clone() {
            tasks.spawn(fetch_volume(FetchJob {
                key: job.volume_key(options.separator, &record),
                record,
                dest: dest.clone(),
                compressor,
                encrypted: job.encrypt_to.is_some(),
                signed: job.sign_from.is_some(),
                crypto: crypto_handles(options),
                work_dir: options.work_dir.clone(),
                retry: options.retry.clone(),
                window: window.clone(),
                cancel: fetch_cancel.clone(),
            }));
        }

        async move {
            while let Some(joined) = tasks.join_next().await {
                let result = joined.unwrap_or_else(|e| Err(anyhow::anyhow!("fetch task: {e}")));
                if tx.send(result).await.is_err() {
                    // consumer bailed; stop fetching
                    tasks.abort_all();
                    break;
                }
            }
        }
    });

    // ordered reassembly: consume strictly by index regardless of download
    // completion order
    let mut buffer: BTreeMap<u64, Decoded> = BTreeMap::new();
    let mut next: u64 = 0;
    let total_volumes = job.volumes.len() as u64;

    let consume = async {
        while next < total_volumes {
            let fetched = match rx.recv().await {
                Some(fetched) => fetched,
                None => bail!("prefetchers exited early"),
            };

            let decoded = match fetched {
                Ok(decoded) => decoded,
                Err(err) => {
                    fetch_cancel.cancel();
                    return Err(err);
                }
            };

            progress.add_bytes(decoded.stored_size);
            buffer.insert(decoded.index, decoded);

            while let Some(decoded) = buffer.remove(&next) {
                let mut file = tokio::fs::File::open(&decoded.path)
                    .await
                    .context("open decoded volume")?;
                tokio::io::copy(&mut file, output)
                    .await
                    .with_context(|| format!("feed volume {next} to the receiver"))?;

                drop(decoded); // temp file and window slot released together
                next += 1;
            }
        }

        output.flush().await.context("flush receiver")?;
        Ok(())
    };

    let outcome = consume.await;

    drop(rx);
    let _ = supervisor.await;
    progress.done();

    outcome
}

struct Decoded {
    index: u64,
    stored_size: u64,
    path: TempPath,
    _window_slot: OwnedSemaphorePermit,
}

struct FetchJob {
    key: String,
    record: VolumeRecord,
    dest: Arc<Destination>,
    compressor: Compressor,
    encrypted: bool,
    signed: bool,
    crypto: CryptoHandles,
    work_dir: PathBuf,
    retry: RetryPolicy,
    window: Arc<Semaphore>,
    cancel: CancellationToken,
}

#[derive(Clone)]
struct CryptoHandles {
    secrets: Arc<Vec<Cert>>,
    verifiers: Arc<Vec<Cert>>,
    require_signature: bool,
}

fn crypto_handles(options: &RestoreOptions) -> CryptoHandles {
    match &options.crypto {
        Some(c) => CryptoHandles {
            secrets: Arc::new(c.secrets.clone()),
            verifiers: Arc::new(c.verifiers.clone()),
            require_signature: c.require_signature,
        },
        None => CryptoHandles {
            secrets: Arc::new(Vec::new()),
            verifiers: Arc::new(Vec::new()),
            require_signature: false,
        },
    }
}

async fn fetch_volume(fetch: FetchJob) -> Result<Decoded> {
    let slot = tokio::select! {
        () = fetch.cancel.cancelled() => bail!("cancelled"),
        slot = fetch.window.clone().acquire_owned() => slot.context("window closed")?,
    };

    let what = format!("download {}", fetch.key);

    // a digest mismatch reads as transient here: the re-download IS the
    // recovery path
    let staged = retry(&fetch.retry, &fetch.cancel, &what, || {
        download_and_verify(&fetch)
    })
    .await
    .map_err(|e| anyhow::anyhow!("{e}"))?;

    let decoded = decode_volume(&fetch, staged).await?;

    log::debug!("volume {} fetched and decoded", fetch.record.index);

    Ok(Decoded {
        index: fetch.record.index,
        stored_size: fetch.record.stored_size,
        path: decoded,
        _window_slot: slot,
    })
}

/// Download the stored payload and check both manifest digests over it.
async fn download_and_verify(fetch: &FetchJob) -> Result<TempPath, BackendError> {
    let temp = Builder::new()
        .prefix("zbak-fetch.")
        .suffix(".staged")
        .tempfile_in(&fetch.work_dir)
        .map_err(|e| BackendError::from_io(&e, "create download file"))?;
    let (std_file, path) = temp.into_parts();
    let mut file = tokio::fs::File::from_std(std_file);

    let mut reader = fetch.dest.download(&fetch.key).await?;

    let mut md5 = md5::Context::new();
    let mut sha = ring::digest::Context::new(&ring::digest::SHA256);
    let mut buf = vec![0u8; 1024 * 256];
    let mut received: u64 = 0;

    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| BackendError::from_io(&e, "read download"))?;
        if n == 0 {
            break;
        }

        let chunk = buf.get(..n).unwrap_or_default();
        md5.consume(chunk);
        sha.update(chunk);
        file.write_all(chunk)
            .await
            .map_err(|e| BackendError::from_io(&e, "spool download"))?;
        received += n as u64;
    }

    file.flush()
        .await
        .map_err(|e| BackendError::from_io(&e, "flush download"))?;
    drop(file);

    let md5_hex = crate::backends::s3::write_hex_bytes(md5.compute().as_ref());
    let sha_hex = crate::backends::s3::write_hex_bytes(sha.finish().as_ref());

    if received != fetch.record.stored_size
        || md5_hex != fetch.record.md5
        || sha_hex != fetch.record.sha256
    {
        return Err(BackendError::Transient(format!(
            "{}: integrity failure ({received} bytes, md5 {md5_hex}, sha256 {sha_hex})",
            fetch.key
        )));
    }

    Ok(path)
}

/// Reverse the stage chain on a blocking thread: open the sealed payload,
/// decompress, and spill the raw stream chunk for the ordered writer.
async fn decode_volume(fetch: &FetchJob, staged: TempPath) -> Result<TempPath> {
    let work_dir = fetch.work_dir.clone();
    let compressor = fetch.compressor;
    let encrypted = fetch.encrypted;
    let signed = fetch.signed;
    let crypto = fetch.crypto.clone();
    let expected_raw = fetch.record.raw_size;
    let key = fetch.key.clone();

    tokio::task::spawn_blocking(move || -> Result<TempPath> {
        let decoded = Builder::new()
            .prefix("zbak-fetch.")
            .suffix(".raw")
            .tempfile_in(&work_dir)
            .context("create decoded file")?;
        let (out_file, out_path) = decoded.into_parts();

        let mut source = BufReader::new(
            std::fs::File::open(&staged).context("reopen downloaded volume")?,
        );
        let mut sink = BufWriter::new(out_file);

        let written = if encrypted || signed {
            pgp::open(
                &crypto.secrets,
                &crypto.verifiers,
                encrypted,
                crypto.require_signature,
                source,
                |clear| pump_decode(compressor, clear, &mut sink),
            )?
        } else {
            pump_decode(compressor, &mut source, &mut sink)?
        };

        sink.flush().context("flush decoded volume")?;
        drop(staged); // sealed payload no longer needed

        if written != expected_raw {
            bail!("{key}: decoded to {written} bytes, manifest says {expected_raw}");
        }

        Ok(out_path)
    })
    .await
    .context("decode task panicked or was cancelled")?
}

fn pump_decode(
    compressor: Compressor,
    source: &mut dyn Read,
    sink: &mut dyn std::io::Write,
) -> Result<u64> {
    let mut decoder = compress::decoder(compressor, source)?;
    std::io::copy(&mut decoder, sink).context("decode volume")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    // the pipeline end-to-end paths live in tests/; here only the pure bits
    #[test]
    fn test_crypto_handles_defaults() {
        let options = RestoreOptions {
            separator: '|',
            work_dir: PathBuf::from("/tmp"),
            max_in_flight: 2,
            retry: RetryPolicy::default(),
            crypto: None,
            quiet: true,
        };

        let handles = crypto_handles(&options);
        assert!(handles.secrets.is_empty());
        assert!(handles.verifiers.is_empty());
        assert!(!handles.require_signature);
    }
}
