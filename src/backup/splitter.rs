//! Splits the unbounded send stream into numbered fixed-size volumes spilled
//! to the working directory. The stream is not restartable, so the spill file
//! is the single scratch artifact every later stage and retry reads from.

use anyhow::{Context, Result, bail};
use std::path::Path;
use std::sync::Arc;
use tempfile::{Builder, TempPath};
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    sync::{Semaphore, mpsc},
};
use tokio_util::sync::CancellationToken;

const READ_BUFFER: usize = 1024 * 256;

/// One sealed volume waiting for its stage pipeline.
///
/// The temp file is deleted when the last owner drops it, and the in-flight
/// permit travels with the volume so back-pressure is released exactly when
/// the scheduler is done with it.
pub struct SpilledVolume {
    pub index: u64,
    pub raw_size: u64,
    pub path: TempPath,
    pub permit: tokio::sync::OwnedSemaphorePermit,
}

/// Read `input` to EOF, producing volumes of `volume_size` bytes in strict
/// order. Blocks on `slots` before opening each volume, which is the
/// back-pressure bound on `maxInFlightVolumes`.
///
/// Returns the number of volumes produced.
///
/// # Errors
/// Read/write failures, an empty stream, or cancellation.
pub async fn split_stream<R>(
    mut input: R,
    volume_size: u64,
    work_dir: &Path,
    slots: Arc<Semaphore>,
    output: mpsc::Sender<SpilledVolume>,
    cancel: CancellationToken,
) -> Result<u64>
where
    R: AsyncRead + Unpin + Send,
{
    let mut index: u64 = 0;
    let mut buf = vec![0u8; READ_BUFFER];
    let mut eof = false;

    while !eof {
        let permit = tokio::select! {
            () = cancel.cancelled() => bail!("cancelled"),
            permit = slots.clone().acquire_owned() => permit.context("splitter slots closed")?,
        };

        let spill = Builder::new()
            .prefix("zbak-vol.")
            .suffix(".spill")
            .tempfile_in(work_dir)
            .context("create spill file")?;
        let (std_file, path) = spill.into_parts();
        let mut file = File::from_std(std_file);

        let mut written: u64 = 0;

        while written < volume_size {
            let want = usize::try_from((volume_size - written).min(READ_BUFFER as u64))
                .unwrap_or(READ_BUFFER);

            let slice = buf.get_mut(..want).unwrap_or_default();
            let n = tokio::select! {
                () = cancel.cancelled() => bail!("cancelled"),
                n = input.read(slice) => n.context("read send stream")?,
            };

            if n == 0 {
                eof = true;
                break;
            }

            let chunk = slice.get(..n).unwrap_or_default();
            file.write_all(chunk).await.context("spill volume")?;
            written += n as u64;
        }

        file.flush().await.context("flush spill file")?;
        drop(file);

        if written == 0 {
            if index == 0 {
                bail!("the send stream was empty");
            }
            // EOF landed exactly on a volume boundary
            break;
        }

        log::debug!("volume {index}: {written} bytes spilled");

        let volume = SpilledVolume {
            index,
            raw_size: written,
            path,
            permit,
        };

        if output.send(volume).await.is_err() {
            bail!("stage pipeline went away");
        }

        index += 1;
    }

    Ok(index)
}
