//! Compressor selection for the stage pipeline.
//!
//! Each codec is exposed as a `Write`-based encoder and a `Read`-based
//! decoder so the stage chain stays streaming in both directions; `None` is
//! the identity stage.

use anyhow::{Context, Result, bail};
use std::io::{Read, Write};
use std::str::FromStr;

pub const DEFAULT_LEVEL: i32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    None,
    Gzip,
    Xz,
    Zstd,
    Lz4,
}

impl FromStr for Compressor {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" | "off" => Ok(Self::None),
            "gzip" | "gz" => Ok(Self::Gzip),
            "xz" => Ok(Self::Xz),
            "zstd" | "zst" => Ok(Self::Zstd),
            "lz4" => Ok(Self::Lz4),
            other => bail!("unknown compressor: {other} (none, gzip, xz, zstd, lz4)"),
        }
    }
}

impl std::fmt::Display for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

impl Compressor {
    /// Stable identifier recorded in manifests.
    #[must_use]
    pub const fn id(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Xz => "xz",
            Self::Zstd => "zstd",
            Self::Lz4 => "lz4",
        }
    }

    /// Object-key extension contributed by this codec; empty for identity.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Gzip => "gz",
            Self::Xz => "xz",
            Self::Zstd => "zst",
            Self::Lz4 => "lz4",
        }
    }
}

/// A live encoder wrapping the stage sink.
pub enum Encoder<W: Write> {
    Plain(W),
    Gzip(flate2::write::GzEncoder<W>),
    Xz(xz2::write::XzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
    Lz4(Box<lz4::Encoder<W>>),
}

impl<W: Write> Encoder<W> {
    /// Wrap `sink` with the selected codec at `level` (clamped per codec).
    ///
    /// # Errors
    /// Codec initialization failures.
    pub fn new(compressor: Compressor, level: i32, sink: W) -> Result<Self> {
        Ok(match compressor {
            Compressor::None => Self::Plain(sink),
            Compressor::Gzip => {
                let level = level.clamp(0, 9) as u32;
                Self::Gzip(flate2::write::GzEncoder::new(
                    sink,
                    flate2::Compression::new(level),
                ))
            }
            Compressor::Xz => {
                let level = level.clamp(0, 9) as u32;
                Self::Xz(xz2::write::XzEncoder::new(sink, level))
            }
            Compressor::Zstd => {
                let level = level.clamp(1, 19);
                Self::Zstd(
                    zstd::stream::write::Encoder::new(sink, level).context("zstd encoder")?,
                )
            }
            Compressor::Lz4 => {
                let level = level.clamp(0, 12) as u32;
                Self::Lz4(Box::new(
                    lz4::EncoderBuilder::new()
                        .level(level)
                        .build(sink)
                        .context("lz4 encoder")?,
                ))
            }
        })
    }

    /// Flush codec trailers and hand the sink back.
    ///
    /// # Errors
    /// Codec finalization failures.
    pub fn finish(self) -> Result<W> {
        match self {
            Self::Plain(w) => Ok(w),
            Self::Gzip(enc) => enc.finish().context("finish gzip"),
            Self::Xz(enc) => enc.finish().context("finish xz"),
            Self::Zstd(enc) => enc.finish().context("finish zstd"),
            Self::Lz4(enc) => {
                let (w, result) = enc.finish();
                result.context("finish lz4")?;
                Ok(w)
            }
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(w) => w.write(buf),
            Self::Gzip(w) => w.write(buf),
            Self::Xz(w) => w.write(buf),
            Self::Zstd(w) => w.write(buf),
            Self::Lz4(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            Self::Gzip(w) => w.flush(),
            Self::Xz(w) => w.flush(),
            Self::Zstd(w) => w.flush(),
            Self::Lz4(w) => w.flush(),
        }
    }
}

/// Wrap `source` with the matching decoder.
///
/// # Errors
/// Codec initialization failures.
pub fn decoder<'a, R: Read + 'a>(compressor: Compressor, source: R) -> Result<Box<dyn Read + 'a>> {
    Ok(match compressor {
        Compressor::None => Box::new(source),
        Compressor::Gzip => Box::new(flate2::read::MultiGzDecoder::new(source)),
        Compressor::Xz => Box::new(xz2::read::XzDecoder::new(source)),
        Compressor::Zstd => {
            Box::new(zstd::stream::read::Decoder::new(source).context("zstd decoder")?)
        }
        Compressor::Lz4 => Box::new(lz4::Decoder::new(source).context("lz4 decoder")?),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    const ALL: [Compressor; 5] = [
        Compressor::None,
        Compressor::Gzip,
        Compressor::Xz,
        Compressor::Zstd,
        Compressor::Lz4,
    ];

    #[test]
    fn test_parse_ids() {
        assert_eq!("zstd".parse::<Compressor>().unwrap(), Compressor::Zstd);
        assert_eq!("GZ".parse::<Compressor>().unwrap(), Compressor::Gzip);
        assert_eq!("none".parse::<Compressor>().unwrap(), Compressor::None);
        assert!("brotli".parse::<Compressor>().is_err());

        for c in ALL {
            assert_eq!(c.id().parse::<Compressor>().unwrap(), c);
        }
    }

    #[test]
    fn test_round_trip_every_codec() {
        let payload: Vec<u8> = (0..64 * 1024u32).flat_map(|i| i.to_le_bytes()).collect();

        for compressor in ALL {
            let mut encoder = Encoder::new(compressor, DEFAULT_LEVEL, Vec::new()).unwrap();
            encoder.write_all(&payload).unwrap();
            let stored = encoder.finish().unwrap();

            if compressor != Compressor::None {
                assert!(
                    stored.len() < payload.len(),
                    "{compressor} did not shrink the payload"
                );
            }

            let mut decoded = Vec::new();
            decoder(compressor, stored.as_slice())
                .unwrap()
                .read_to_end(&mut decoded)
                .unwrap();
            assert_eq!(decoded, payload, "{compressor} round trip");
        }
    }

    #[test]
    fn test_levels_are_clamped() {
        for compressor in ALL {
            let mut encoder = Encoder::new(compressor, 9999, Vec::new()).unwrap();
            encoder.write_all(b"clamp me").unwrap();
            let stored = encoder.finish().unwrap();

            let mut decoded = Vec::new();
            decoder(compressor, stored.as_slice())
                .unwrap()
                .read_to_end(&mut decoded)
                .unwrap();
            assert_eq!(decoded, b"clamp me");
        }
    }
}
