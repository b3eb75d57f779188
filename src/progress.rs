//! Terminal progress readout for long transfers.
//!
//! Backups run against an unbounded send stream, so the upload readout is a
//! spinner counting bytes as destinations confirm them; restores know the
//! total stored size up front and get a real bar. Everything here is a no-op
//! under `--quiet` or when no style can be built, so callers never branch.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

const UPLOAD_TEMPLATE: &str = "{spinner:.cyan} {elapsed} {bytes} confirmed ({bytes_per_sec})";
const DOWNLOAD_TEMPLATE: &str =
    "{percent:>3}% [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

#[derive(Debug, Default, Clone)]
pub struct Progress {
    bar: Option<ProgressBar>,
}

impl Progress {
    /// Spinner for a backup: total unknown until the send stream ends.
    #[must_use]
    pub fn for_upload(quiet: bool) -> Self {
        if quiet {
            return Self::default();
        }

        let Some(style) = style(UPLOAD_TEMPLATE) else {
            return Self::default();
        };

        let bar = ProgressBar::new_spinner();
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(150));

        Self { bar: Some(bar) }
    }

    /// Bar for a restore: the manifest already knows every stored size.
    #[must_use]
    pub fn for_download(total_bytes: u64, quiet: bool) -> Self {
        if quiet {
            return Self::default();
        }

        let Some(style) = style(DOWNLOAD_TEMPLATE) else {
            return Self::default();
        };

        let bar = ProgressBar::new(total_bytes);
        bar.set_style(style.progress_chars("=> "));

        Self { bar: Some(bar) }
    }

    /// Account more confirmed bytes.
    pub fn add_bytes(&self, bytes: u64) {
        if let Some(bar) = &self.bar {
            bar.inc(bytes);
        }
    }

    /// Clear the readout; the final summary goes through the logger instead.
    pub fn done(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }
}

fn style(template: &str) -> Option<ProgressStyle> {
    match ProgressStyle::with_template(template) {
        Ok(style) => Some(style),
        Err(err) => {
            log::debug!("progress template rejected: {err}");
            None
        }
    }
}
