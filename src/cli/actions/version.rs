//! The `version` action, with the same injected-writer surface as `list`.

use crate::cli::actions::Action;
use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct VersionInfo {
    name: &'static str,
    version: &'static str,
}

/// # Errors
/// Writer failures only.
pub fn handle(action: &Action, out: &mut dyn Write) -> Result<()> {
    let Action::Version { json } = action else {
        bail!("not a version action");
    };

    let info = VersionInfo {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    };

    if *json {
        serde_json::to_writer(&mut *out, &info).context("write version")?;
        writeln!(out)?;
    } else {
        writeln!(out, "{} {}", info.name, info.version)?;
    }

    Ok(())
}
