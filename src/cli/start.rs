use crate::cli::{actions::Action, commands, dispatch, globals::GlobalArgs};
use crate::manifest::validate_separator;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Parse the command line, set up logging, and build the action plus the
/// global arguments. Nothing here touches ZFS or a destination.
///
/// # Errors
/// Invalid arguments; help/version exits are handled by clap.
pub fn start() -> Result<(Action, GlobalArgs)> {
    let cmd = commands::new();
    let matches = cmd.get_matches();

    let level = match matches
        .get_one::<String>("logLevel")
        .map(String::as_str)
        .unwrap_or("warn")
    {
        "error" => log::LevelFilter::Error,
        "info" => log::LevelFilter::Info,
        "debug" => log::LevelFilter::Debug,
        "trace" => log::LevelFilter::Trace,
        _ => log::LevelFilter::Warn,
    };

    env_logger::Builder::new().filter_level(level).init();

    let mut globals = GlobalArgs::default();

    if let Some(separator) = matches.get_one::<String>("separator") {
        globals.separator = validate_separator(separator)?;
    }

    if let Some(dir) = matches.get_one::<PathBuf>("workingDirectory") {
        if !dir.is_dir() {
            anyhow::bail!("--workingDirectory {}: not a directory", dir.display());
        }
        globals.working_directory = dir.clone();
    }

    if let Some(mib) = matches.get_one::<usize>("volsize") {
        let mib = u64::try_from(*mib).unwrap_or(u64::MAX);
        globals.volume_size = mib
            .checked_mul(1024 * 1024)
            .context("--volsize is out of range")?;
        if globals.volume_size == 0 {
            anyhow::bail!("--volsize must be at least 1 MiB");
        }
    }

    if let Some(n) = matches.get_one::<usize>("maxInFlight") {
        globals.max_in_flight = (*n).max(1);
    }

    if let Some(n) = matches.get_one::<usize>("maxRetries") {
        globals.retry.max_retries = u32::try_from(*n).unwrap_or(u32::MAX).max(1);
    }

    if let Some(secs) = matches.get_one::<usize>("maxBackoff") {
        globals.retry.max_backoff = Duration::from_secs(*secs as u64);
    }

    if let Some(secs) = matches.get_one::<usize>("timeout") {
        globals.timeout = Duration::from_secs((*secs as u64).max(1));
    }

    if let Some(policy) = matches.get_one::<String>("failurePolicy") {
        globals.failure_policy = policy.parse()?;
    }

    if let Some(compressor) = matches.get_one::<String>("compressor") {
        globals.compressor = compressor.parse()?;
    }

    if let Some(level) = matches.get_one::<usize>("compressionLevel") {
        globals.compression_level = i32::try_from(*level).unwrap_or(i32::MAX);
    }

    globals.quiet = matches.get_one::<bool>("quiet").copied().unwrap_or(false);
    globals.public_keyring = matches.get_one::<PathBuf>("publicKeyRingPath").cloned();
    globals.secret_keyring = matches.get_one::<PathBuf>("secretKeyRingPath").cloned();
    globals.encrypt_to = matches.get_one::<String>("encryptTo").cloned();
    globals.sign_from = matches.get_one::<String>("signFrom").cloned();

    log::debug!("globals: {globals:#?}");

    let action = dispatch::dispatch(&matches)?;

    log::debug!("action: {action:#?}");

    Ok((action, globals))
}
