//! Turn parsed matches into an [`Action`].

use crate::backends::split_destinations;
use crate::cli::actions::{Action, SendMode};
use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use clap::ArgMatches;

/// # Errors
/// Inconsistent or unparsable arguments; nothing here has side effects.
pub fn dispatch(matches: &ArgMatches) -> Result<Action> {
    match matches.subcommand() {
        Some(("send", sub)) => dispatch_send(sub),
        Some(("receive", sub)) => dispatch_receive(sub),
        Some(("list", sub)) => dispatch_list(sub),
        Some(("version", sub)) => Ok(Action::Version {
            json: flag(sub, "jsonOutput"),
        }),
        _ => bail!("no subcommand"),
    }
}

fn dispatch_send(sub: &ArgMatches) -> Result<Action> {
    let source = required(sub, "source")?;
    let destinations = destinations(sub)?;

    let mode = if let Some(from) = sub.get_one::<String>("incremental") {
        if !source.contains('@') {
            bail!("{source}: incremental target must be dataset@snapshot");
        }
        SendMode::Manual {
            from: from.clone(),
            to: source,
        }
    } else if flag(sub, "increment") || flag(sub, "auto") {
        if source.contains('@') || source.contains('#') {
            bail!("{source}: smart incremental takes a dataset, not a snapshot");
        }
        SendMode::Smart {
            dataset: source,
            fallback_full: flag(sub, "auto"),
        }
    } else {
        if !source.contains('@') {
            bail!("{source}: expected dataset@snapshot (or --increment/--auto with a dataset)");
        }
        if source.contains('#') {
            bail!("{source}: a bookmark cannot be a backup target");
        }
        SendMode::Full { source }
    };

    Ok(Action::Send { mode, destinations })
}

fn dispatch_receive(sub: &ArgMatches) -> Result<Action> {
    let source = required(sub, "source")?;
    let auto = flag(sub, "auto");

    if auto && source.contains('@') {
        bail!("{source}: --auto takes a dataset, not a snapshot");
    }
    if !auto && !source.contains('@') {
        bail!("{source}: expected dataset@snapshot (or --auto with a dataset)");
    }

    let props = sub
        .get_many::<String>("option")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();

    Ok(Action::Receive {
        source,
        auto,
        incremental: flag(sub, "incremental"),
        force: flag(sub, "force"),
        props,
        destinations: destinations(sub)?,
        target: required(sub, "target")?,
    })
}

fn dispatch_list(sub: &ArgMatches) -> Result<Action> {
    Ok(Action::List {
        destinations: destinations(sub)?,
        volume_glob: sub.get_one::<String>("volumeName").cloned(),
        before: parse_time(sub, "before")?,
        after: parse_time(sub, "after")?,
        json: flag(sub, "jsonOutput"),
    })
}

fn destinations(sub: &ArgMatches) -> Result<Vec<String>> {
    let raw = required(sub, "destination")?;
    let list = split_destinations(&raw);
    if list.is_empty() {
        bail!("no destinations in {raw:?}");
    }
    Ok(list)
}

fn required(sub: &ArgMatches, name: &str) -> Result<String> {
    sub.get_one::<String>(name)
        .cloned()
        .ok_or_else(|| anyhow!("missing {name}"))
}

fn flag(sub: &ArgMatches, name: &str) -> bool {
    sub.get_one::<bool>(name).copied().unwrap_or(false)
}

fn parse_time(sub: &ArgMatches, name: &str) -> Result<Option<DateTime<Utc>>> {
    let Some(raw) = sub.get_one::<String>(name) else {
        return Ok(None);
    };

    let parsed = DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("--{name} {raw}: expected RFC 3339, e.g. 2026-07-30T17:50:30Z"))?;

    Ok(Some(parsed))
}
