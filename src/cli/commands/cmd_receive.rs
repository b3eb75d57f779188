use crate::cli::commands::validator_key_value;
use clap::{Arg, Command};

pub fn command() -> Command {
    Command::new("receive")
        .about("Restore a backup into a target dataset")
        .arg(
            Arg::new("force")
                .short('F')
                .long("force")
                .help("Pass -F to zfs receive (rollback the target)")
                .num_args(0),
        )
        .arg(
            Arg::new("incremental")
                .short('i')
                .long("incremental")
                .help("Accept an incremental backup; its base must exist at the target")
                .num_args(0),
        )
        .arg(
            Arg::new("auto")
                .long("auto")
                .help("Chain the full backup and every incremental up to the newest")
                .num_args(0),
        )
        .arg(
            Arg::new("option")
                .short('o')
                .long("option")
                .help("Property for zfs receive, e.g. origin=pool/base@snap")
                .value_name("prop=val")
                .value_parser(validator_key_value())
                .action(clap::ArgAction::Append)
                .num_args(1),
        )
        .arg(
            Arg::new("source")
                .help("dataset@snapshot to restore, or just the dataset with --auto")
                .required(true)
                .num_args(1),
        )
        .arg(
            Arg::new("destination")
                .help("Destination URI holding the backup")
                .required(true)
                .num_args(1),
        )
        .arg(
            Arg::new("target")
                .help("Dataset to receive into")
                .required(true)
                .num_args(1),
        )
}
