use clap::{Arg, Command};

pub fn command() -> Command {
    Command::new("send")
        .about("Back up a snapshot to one or more destinations")
        .arg(
            Arg::new("incremental")
                .short('i')
                .long("incremental")
                .help("Incremental from this snapshot or bookmark")
                .value_name("dataset@snap|dataset#bookmark")
                .conflicts_with_all(["increment", "auto"])
                .num_args(1),
        )
        .arg(
            Arg::new("increment")
                .long("increment")
                .help("Smart incremental: pick the base from the destination's manifests")
                .conflicts_with("auto")
                .num_args(0),
        )
        .arg(
            Arg::new("auto")
                .long("auto")
                .help("Like --increment, but fall back to a full backup when nothing is there yet")
                .num_args(0),
        )
        .arg(
            Arg::new("source")
                .help("dataset@snapshot to send, or just the dataset with --increment/--auto")
                .required(true)
                .num_args(1),
        )
        .arg(
            Arg::new("destination")
                .help("Comma-separated destination URIs (aws://, azure://, gs://, b2://, file://, ssh://)")
                .required(true)
                .num_args(1),
        )
}
