use clap::{Arg, Command};

pub fn command() -> Command {
    Command::new("list")
        .about("List the backups at a destination")
        .arg(
            Arg::new("volumeName")
                .long("volumeName")
                .help("Only datasets matching this glob")
                .value_name("glob")
                .num_args(1),
        )
        .arg(
            Arg::new("before")
                .long("before")
                .help("Only backups whose target snapshot is older (RFC 3339)")
                .value_name("timestamp")
                .num_args(1),
        )
        .arg(
            Arg::new("after")
                .long("after")
                .help("Only backups whose target snapshot is newer (RFC 3339)")
                .value_name("timestamp")
                .num_args(1),
        )
        .arg(
            Arg::new("jsonOutput")
                .long("jsonOutput")
                .help("Machine-readable output")
                .num_args(0),
        )
        .arg(
            Arg::new("destination")
                .help("Destination URI(s), comma-separated")
                .required(true)
                .num_args(1),
        )
}
