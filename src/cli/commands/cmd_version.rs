use clap::{Arg, Command};

pub fn command() -> Command {
    Command::new("version")
        .about("Print version information")
        .arg(
            Arg::new("jsonOutput")
                .long("jsonOutput")
                .help("Machine-readable output")
                .num_args(0),
        )
}
