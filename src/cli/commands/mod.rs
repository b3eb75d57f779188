pub mod cmd_list;
pub mod cmd_receive;
pub mod cmd_send;
pub mod cmd_version;

use clap::{
    Arg, ColorChoice, Command,
    builder::ValueParser,
    builder::styling::{AnsiColor, Effects, Styles},
    value_parser,
};
use std::path::PathBuf;

/// `prop=value` pairs for `zfs receive -o`; the property name must not be
/// empty, everything after the first `=` is opaque.
pub fn validator_key_value() -> ValueParser {
    ValueParser::from(move |s: &str| -> std::result::Result<String, String> {
        match s.split_once('=') {
            Some((key, _)) if !key.is_empty() => Ok(s.to_string()),
            _ => Err(String::from("property format is prop=value")),
        }
    })
}

pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    Command::new("zbak")
        .about("Back up ZFS datasets to object stores, and restore them")
        .version(env!("CARGO_PKG_VERSION"))
        .color(ColorChoice::Auto)
        .styles(styles)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("logLevel")
                .long("logLevel")
                .help("Log verbosity on stderr")
                .value_parser(["error", "warn", "info", "debug", "trace"])
                .default_value("warn")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("quiet")
                .long("quiet")
                .short('q')
                .help("Don't show progress")
                .global(true)
                .num_args(0),
        )
        .arg(
            Arg::new("separator")
                .long("separator")
                .help("Object-name separator, for backends with reserved characters")
                .value_name("char")
                .default_value("|")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("workingDirectory")
                .long("workingDirectory")
                .help("Scratch directory for spilled volumes")
                .value_name("dir")
                .value_parser(value_parser!(PathBuf))
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("volsize")
                .long("volsize")
                .help("Volume size in MiB")
                .value_name("MiB")
                .value_parser(value_parser!(usize))
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("maxInFlight")
                .long("maxInFlight")
                .help("Volumes allowed in flight at once")
                .value_name("n")
                .value_parser(value_parser!(usize))
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("maxRetries")
                .long("maxRetries")
                .help("Attempts per backend operation")
                .value_name("n")
                .value_parser(value_parser!(usize))
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("maxBackoff")
                .long("maxBackoff")
                .help("Retry backoff ceiling in seconds")
                .value_name("seconds")
                .value_parser(value_parser!(usize))
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .help("Per-request backend timeout in seconds")
                .value_name("seconds")
                .value_parser(value_parser!(usize))
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("failurePolicy")
                .long("failurePolicy")
                .help("What a failed destination does to the job")
                .value_parser(["fail-fast", "continue-others"])
                .default_value("fail-fast")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("compressor")
                .long("compressor")
                .help("Volume compression")
                .value_parser(["none", "gzip", "xz", "zstd", "lz4"])
                .default_value("zstd")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("compressionLevel")
                .long("compressionLevel")
                .help("Compression level (clamped per codec)")
                .value_name("n")
                .value_parser(value_parser!(usize))
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("publicKeyRingPath")
                .long("publicKeyRingPath")
                .help("OpenPGP public keyring")
                .value_name("file")
                .value_parser(value_parser!(PathBuf))
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("secretKeyRingPath")
                .long("secretKeyRingPath")
                .help("OpenPGP secret keyring")
                .value_name("file")
                .value_parser(value_parser!(PathBuf))
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("encryptTo")
                .long("encryptTo")
                .help("Encrypt volumes to this user's public key")
                .value_name("user")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("signFrom")
                .long("signFrom")
                .help("Sign volumes with this user's secret key")
                .value_name("user")
                .global(true)
                .num_args(1),
        )
        .subcommand(cmd_send::command())
        .subcommand(cmd_receive::command())
        .subcommand(cmd_list::command())
        .subcommand(cmd_version::command())
}
