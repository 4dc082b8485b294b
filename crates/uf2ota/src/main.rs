use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{Level, LevelFilter};
use std::io::Write;

mod apply;
mod dump;
mod info;
mod pack;
mod reporter;

#[derive(Parser)]
#[clap(version, about = "Pack, inspect and apply UF2/OTA firmware updates")]
struct Cli {
    /// Verbose
    #[clap(short, long, global = true)]
    verbose: bool,

    #[clap(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Create a UF2/OTA package from binary inputs
    Pack(pack::PackArgs),
    /// Print information about a package
    Info(info::InfoArgs),
    /// Extract per-scheme firmware images from a package
    Dump(dump::DumpArgs),
    /// Apply a package to a flash image file, the way a device would
    Apply(apply::ApplyArgs),
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(Env::default())
        .filter_level(match cli.verbose {
            true => LevelFilter::Debug,
            false => LevelFilter::Info,
        })
        .target(env_logger::Target::Stdout)
        .format(|buf, record| {
            let level = record.level();
            if level == Level::Info {
                writeln!(buf, "{}", record.args())
            } else {
                writeln!(buf, "{}: {}", record.level(), record.args())
            }
        })
        .init();

    match cli.command {
        Cmd::Pack(args) => pack::run(args),
        Cmd::Info(args) => info::run(args),
        Cmd::Dump(args) => dump::run(args),
        Cmd::Apply(args) => apply::run(args),
    }
}

/// Clap cannot parse numbers with a base prefix out of the box.
pub(crate) fn parse_u32(s: &str) -> Result<u32, String> {
    let result = if let Some(hex) = s.strip_prefix("0x") {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    result.map_err(|err| format!("{s:?}: {err}"))
}
