use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use simplelog::LevelFilter;

mod extract;
mod validate;


/// Runs column packs over tables to normalise them onto a configuration's canonical columns.
#[derive(Parser)]
#[command(name = "colpack")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Logging level.
    #[arg(long, default_value = "Warn")]
    log_level: LevelFilter,
}

#[derive(Subcommand)]
enum Command {
    Validate(validate::Command),
    Extract(extract::Command),
}

pub fn run() -> Result<()> {
    let args = Args::parse();

    simplelog::SimpleLogger::init(args.log_level, simplelog::Config::default())
        .with_context(|| "configuring logging")?;

    v8wrapper::init_v8();

    use Command::*;
    match &args.command {
        Validate(cmd) => validate::run(cmd),
        Extract(cmd) => extract::run(cmd),
    }
}
