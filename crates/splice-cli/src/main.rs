//! splice CLI
//!
//! Command-line interface for the interception engine.

mod args;
mod commands;
mod logging;

use anyhow::{Context, Result};
use args::Args;
use clap::Parser;
use splice_core::Config;
use tracing::error;

fn main() -> Result<()> {
    let args = Args::parse();

    // A broken file is reported by the command itself, after logging is up
    let config = args.config.as_deref().and_then(|path| Config::load(path).ok());
    let (level, json) = config
        .as_ref()
        .map_or((None, false), |c| (Some(c.logging.level.as_str()), c.logging.json_format));
    logging::init(&args, level, json)?;

    let result = run(args, config);
    if let Err(ref e) = result {
        error!("Fatal error: {:#}", e);
    }
    result
}

fn run(args: Args, loaded: Option<Config>) -> Result<()> {
    let config = match (loaded, &args.config) {
        (Some(config), _) => Some(config),
        (None, Some(path)) => Some(
            Config::load(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
        ),
        (None, None) => None,
    };

    match args.command {
        commands::Command::Config(config_args) => commands::config::execute(config_args, config),
        commands::Command::Demo(demo_args) => commands::demo::execute(demo_args, config),
    }
}
