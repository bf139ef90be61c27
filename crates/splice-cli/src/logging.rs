//! Logging initialization

use crate::args::{Args, LogFormat};
use anyhow::{Context, Result};
use std::fs::File;
use std::path::Path;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Pick the level from the flags, falling back to the config file's
///
/// `-q` wins, then `-v`, then `configured`, then INFO.
pub fn level_for(args: &Args, configured: Option<&str>) -> Level {
    if args.quiet {
        return Level::ERROR;
    }
    match args.verbose {
        0 => configured.and_then(|level| level.parse().ok()).unwrap_or(Level::INFO),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn open_log_file(path: &Path) -> Result<File> {
    File::create(path).with_context(|| format!("Failed to create log file: {}", path.display()))
}

/// Initialize logging based on CLI arguments
///
/// `json` from the config file only applies when `--log-format` was left at
/// its default.
pub fn init(args: &Args, configured_level: Option<&str>, configured_json: bool) -> Result<()> {
    let level = level_for(args, configured_level);
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let format = if args.log_format == LogFormat::Text && configured_json {
        LogFormat::Json
    } else {
        args.log_format
    };

    // Logs go to stderr; stdout carries command output
    match format {
        LogFormat::Text => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(args.verbose >= 2)
                    .with_thread_names(args.verbose >= 2)
                    .with_file(args.verbose >= 3)
                    .with_line_number(args.verbose >= 3),
            );

            if let Some(ref log_file) = args.log_file {
                let file = open_log_file(log_file)?;
                subscriber.with(fmt::layer().with_ansi(false).with_writer(file)).init();
            } else {
                subscriber.init();
            }
        }
        LogFormat::Json => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr));

            if let Some(ref log_file) = args.log_file {
                let file = open_log_file(log_file)?;
                subscriber.with(fmt::layer().json().with_writer(file)).init();
            } else {
                subscriber.init();
            }
        }
        LogFormat::Compact => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }

    Ok(())
}
