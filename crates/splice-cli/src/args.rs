//! Command-line argument parsing

use crate::commands::Command;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// splice - TCP stream interception and rewriting
///
/// Terminates selected TCP flows in user-space stacks and relays the
/// payload through HTTP-aware or byte-level rewriters.
#[derive(Parser, Debug)]
#[command(name = "splice")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file path
    #[arg(short = 'c', long, value_name = "FILE", global = true, env = "SPLICE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Output format for logs
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Log file path
    #[arg(long, value_name = "FILE", global = true)]
    pub log_file: Option<PathBuf>,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text
    Text,
    /// JSON format
    Json,
    /// Compact format
    Compact,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::config::ConfigAction;

    #[test]
    fn test_verbose() {
        let args = Args::parse_from(["splice", "-v", "config", "profiles"]);
        assert_eq!(args.verbose, 1);

        let args = Args::parse_from(["splice", "config", "profiles", "-vvv"]);
        assert_eq!(args.verbose, 3);
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        assert!(Args::try_parse_from(["splice", "-q", "-v", "config", "profiles"]).is_err());
        let args = Args::parse_from(["splice", "-q", "config", "profiles"]);
        assert!(args.quiet);
    }

    #[test]
    fn test_global_config_and_format() {
        let args =
            Args::parse_from(["splice", "demo", "--config", "splice.toml", "--log-format", "json"]);
        assert_eq!(args.config, Some(PathBuf::from("splice.toml")));
        assert_eq!(args.log_format, LogFormat::Json);
        assert!(matches!(args.command, Command::Demo(_)));
    }

    #[test]
    fn test_config_subcommand() {
        let args =
            Args::parse_from(["splice", "config", "generate", "-p", "rewrite", "-o", "out.toml"]);
        let Command::Config(config) = args.command else {
            panic!("expected config command");
        };
        let ConfigAction::Generate { output, profile } = config.action else {
            panic!("expected generate");
        };
        assert_eq!(output, PathBuf::from("out.toml"));
        assert_eq!(profile, "rewrite");
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Args::try_parse_from(["splice"]).is_err());
    }
}
