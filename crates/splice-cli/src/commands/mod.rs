//! CLI commands

pub mod config;
pub mod demo;

use clap::Subcommand;

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Configuration management
    Config(config::ConfigArgs),

    /// Run one intercepted HTTP exchange on an in-memory network
    Demo(demo::DemoArgs),
}
