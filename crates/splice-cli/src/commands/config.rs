//! Config command - configuration management

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use splice_core::config::{Config, Profile, RuleScope};
use std::path::{Path, PathBuf};
use tracing::info;

/// Config command arguments
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show {
        /// Profile to show instead of the loaded file
        #[arg(short, long)]
        profile: Option<String>,
    },

    /// Write a configuration file from a profile
    Generate {
        /// Output file path
        #[arg(short, long, default_value = "splice.toml")]
        output: PathBuf,

        /// Profile to use as base
        #[arg(short, long, default_value = "http")]
        profile: String,
    },

    /// Validate a configuration file
    Validate {
        /// Config file to validate
        file: PathBuf,
    },

    /// List available profiles
    Profiles,
}

/// Execute config command
pub fn execute(args: ConfigArgs, loaded: Option<Config>) -> Result<()> {
    match args.action {
        ConfigAction::Show { profile } => show_config(loaded, profile.as_deref()),
        ConfigAction::Generate { output, profile } => generate_config(&output, &profile),
        ConfigAction::Validate { file } => validate_config(&file),
        ConfigAction::Profiles => {
            list_profiles();
            Ok(())
        }
    }
}

fn show_config(loaded: Option<Config>, profile: Option<&str>) -> Result<()> {
    let config = match (profile, loaded) {
        (Some(name), _) => Config::from_profile(Profile::from_name(name)?),
        (None, Some(config)) => config,
        (None, None) => Config::default(),
    };
    println!("{}", config.to_toml().context("Failed to serialize config")?);
    Ok(())
}

fn generate_config(output: &Path, profile_name: &str) -> Result<()> {
    let profile = Profile::from_name(profile_name)
        .with_context(|| format!("Unknown profile: {profile_name}"))?;
    let config = Config::from_profile(profile);
    let toml_str = config.to_toml().context("Failed to serialize config")?;

    let content = format!(
        "# splice configuration\n\
         # Generated from profile: {profile} ({})\n\n\
         {toml_str}",
        profile.description()
    );

    std::fs::write(output, content)
        .with_context(|| format!("Failed to write config to {}", output.display()))?;

    info!(path = %output.display(), %profile, "Generated config file");
    println!("Configuration file generated: {}", output.display());
    Ok(())
}

fn validate_config(file: &Path) -> Result<()> {
    let config = Config::load(file)
        .with_context(|| format!("Failed to load config from {}", file.display()))?;
    config.validate().context("Configuration validation failed")?;

    let stream_rules = config.replacement_rules(RuleScope::Stream)?.len();
    let body_rules = config.replacement_rules(RuleScope::HttpBody)?.len();

    println!("Configuration is valid");
    println!("  Profile: {}", config.profile.map_or_else(|| "none".to_string(), |p| p.to_string()));
    println!("  Ports: {:?}", config.interception.ports);
    println!("  HTTP operator: {}", if config.http.enabled { "enabled" } else { "disabled" });
    println!("  Replacement rules: {stream_rules} stream, {body_rules} body");
    Ok(())
}

fn list_profiles() {
    println!("Available profiles:");
    for profile in Profile::ALL {
        println!("  {:<12} {}", profile.name(), profile.description());
    }
}
