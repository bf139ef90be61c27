//! Configuration presets

use super::{Config, RuleConfig};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Predefined configuration profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// Terminate flows and relay bytes unchanged
    Passthrough,
    /// Parse HTTP and decode bodies (default)
    Http,
    /// HTTP with compression negotiated away so bodies can be rewritten
    Plaintext,
    /// Raw byte replacement without HTTP parsing
    Rewrite,
    /// Defaults, for hand editing
    Custom,
}

impl Profile {
    /// Every profile
    pub const ALL: [Profile; 5] = [
        Profile::Passthrough,
        Profile::Http,
        Profile::Plaintext,
        Profile::Rewrite,
        Profile::Custom,
    ];

    /// Convert profile to full configuration
    pub fn into_config(self) -> Config {
        let mut config = Config::default();
        config.general.name = self.name().to_string();

        match self {
            Profile::Passthrough => {
                config.http.enabled = false;
            }
            Profile::Http => {}
            Profile::Plaintext => {
                config.http.strip_accept_encoding = true;
                config.http.decompress = true;
            }
            Profile::Rewrite => {
                config.http.enabled = false;
                config.replace.rules = vec![RuleConfig::text("http://", "https://")];
            }
            Profile::Custom => {}
        }

        config.profile = Some(self);
        config
    }

    /// Get profile name
    pub fn name(&self) -> &'static str {
        match self {
            Profile::Passthrough => "passthrough",
            Profile::Http => "http",
            Profile::Plaintext => "plaintext",
            Profile::Rewrite => "rewrite",
            Profile::Custom => "custom",
        }
    }

    /// Get profile description
    pub fn description(&self) -> &'static str {
        match self {
            Profile::Passthrough => "Terminate and relay, no rewriting",
            Profile::Http => "HTTP framing with body decoding (default)",
            Profile::Plaintext => "HTTP with Accept-Encoding stripped",
            Profile::Rewrite => "Raw byte replacement",
            Profile::Custom => "Custom configuration",
        }
    }

    /// Parse profile from name string
    pub fn from_name(name: &str) -> Result<Self> {
        name.parse()
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Profile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "passthrough" | "pass" => Ok(Profile::Passthrough),
            "http" | "default" => Ok(Profile::Http),
            "plaintext" | "plain" => Ok(Profile::Plaintext),
            "rewrite" => Ok(Profile::Rewrite),
            "custom" => Ok(Profile::Custom),
            _ => Err(Error::config_value("profile", format!("Unknown profile: {s}"))),
        }
    }
}
