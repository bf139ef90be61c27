//! Configuration management for splice
//!
//! Provides a strongly-typed configuration system with TOML support
//! and profile-based presets.

mod profile;

pub use profile::Profile;

use crate::error::{Error, Result};
use crate::intercept::InterceptOptions;
use crate::modifier::{Direction, HttpOptions, ReplacementRule};
use crate::tcp::SocketConfig;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

/// Log levels accepted in `[logging]`
const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Preset this configuration was derived from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<Profile>,

    /// General settings
    pub general: GeneralConfig,

    /// Which flows are intercepted
    pub interception: InterceptionConfig,

    /// Synthetic socket tunables
    pub socket: SocketSection,

    /// HTTP operator settings
    pub http: HttpConfig,

    /// Byte replacement rules
    pub replace: ReplaceConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| Error::ConfigNotFound {
            path: path.display().to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(Error::from)
    }

    /// Create configuration from a preset profile
    pub fn from_profile(profile: Profile) -> Self {
        profile.into_config()
    }

    /// Serialize to a TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(&port) = self.interception.ports.iter().find(|&&p| p == 0) {
            return Err(Error::InvalidPort { port: u32::from(port) });
        }
        if self.interception.tick_interval_ms == 0 {
            return Err(Error::config_value("interception.tick_interval_ms", "Must be positive"));
        }

        let socket = &self.socket;
        if socket.mss < 64 {
            return Err(Error::config_value("socket.mss", "Must be at least 64"));
        }
        if socket.window == 0 {
            return Err(Error::config_value("socket.window", "Must be positive"));
        }
        for (key, value) in [
            ("socket.retransmit_timeout_ms", socket.retransmit_timeout_ms),
            ("socket.connect_timeout_ms", socket.connect_timeout_ms),
            ("socket.close_timeout_ms", socket.close_timeout_ms),
        ] {
            if value == 0 {
                return Err(Error::config_value(key, "Must be positive"));
            }
        }

        self.socket_config().validate()?;

        if self.http.max_header_bytes < 256 {
            return Err(Error::config_value("http.max_header_bytes", "Must be at least 256"));
        }

        // Decodes every pattern, rejecting empty ones and bad hex
        for rule in &self.replace.rules {
            rule.to_rule()?;
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_value(
                "logging.level",
                format!(
                    "Unknown level '{}', expected one of {}",
                    self.logging.level,
                    LOG_LEVELS.join(", ")
                ),
            ));
        }

        Ok(())
    }

    /// Socket configuration for every synthetic stack
    pub fn socket_config(&self) -> SocketConfig {
        let s = &self.socket;
        SocketConfig {
            mss: s.mss,
            window: s.window,
            retransmit_timeout: Duration::from_millis(s.retransmit_timeout_ms),
            max_retransmissions: s.max_retransmissions,
            connect_timeout: Duration::from_millis(s.connect_timeout_ms),
            close_timeout: Duration::from_millis(s.close_timeout_ms),
            time_wait: Duration::from_millis(s.time_wait_ms),
        }
    }

    /// Orchestrator options
    pub fn intercept_options(&self) -> InterceptOptions {
        InterceptOptions {
            socket: self.socket_config(),
            auto_exclude_local: self.interception.auto_exclude_local,
            tick_interval: Duration::from_millis(self.interception.tick_interval_ms),
        }
    }

    /// Replacement rules of one scope
    pub fn replacement_rules(&self, scope: RuleScope) -> Result<Vec<ReplacementRule>> {
        self.replace
            .rules
            .iter()
            .filter(|r| r.scope == scope)
            .map(RuleConfig::to_rule)
            .collect()
    }

    /// HTTP operator options, body rules included
    pub fn http_options(&self) -> Result<HttpOptions> {
        Ok(HttpOptions {
            decompress: self.http.decompress,
            strip_accept_encoding: self.http.strip_accept_encoding,
            max_header_bytes: self.http.max_header_bytes,
            replacements: self.replacement_rules(RuleScope::HttpBody)?,
        })
    }
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Configuration name
    pub name: String,
    /// Configuration version
    pub version: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            version: "1.0".to_string(),
        }
    }
}

/// Flow selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptionConfig {
    /// Server ports to intercept; empty intercepts every port
    pub ports: Vec<u16>,
    /// Leave flows of this host's own addresses alone
    pub auto_exclude_local: bool,
    /// Addresses whose flows are never intercepted
    pub exclude_addresses: Vec<Ipv4Addr>,
    /// Socket timer period in milliseconds
    pub tick_interval_ms: u64,
}

impl Default for InterceptionConfig {
    fn default() -> Self {
        Self {
            ports: vec![80],
            auto_exclude_local: true,
            exclude_addresses: Vec::new(),
            tick_interval_ms: 50,
        }
    }
}

/// Synthetic socket tunables, durations in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketSection {
    /// Largest segment payload
    pub mss: u16,
    /// Advertised receive window
    pub window: u16,
    /// Base retransmission timeout
    pub retransmit_timeout_ms: u64,
    /// Retries before giving up
    pub max_retransmissions: u32,
    /// Active-open handshake bound
    pub connect_timeout_ms: u64,
    /// Blocking close bound
    pub close_timeout_ms: u64,
    /// TIME-WAIT duration
    pub time_wait_ms: u64,
}

impl Default for SocketSection {
    fn default() -> Self {
        let defaults = SocketConfig::default();
        Self {
            mss: defaults.mss,
            window: defaults.window,
            retransmit_timeout_ms: duration_ms(defaults.retransmit_timeout),
            max_retransmissions: defaults.max_retransmissions,
            connect_timeout_ms: duration_ms(defaults.connect_timeout),
            close_timeout_ms: duration_ms(defaults.close_timeout),
            time_wait_ms: duration_ms(defaults.time_wait),
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// HTTP operator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Put the HTTP operator in the chain
    pub enabled: bool,
    /// Decode gzip/deflate bodies
    pub decompress: bool,
    /// Remove Accept-Encoding from requests
    pub strip_accept_encoding: bool,
    /// Upper bound for a header block
    pub max_header_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            decompress: true,
            strip_accept_encoding: false,
            max_header_bytes: 64 * 1024,
        }
    }
}

/// Replacement rule list
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplaceConfig {
    /// Rules in priority order
    pub rules: Vec<RuleConfig>,
}

/// How a pattern string is written
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternEncoding {
    /// UTF-8 text
    #[default]
    Text,
    /// Hex digits
    Hex,
}

/// Where a rule applies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    /// Raw relayed bytes
    #[default]
    Stream,
    /// Decoded HTTP bodies
    HttpBody,
}

/// One replacement rule as written in the file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Pattern to look for
    pub find: String,
    /// Substitution
    pub replace: String,
    /// Encoding of both patterns
    #[serde(default)]
    pub encoding: PatternEncoding,
    /// Direction the rule applies to
    #[serde(default)]
    pub direction: Direction,
    /// Raw stream or HTTP body
    #[serde(default)]
    pub scope: RuleScope,
}

impl RuleConfig {
    /// Text rule for both directions of the raw stream
    pub fn text(find: impl Into<String>, replace: impl Into<String>) -> Self {
        Self {
            find: find.into(),
            replace: replace.into(),
            encoding: PatternEncoding::Text,
            direction: Direction::Both,
            scope: RuleScope::Stream,
        }
    }

    /// Decode into a [`ReplacementRule`]
    pub fn to_rule(&self) -> Result<ReplacementRule> {
        let (find, replace) = match self.encoding {
            PatternEncoding::Text => {
                (self.find.as_bytes().to_vec(), self.replace.as_bytes().to_vec())
            }
            PatternEncoding::Hex => (hex::decode(&self.find)?, hex::decode(&self.replace)?),
        };
        Ok(ReplacementRule::new(find, replace)?.with_direction(self.direction))
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log file path (None = stdout only)
    pub file: Option<String>,
    /// Enable JSON format logging
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            json_format: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.interception.ports, [80]);
        assert!(config.http.enabled);
        assert!(config.validate().is_ok());
        assert_eq!(config.socket_config(), SocketConfig::default());
    }

    #[test]
    fn test_validation_rejects_port_zero() {
        let mut config = Config::default();
        config.interception.ports = vec![80, 0];
        assert!(matches!(config.validate(), Err(Error::InvalidPort { port: 0 })));
    }

    #[test]
    fn test_validation_rejects_bad_rules() {
        let mut config = Config::default();
        config.replace.rules = vec![RuleConfig::text("", "x")];
        assert!(config.validate().is_err());

        config.replace.rules = vec![RuleConfig {
            encoding: PatternEncoding::Hex,
            ..RuleConfig::text("zz", "00")
        }];
        assert!(matches!(config.validate(), Err(Error::HexDecode(_))));
    }

    #[test]
    fn test_validation_rejects_unknown_level() {
        let mut config = Config::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_parse_rules() {
        let content = r#"
[interception]
ports = [80, 8080]

[[replace.rules]]
find = "foo"
replace = "bar"
direction = "downstream"

[[replace.rules]]
find = "48656c6c6f"
replace = "4869"
encoding = "hex"
scope = "http_body"
"#;
        let config = Config::from_toml(content).unwrap();
        assert_eq!(config.interception.ports, [80, 8080]);

        let stream = config.replacement_rules(RuleScope::Stream).unwrap();
        assert_eq!(stream.len(), 1);
        assert_eq!(stream[0].direction, Direction::Downstream);

        let http = config.http_options().unwrap();
        assert_eq!(http.replacements.len(), 1);
        assert_eq!(http.replacements[0].find.as_ref(), b"Hello");
        assert_eq!(http.replacements[0].replace.as_ref(), b"Hi");
    }

    #[test]
    fn test_toml_roundtrip_keeps_socket_section() {
        let mut config = Config::default();
        config.socket.mss = 536;
        config.socket.time_wait_ms = 100;
        let parsed = Config::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(parsed.socket_config().mss, 536);
        assert_eq!(parsed.socket_config().time_wait, Duration::from_millis(100));
    }

    #[test]
    fn test_toml_parse_invalid() {
        assert!(Config::from_toml("this is not [valid toml").is_err());
    }
}
