//! Integration tests for configuration module

use splice_core::config::{Config, PatternEncoding, Profile, RuleConfig, RuleScope};
use splice_core::intercept::Operator;
use splice_core::modifier::Direction;
use splice_core::{ConfiguredInterceptor, Error, StreamInterceptor};
use std::net::Ipv4Addr;
use std::time::Duration;

#[test]
fn test_config_from_profile_passthrough() {
    let config = Config::from_profile(Profile::Passthrough);
    assert!(!config.http.enabled);
    assert!(config.replace.rules.is_empty());

    let interceptor = ConfiguredInterceptor::from_config(&config).unwrap();
    assert!(interceptor.operators().is_empty());
}

#[test]
fn test_config_from_profile_rewrite() {
    let config = Config::from_profile(Profile::Rewrite);
    let interceptor = ConfiguredInterceptor::from_config(&config).unwrap();
    assert!(matches!(interceptor.operators(), [Operator::Replace(_)]));
}

#[test]
fn test_all_profiles_valid() {
    for profile in Profile::ALL {
        let config = Config::from_profile(profile);
        assert!(config.validate().is_ok(), "Profile {profile:?} failed validation");
    }
}

#[test]
fn test_toml_serialization_roundtrip() {
    let mut original = Config::from_profile(Profile::Plaintext);
    original.replace.rules.push(RuleConfig {
        find: "cafe".to_string(),
        replace: "beef".to_string(),
        encoding: PatternEncoding::Hex,
        direction: Direction::Downstream,
        scope: RuleScope::HttpBody,
    });

    let toml_str = original.to_toml().expect("Failed to serialize");
    let parsed = Config::from_toml(&toml_str).expect("Failed to parse");

    assert_eq!(parsed.profile, Some(Profile::Plaintext));
    assert_eq!(parsed.http.strip_accept_encoding, original.http.strip_accept_encoding);
    assert_eq!(parsed.interception.ports, original.interception.ports);
    assert_eq!(parsed.replace.rules, original.replace.rules);
}

#[test]
fn test_partial_file_uses_defaults() {
    let config = Config::from_toml(
        r#"
        [interception]
        ports = [8080, 8000]
        exclude_addresses = ["10.1.2.3"]

        [socket]
        mss = 536

        [[replace.rules]]
        find = "Server: nginx"
        replace = "Server: splice"
        direction = "downstream"
        "#,
    )
    .unwrap();
    config.validate().unwrap();

    assert!(config.http.enabled);
    assert_eq!(config.socket_config().mss, 536);
    assert_eq!(config.socket_config().window, 65535);
    assert_eq!(config.intercept_options().tick_interval, Duration::from_millis(50));

    let rules = config.replacement_rules(RuleScope::Stream).unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].direction, Direction::Downstream);
    assert_eq!(rules[0].find.as_ref(), b"Server: nginx");

    let interceptor = ConfiguredInterceptor::from_config(&config).unwrap();
    let client = Ipv4Addr::new(10, 0, 0, 1);
    assert!(interceptor.should_intercept(client, Ipv4Addr::new(10, 0, 0, 2), 50000, 8080));
    assert!(!interceptor.should_intercept(client, Ipv4Addr::new(10, 0, 0, 2), 50000, 80));
    assert!(!interceptor.should_intercept(client, Ipv4Addr::new(10, 1, 2, 3), 50000, 8080));
}

#[test]
fn test_invalid_values_rejected() {
    let mut config = Config::default();
    config.interception.ports = vec![80, 0];
    assert!(matches!(config.validate(), Err(Error::InvalidPort { port: 0 })));

    let mut config = Config::default();
    config.socket.mss = 10;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.logging.level = "loud".to_string();
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.replace.rules.push(RuleConfig::text("", "x"));
    assert!(config.validate().is_err());

    let mut config = Config::default();
    let mut rule = RuleConfig::text("zz", "00");
    rule.encoding = PatternEncoding::Hex;
    config.replace.rules.push(rule);
    assert!(config.validate().is_err());
}

#[test]
fn test_missing_file() {
    assert!(matches!(
        Config::load("/nonexistent/splice.toml"),
        Err(Error::ConfigNotFound { .. })
    ));
}

#[test]
fn test_unknown_field_type_is_parse_error() {
    assert!(Config::from_toml("[interception]\nports = \"eighty\"\n").is_err());
}
