//! Environment overrides for the broker address

use pretty_assertions::assert_eq;
use serial_test::serial;
use stream_consumer::consumer::config::{DEFAULT_HOST, DEFAULT_PORT};
use stream_consumer::consumer::ConsumerConfig;

fn clear_env() {
    std::env::remove_var("REDIS_HOST");
    std::env::remove_var("REDIS_PORT");
}

#[test]
#[serial]
fn test_defaults_without_env() {
    clear_env();

    let config = ConsumerConfig::from_env().expect("defaults");

    assert_eq!(config.host, DEFAULT_HOST);
    assert_eq!(config.port, DEFAULT_PORT);
    assert_eq!(config.redis_url(), "redis://redis:6379/");
}

#[test]
#[serial]
fn test_env_overrides_host_and_port() {
    clear_env();
    std::env::set_var("REDIS_HOST", "cache.internal");
    std::env::set_var("REDIS_PORT", "6380");

    let config = ConsumerConfig::from_env().expect("overrides");
    clear_env();

    assert_eq!(config.host, "cache.internal");
    assert_eq!(config.port, 6380);
    assert_eq!(config.redis_url(), "redis://cache.internal:6380/");
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn test_invalid_port_is_rejected() {
    clear_env();
    std::env::set_var("REDIS_PORT", "not-a-port");

    let result = ConsumerConfig::from_env();
    clear_env();

    let err = result.unwrap_err();
    assert!(err.contains("REDIS_PORT"), "unexpected message: {err}");
}
