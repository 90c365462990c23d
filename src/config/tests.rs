//! Config module tests

use std::io::Write;
use std::time::Duration;

use super::*;

const MINIMAL_TOML: &str = r#"
name = "nofp"
broker = "localhost"
topic = "hal/nofp"
"#;

#[test]
fn test_substitute_env_vars_simple() {
    std::env::set_var("NOFP_TEST_VAR_SIMPLE", "hello");
    let result = substitute_env_vars("value = \"${NOFP_TEST_VAR_SIMPLE}\"");
    assert_eq!(result, "value = \"hello\"");
    std::env::remove_var("NOFP_TEST_VAR_SIMPLE");
}

#[test]
fn test_substitute_env_vars_with_default() {
    std::env::remove_var("NOFP_TEST_VAR_UNSET");
    let result = substitute_env_vars("port = ${NOFP_TEST_VAR_UNSET:-1884}");
    assert_eq!(result, "port = 1884");
}

#[test]
fn test_substitute_env_vars_missing_no_default() {
    std::env::remove_var("NOFP_TEST_VAR_MISSING");
    let result = substitute_env_vars("value = \"${NOFP_TEST_VAR_MISSING}\"");
    assert_eq!(result, "value = \"\"");
}

#[test]
fn test_minimal_config_defaults() {
    let config = BridgeConfig::parse(MINIMAL_TOML).unwrap();
    assert_eq!(config.name, "nofp");
    assert_eq!(config.port, 1883);
    assert_eq!(config.timeout, 60);
    assert_eq!(config.max_reconnects, 10);
    assert_eq!(config.max_startup, 10);
    assert_eq!(config.max_loop_reconnect, 10);
    assert_eq!(config.log_level, None);
    assert_eq!(config.retry_backoff, Duration::from_secs(30));
    assert_eq!(config.loop_timeout, Duration::from_secs(1));
    assert_eq!(config.qos(), QoS::AtMostOnce);
    assert!(config.param_conv.is_empty());
    assert!(config.client_id.starts_with("nofp-bridge-"));
}

#[test]
fn test_full_toml_config() {
    let config = BridgeConfig::parse(
        r#"
name = "hal"
description = "NOFP power meter"
broker = "10.0.0.5"
port = 1884
timeout = 15
topic = "hal/nofp/raw"
param_conv = [["voltage", "mv"], { field = "current", suffix = "ma" }]
max_reconnects = 3
max_startup = 4
max_loop_reconnect = 5
log_level = "DEBUG"
qos = 1
retain = true
retry_backoff = "2s"
loop_timeout = "250ms"
keep_alive = 30
"#,
    )
    .unwrap();

    assert_eq!(config.broker, "10.0.0.5");
    assert_eq!(config.port, 1884);
    assert_eq!(
        config.param_conv,
        vec![
            ParamConversion::new("voltage", "mv"),
            ParamConversion::new("current", "ma"),
        ]
    );
    assert_eq!(config.max_reconnects, 3);
    assert_eq!(config.max_startup, 4);
    assert_eq!(config.max_loop_reconnect, 5);
    assert_eq!(config.log_level.as_deref(), Some("DEBUG"));
    assert_eq!(config.qos(), QoS::AtLeastOnce);
    assert!(config.retain);
    assert_eq!(config.retry_backoff, Duration::from_secs(2));
    assert_eq!(config.loop_timeout, Duration::from_millis(250));
    assert_eq!(config.keep_alive_secs(), 30);
    assert_eq!(config.connect_timeout_duration(), Duration::from_secs(15));
}

#[test]
fn test_legacy_json_descriptor() {
    let config = BridgeConfig::parse_json(
        r#"{
            "name": "nofp",
            "description": "hal nofp bridge",
            "mqtt_broker": "broker.local",
            "mqtt_port": 1883,
            "mqtt_timeout": 60,
            "topic": "hal/nofp",
            "param_conv": [["v", "voltage"], ["i", "current"]],
            "mqtt_max_reconnects": 2,
            "mqtt_max_startup": 3,
            "mqtt_max_loop_reconnect": 4,
            "loglevel": "info"
        }"#,
    )
    .unwrap();

    assert_eq!(config.broker, "broker.local");
    assert_eq!(config.max_reconnects, 2);
    assert_eq!(config.max_startup, 3);
    assert_eq!(config.max_loop_reconnect, 4);
    assert_eq!(config.log_level.as_deref(), Some("info"));
    assert_eq!(config.param_conv[1], ParamConversion::new("i", "current"));
    // keep-alive follows the connect timeout unless set explicitly
    assert_eq!(config.keep_alive_secs(), 60);
}

#[test]
fn test_zero_ceiling_is_accepted_by_loader() {
    let config = BridgeConfig::parse(&format!("{}\nmax_startup = 0\n", MINIMAL_TOML)).unwrap();
    assert_eq!(config.max_startup, 0);
}

#[test]
fn test_negative_ceiling_is_rejected() {
    let result = BridgeConfig::parse(&format!("{}\nmax_reconnects = -1\n", MINIMAL_TOML));
    assert!(matches!(result, Err(ConfigError::Config(_))));
}

#[test]
fn test_missing_required_field() {
    let result = BridgeConfig::parse("name = \"nofp\"\nbroker = \"localhost\"\n");
    assert!(matches!(result, Err(ConfigError::Config(_))));
}

#[test]
fn test_invalid_qos() {
    let result = BridgeConfig::parse(&format!("{}\nqos = 2\n", MINIMAL_TOML));
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_wildcard_suffix_rejected() {
    let result = BridgeConfig::parse(&format!("{}\nparam_conv = [[\"v\", \"#\"]]\n", MINIMAL_TOML));
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_load_json_file_with_env_substitution() {
    std::env::set_var("NOFP_TEST_BROKER_HOST", "192.168.1.20");

    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    write!(
        file,
        r#"{{"name": "nofp", "mqtt_broker": "${{NOFP_TEST_BROKER_HOST}}", "mqtt_port": ${{NOFP_TEST_PORT_UNSET:-1885}}, "topic": "hal/nofp"}}"#
    )
    .unwrap();

    let config = BridgeConfig::load(file.path()).unwrap();
    assert_eq!(config.broker, "192.168.1.20");
    assert_eq!(config.port, 1885);

    std::env::remove_var("NOFP_TEST_BROKER_HOST");
}

#[test]
fn test_load_toml_file() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(MINIMAL_TOML.as_bytes()).unwrap();

    let config = BridgeConfig::load(file.path()).unwrap();
    assert_eq!(config.topic, "hal/nofp");
}

#[test]
fn test_load_missing_file() {
    let result = BridgeConfig::load("/nonexistent/nofp-bridge.json");
    assert!(matches!(result, Err(ConfigError::Io(_))));
}

#[test]
fn test_load_unsupported_extension() {
    let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
    let result = BridgeConfig::load(file.path());
    assert!(matches!(result, Err(ConfigError::Format(ext)) if ext == "ini"));
}
