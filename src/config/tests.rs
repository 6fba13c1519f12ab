//! Config module tests

use super::*;

use std::collections::HashMap;

use pretty_assertions::assert_eq;

fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |name| map.get(name).cloned()
}

#[test]
fn test_substitute_env_vars_simple() {
    std::env::set_var("VG_TEST_VAR_SIMPLE", "hello");
    let result = substitute_env_vars("value = \"${VG_TEST_VAR_SIMPLE}\"");
    assert_eq!(result, "value = \"hello\"");
    std::env::remove_var("VG_TEST_VAR_SIMPLE");
}

#[test]
fn test_substitute_env_vars_with_default() {
    std::env::remove_var("VG_TEST_VAR_UNSET");
    let result = substitute_env_vars("url = \"${VG_TEST_VAR_UNSET:-mqtt://fallback}\"");
    assert_eq!(result, "url = \"mqtt://fallback\"");

    std::env::set_var("VG_TEST_VAR_SET", "env_value");
    let result = substitute_env_vars("value = \"${VG_TEST_VAR_SET:-default_value}\"");
    assert_eq!(result, "value = \"env_value\"");
    std::env::remove_var("VG_TEST_VAR_SET");
}

#[test]
fn test_substitute_env_vars_missing_no_default() {
    std::env::remove_var("VG_TEST_VAR_MISSING");
    let result = substitute_env_vars("value = \"${VG_TEST_VAR_MISSING}\"");
    assert_eq!(result, "value = \"\"");
}

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.http.bind.port(), 5000);
    assert_eq!(config.http.body_limit, 100 * 1024);
    assert_eq!(config.http.retry_hint, Duration::from_millis(10_000));
    assert_eq!(config.http.single_shot_timeout, Duration::from_millis(500));
    assert_eq!(config.http.shutdown_timeout, Duration::from_secs(5));
    assert_eq!(config.broker.url, "mqtt://localhost:1883");
    assert_eq!(config.commands.path, PathBuf::from("./commands.yml"));
    assert_eq!(config.auth.key(), None);
    assert!(!config.metrics.enabled);
    assert!(config.validate().is_ok());
}

#[test]
fn test_parse_full_config() {
    let toml = r#"
[log]
level = "warn"
debug = true

[broker]
url = "tcp://broker.internal:2883"
username = "gateway"
password = "secret"
client_id = "gateway-1"
keep_alive = 30
connect_timeout = "5s"
reconnect_initial = "250ms"
reconnect_max = "10s"

[http]
bind = "127.0.0.1:8080"
body_limit = 2048
retry_hint = "3s"
single_shot_timeout = "2s"
shutdown_timeout = "15s"

[auth]
api_key = "s3cret"

[commands]
path = "/etc/vibegate/commands.yml"

[metrics]
enabled = true
bind = "127.0.0.1:9100"
"#;

    let config = Config::parse(toml).unwrap();
    assert_eq!(config.log.level, "warn");
    assert!(config.log.debug);
    assert_eq!(config.broker.client_id.as_deref(), Some("gateway-1"));
    assert_eq!(config.broker.connect_timeout, Duration::from_secs(5));
    assert_eq!(config.broker.reconnect().initial, Duration::from_millis(250));
    assert_eq!(config.http.bind.to_string(), "127.0.0.1:8080");
    assert_eq!(config.http.retry_hint, Duration::from_secs(3));
    assert_eq!(config.http.shutdown_timeout, Duration::from_secs(15));
    assert_eq!(config.auth.key(), Some("s3cret"));
    assert_eq!(
        config.commands.path,
        PathBuf::from("/etc/vibegate/commands.yml")
    );
    assert!(config.metrics.enabled);

    let settings = config.broker.mqtt_settings().unwrap();
    assert_eq!(settings.address.host, "broker.internal");
    assert_eq!(settings.address.port, 2883);
    assert_eq!(settings.username.as_deref(), Some("gateway"));
    assert_eq!(settings.keep_alive, 30);
}

#[test]
fn test_url_credentials_used_when_not_configured() {
    let config = Config::parse("[broker]\nurl = \"mqtt://u:p@localhost\"\n").unwrap();
    let settings = config.broker.mqtt_settings().unwrap();
    assert_eq!(settings.username.as_deref(), Some("u"));
    assert_eq!(settings.password.as_deref(), Some("p"));
}

#[test]
fn test_invalid_broker_url() {
    let result = Config::parse("[broker]\nurl = \"ws://localhost\"\n");
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_invalid_body_limit() {
    let result = Config::parse("[http]\nbody_limit = 0\n");
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_invalid_reconnect_range() {
    let toml = r#"
[broker]
reconnect_initial = "10s"
reconnect_max = "1s"
"#;
    assert!(Config::parse(toml).is_err());
}

#[test]
fn test_metrics_bind_conflict() {
    let toml = r#"
[http]
bind = "0.0.0.0:9090"

[metrics]
enabled = true
"#;
    assert!(Config::parse(toml).is_err());
}

#[test]
fn test_legacy_env_overrides() {
    let mut config = Config::default();
    config
        .apply_legacy_env(lookup(&[
            ("MQTT_HOST", "mqtt://legacy:1884"),
            ("MQTT_USER", "alice"),
            ("MQTT_PASS", "pw"),
            ("MQTT_CLIENT_ID", "bridge"),
            ("DEBUG_MODE", "true"),
            ("API_KEY", "k"),
            ("PORT", "8081"),
        ]))
        .unwrap();

    assert_eq!(config.broker.url, "mqtt://legacy:1884");
    assert_eq!(config.broker.username.as_deref(), Some("alice"));
    assert_eq!(config.broker.password.as_deref(), Some("pw"));
    assert_eq!(config.broker.client_id.as_deref(), Some("bridge"));
    assert!(config.log.debug);
    assert_eq!(config.log.effective_level(), "debug");
    assert_eq!(config.auth.key(), Some("k"));
    assert_eq!(config.http.bind.port(), 8081);
}

#[test]
fn test_legacy_env_empty_values_ignored() {
    let mut config = Config::default();
    config.auth.api_key = Some("from-file".to_string());
    config
        .apply_legacy_env(lookup(&[("API_KEY", ""), ("MQTT_HOST", "")]))
        .unwrap();
    assert_eq!(config.auth.key(), Some("from-file"));
    assert_eq!(config.broker.url, "mqtt://localhost:1883");
}

#[test]
fn test_legacy_env_bad_port() {
    let mut config = Config::default();
    let result = config.apply_legacy_env(lookup(&[("PORT", "http")]));
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_parse_flag() {
    for value in ["1", "true", "TRUE", "yes", " on "] {
        assert!(parse_flag(value), "{value}");
    }
    for value in ["0", "false", "", "enabled"] {
        assert!(!parse_flag(value), "{value}");
    }
}

#[test]
fn test_empty_api_key_disables_auth() {
    let config = Config::parse("[auth]\napi_key = \"\"\n").unwrap();
    assert_eq!(config.auth.key(), None);
}

#[test]
fn test_load_config_with_env_substitution() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("vibegate.toml");

    std::env::set_var("VG_TEST_BROKER_HOST", "10.1.2.3");

    let config_content = r#"
[broker]
url = "mqtt://${VG_TEST_BROKER_HOST}:${VG_TEST_BROKER_PORT:-1999}"

[http]
single_shot_timeout = "750ms"
"#;
    std::fs::write(&config_path, config_content).unwrap();

    let config = Config::load_with_legacy(&config_path, lookup(&[])).unwrap();
    assert_eq!(config.broker.url, "mqtt://10.1.2.3:1999");
    assert_eq!(config.http.single_shot_timeout, Duration::from_millis(750));
    assert_eq!(config.http.bind.port(), 5000);

    std::env::remove_var("VG_TEST_BROKER_HOST");
}
