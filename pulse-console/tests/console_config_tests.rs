use proptest::prelude::*;
use pulse_console::config::ConfigError;
use pulse_console::ConsoleConfig;
use pulse_core::entities;
use std::io::Write;
use std::time::Duration;

const BASE_CONFIG: &str = r#"
base_url = "https://ops.example.com"
request_timeout_ms = 5000
log_level = "pulse_engine=debug,info"
json_logs = true

[[views]]
name = "queue"
entity = "queue_status"

[[views]]
name = "agent-errors"
entity = "agent_errors"
params = { agent = "billing", window = "24h" }

[[views]]
name = "slow-runs"
entity = "agent_slowest"
interval_ms = 120000
"#;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn invalid_field(result: Result<(), ConfigError>) -> String {
    match result {
        Err(ConfigError::InvalidValue { field, .. }) => field,
        other => panic!("Expected InvalidValue, got: {:?}", other),
    }
}

#[test]
fn config_loads_from_file() {
    let file = write_config(BASE_CONFIG);
    let config = ConsoleConfig::from_path(file.path()).unwrap();
    config.validate().unwrap();

    assert_eq!(config.views.len(), 3);
    assert!(config.json_logs);
    assert_eq!(config.request_timeout(), Duration::from_millis(5_000));
    assert_eq!(
        config.engine.policy_for(entities::QUEUE_STATUS).interval_ms,
        Some(3_000)
    );
    assert_eq!(
        config.views[2].query_options().interval,
        Some(Duration::from_millis(120_000))
    );
}

#[test]
fn engine_table_overrides_defaults() {
    let contents = format!(
        "{}\n[engine]\ngc_grace_ms = 5000\njitter_ratio = 0.0\n\n[engine.entities.queue_status]\ninterval_ms = 1000\nstale_after_ms = 500\n",
        BASE_CONFIG
    );
    let config = ConsoleConfig::from_toml(&contents).unwrap();
    config.validate().unwrap();

    assert_eq!(config.engine.gc_grace_ms, 5_000);
    assert_eq!(config.engine.jitter_ratio, 0.0);
    assert_eq!(config.engine.policy_for(entities::QUEUE_STATUS).interval_ms, Some(1_000));
}

#[test]
fn missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = ConsoleConfig::from_path(&dir.path().join("absent.toml"));
    assert!(matches!(result, Err(ConfigError::Io(_))));
}

#[test]
fn unknown_fields_are_rejected() {
    let contents = BASE_CONFIG.replace("json_logs = true", "json_logs = true\ntheme = \"dark\"");
    assert!(matches!(ConsoleConfig::from_toml(&contents), Err(ConfigError::Parse(_))));
}

#[test]
fn base_url_must_be_http() {
    let config = ConsoleConfig::from_toml(&BASE_CONFIG.replace("https://ops.example.com", "ops.example.com")).unwrap();
    assert_eq!(invalid_field(config.validate()), "base_url");
}

#[test]
fn views_are_required() {
    let mut config = ConsoleConfig::from_toml(BASE_CONFIG).unwrap();
    config.views.clear();
    assert_eq!(invalid_field(config.validate()), "views");
}

#[test]
fn duplicate_view_names_are_rejected() {
    let mut config = ConsoleConfig::from_toml(BASE_CONFIG).unwrap();
    config.views[1].name = "queue".to_string();
    assert_eq!(invalid_field(config.validate()), "views[1].name");
}

#[test]
fn nested_view_params_are_rejected() {
    let contents = BASE_CONFIG.replace(
        "params = { agent = \"billing\", window = \"24h\" }",
        "params = { agents = [\"billing\", \"search\"] }",
    );
    let config = ConsoleConfig::from_toml(&contents).unwrap();
    assert_eq!(invalid_field(config.validate()), "views[1].params");
}

#[test]
fn zero_view_interval_is_rejected() {
    let config = ConsoleConfig::from_toml(&BASE_CONFIG.replace("interval_ms = 120000", "interval_ms = 0")).unwrap();
    assert_eq!(invalid_field(config.validate()), "views[2].interval_ms");
}

#[test]
fn view_interval_longer_than_a_week_is_rejected() {
    let contents = BASE_CONFIG.replace("interval_ms = 120000", "interval_ms = 604800001");
    let config = ConsoleConfig::from_toml(&contents).unwrap();
    assert_eq!(invalid_field(config.validate()), "views[2].interval_ms");
}

#[test]
fn invalid_engine_config_is_reported() {
    let contents = format!("{}\n[engine]\njitter_ratio = 1.5\n", BASE_CONFIG);
    let config = ConsoleConfig::from_toml(&contents).unwrap();
    assert!(matches!(config.validate(), Err(ConfigError::Engine(_))));
}

proptest! {
    #[test]
    fn prop_positive_timeouts_validate(timeout in 1u64..600_000) {
        let mut config = ConsoleConfig::from_toml(BASE_CONFIG).unwrap();
        config.request_timeout_ms = timeout;
        prop_assert!(config.validate().is_ok());
    }

    #[test]
    fn prop_blank_log_level_rejected(level in "[ \t]{0,4}") {
        let mut config = ConsoleConfig::from_toml(BASE_CONFIG).unwrap();
        config.log_level = level;
        prop_assert_eq!(invalid_field(config.validate()), "log_level");
    }
}
