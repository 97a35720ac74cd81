//! Integration tests for configuration layering

use std::path::Path;

use tempfile::TempDir;
use vitae::config::ConfigLoader;

fn write_workspace_config(root: &Path, name: &str, body: &str) {
    let dir = root.join("config");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(name), body).unwrap();
}

#[test]
fn test_workspace_file_overrides_defaults() {
    let temp_dir = TempDir::new().unwrap();
    write_workspace_config(
        temp_dir.path(),
        "config.toml",
        r#"
[retry]
unclassified_cap = 4

[retry.defaults]
initial_delay_ms = 250

[subscriptions]
default_debounce_ms = 40

[preview]
feature_order = ["timeline", "podcast"]
sandbox = false
"#,
    );

    let config = ConfigLoader::load(temp_dir.path()).unwrap();
    assert_eq!(config.retry.unclassified_cap, 4);
    assert_eq!(config.retry.defaults.initial_delay_ms, 250);
    assert_eq!(config.subscriptions.default_debounce_ms, 40);
    assert_eq!(config.preview.feature_order, vec!["timeline", "podcast"]);
    assert!(!config.preview.sandbox);
    // Untouched sections keep their defaults.
    assert!(config.storage.attempt_log);
    assert_eq!(config.instability.threshold, 3);
}

#[test]
fn test_explicit_file_wins_over_workspace_file() {
    let temp_dir = TempDir::new().unwrap();
    write_workspace_config(
        temp_dir.path(),
        "config.toml",
        "[checkpoints]\nretention_ms = 1000\n",
    );
    let explicit = temp_dir.path().join("override.toml");
    std::fs::write(&explicit, "[checkpoints]\nretention_ms = 5000\n").unwrap();

    let config = ConfigLoader::load_with_override(temp_dir.path(), Some(&explicit)).unwrap();
    assert_eq!(config.checkpoints.retention_ms, 5000);
}

#[test]
fn test_missing_explicit_file_is_an_error() {
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("nope.toml");
    let err = ConfigLoader::load_with_override(temp_dir.path(), Some(&missing)).unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[test]
fn test_invalid_values_are_all_reported() {
    let temp_dir = TempDir::new().unwrap();
    let config_file = temp_dir.path().join("bad.toml");
    std::fs::write(
        &config_file,
        r#"
[retry]
unclassified_cap = 0

[subscriptions]
reconnect_base_delay_ms = 5000
reconnect_max_delay_ms = 100

[logging]
format = "xml"
"#,
    )
    .unwrap();

    let err = ConfigLoader::load_from_file(&config_file).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("unclassified_cap"), "{message}");
    assert!(message.contains("reconnect_max_delay_ms"), "{message}");
    assert!(message.contains("xml"), "{message}");
}
