//! Built-in defaults, applied before any file or environment source.

use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Config builder seeded with the defaults every layer overrides.
pub fn builder_with_defaults() -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError>
{
    Config::builder()
        .set_default("storage.data_dir", ".vitae/store")?
        .set_default("storage.attempt_log", true)?
        .set_default("retry.unclassified_cap", 2)?
        .set_default("checkpoints.retention_ms", 7_i64 * 24 * 60 * 60 * 1000)?
        .set_default("subscriptions.default_debounce_ms", 100)?
        .set_default("subscriptions.max_reconnect_attempts", 5)?
        .set_default("preview.sandbox", true)
}
