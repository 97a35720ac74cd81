//! Configuration
//!
//! Layered with the `config` crate, lowest to highest precedence: built-in
//! defaults, the global user file, `<workspace>/config/config.toml`,
//! `<workspace>/config/$VITAE_ENV.toml`, an explicit `--config` file, and
//! `VITAE_*` environment variables (`__` separates nested keys, e.g.
//! `VITAE_SUBSCRIPTIONS__DEFAULT_DEBOUNCE_MS=0`).

use std::path::{Path, PathBuf};

use config::{Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::feed::hub::SubscriptionConfig;
use crate::logging::LoggingConfig;
use crate::preview::merger::PreviewConfig;
use crate::recovery::checkpoint::CheckpointConfig;
use crate::recovery::instability::InstabilityConfig;
use crate::recovery::retry::{RetryConfig, RetryPolicy};

mod merge {
    pub mod merge_policy;
}

mod sources {
    pub mod global_file;
    pub mod workspace_file;
}

pub use sources::global_file::global_config_path;
pub use sources::workspace_file::environment_name;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VitaeConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub checkpoints: CheckpointConfig,

    #[serde(default)]
    pub subscriptions: SubscriptionConfig,

    #[serde(default)]
    pub instability: InstabilityConfig,

    #[serde(default)]
    pub preview: PreviewConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// sled database directory; relative paths resolve against the workspace
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Record per-attempt telemetry alongside checkpoints
    #[serde(default = "default_true")]
    pub attempt_log: bool,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".vitae/store")
}

fn default_true() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            attempt_log: true,
        }
    }
}

impl StorageConfig {
    pub fn resolve_data_dir(&self, workspace_root: &Path) -> PathBuf {
        if self.data_dir.is_absolute() {
            self.data_dir.clone()
        } else {
            workspace_root.join(&self.data_dir)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Backoff for operations without their own tuning
    #[serde(default)]
    pub defaults: RetryConfig,

    /// Attempt cap for failures the policy cannot classify
    #[serde(default = "default_unclassified_cap")]
    pub unclassified_cap: u32,
}

fn default_unclassified_cap() -> u32 {
    2
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            defaults: RetryConfig::default(),
            unclassified_cap: default_unclassified_cap(),
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            unclassified_cap: self.unclassified_cap,
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    Retry(String),
    Checkpoints(String),
    Subscriptions(String),
    Instability(String),
    Preview(String),
    Logging(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Retry(msg) => write!(f, "retry: {msg}"),
            ValidationError::Checkpoints(msg) => write!(f, "checkpoints: {msg}"),
            ValidationError::Subscriptions(msg) => write!(f, "subscriptions: {msg}"),
            ValidationError::Instability(msg) => write!(f, "instability: {msg}"),
            ValidationError::Preview(msg) => write!(f, "preview: {msg}"),
            ValidationError::Logging(msg) => write!(f, "logging: {msg}"),
        }
    }
}

impl std::error::Error for ValidationError {}

impl VitaeConfig {
    /// Validate the whole configuration, collecting every problem.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Err(e) = self.retry.defaults.validate() {
            errors.push(ValidationError::Retry(e));
        }
        if self.retry.unclassified_cap == 0 {
            errors.push(ValidationError::Retry(
                "unclassified_cap must be at least 1".to_string(),
            ));
        }
        if self.checkpoints.retention_ms == 0 {
            errors.push(ValidationError::Checkpoints(
                "retention_ms must be positive".to_string(),
            ));
        }
        let subs = &self.subscriptions;
        if subs.reconnect_max_delay_ms < subs.reconnect_base_delay_ms {
            errors.push(ValidationError::Subscriptions(format!(
                "reconnect_max_delay_ms ({}) is below reconnect_base_delay_ms ({})",
                subs.reconnect_max_delay_ms, subs.reconnect_base_delay_ms
            )));
        }
        if self.instability.threshold == 0 {
            errors.push(ValidationError::Instability(
                "threshold must be at least 1".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for id in &self.preview.feature_order {
            if id.trim().is_empty() {
                errors.push(ValidationError::Preview("empty feature id in feature_order".to_string()));
            } else if !seen.insert(id.as_str()) {
                errors.push(ValidationError::Preview(format!(
                    "feature '{id}' listed twice in feature_order"
                )));
            }
        }
        if let Err(e) = crate::logging::LogFormat::parse(&self.logging.format) {
            errors.push(ValidationError::Logging(e.to_string()));
        }
        if let Err(e) = crate::logging::LogOutput::parse(&self.logging.output) {
            errors.push(ValidationError::Logging(e.to_string()));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Builds a [`VitaeConfig`] from all layers.
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load(workspace_root: &Path) -> Result<VitaeConfig, ApiError> {
        Self::load_with_override(workspace_root, None)
    }

    /// Like [`ConfigLoader::load`], with `explicit` layered above the
    /// workspace files. The explicit file must exist.
    pub fn load_with_override(
        workspace_root: &Path,
        explicit: Option<&Path>,
    ) -> Result<VitaeConfig, ApiError> {
        let builder = merge::merge_policy::builder_with_defaults()?;
        let builder = sources::global_file::add_to_builder(builder)?;
        let mut builder = sources::workspace_file::add_to_builder(builder, workspace_root)?;
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(ApiError::ConfigError(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix("VITAE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: VitaeConfig = settings.try_deserialize()?;
        validated(config)
    }

    /// Load a single TOML file on top of the built-in defaults.
    pub fn load_from_file(path: &Path) -> Result<VitaeConfig, ApiError> {
        let settings = merge::merge_policy::builder_with_defaults()?
            .add_source(File::from(path).required(true))
            .build()?;
        let config: VitaeConfig = settings.try_deserialize()?;
        validated(config)
    }
}

fn validated(config: VitaeConfig) -> Result<VitaeConfig, ApiError> {
    config.validate().map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        ApiError::ConfigError(format!(
            "Configuration validation failed:\n{}",
            messages.join("\n")
        ))
    })?;
    Ok(config)
}
