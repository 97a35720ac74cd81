//! CLI output: error mapping from domain errors to the CLI surface.

use crate::error::ApiError;

/// Map domain errors to a user-facing line.
pub fn map_error(e: &ApiError) -> String {
    match e {
        ApiError::ConfigError(msg) => format!("config: {msg}"),
        ApiError::InvalidArgument(msg) => format!("invalid argument: {msg}"),
        other => other.to_string(),
    }
}

/// Serialise `value` as pretty JSON for `--format json` output.
pub fn to_json<T: serde::Serialize>(value: &T) -> Result<String, ApiError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| ApiError::InvalidArgument(format!("cannot render JSON output: {e}")))
}
