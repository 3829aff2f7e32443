//! Registry operations over keys, servers and repositories

pub mod repositories;
pub mod ssh_keys;
pub mod web_servers;

use crate::errors::DeploydError;

/// Trimmed, non-empty value of a required text field
pub(crate) fn required(field: &str, value: &str) -> Result<String, DeploydError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(DeploydError::ValidationError(format!("{} is required", field)));
    }
    Ok(value.to_string())
}
