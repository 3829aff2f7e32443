//! Build metadata and id generation

use serde::Serialize;

/// What `/version` reports about this binary
#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
    pub version: &'static str,
    pub commit: &'static str,
    pub built_at: &'static str,
}

/// Stamped by build.rs; "unknown" outside a git checkout
pub fn build_info() -> BuildInfo {
    BuildInfo {
        version: env!("CARGO_PKG_VERSION"),
        commit: option_env!("DEPLOYD_COMMIT").unwrap_or("unknown"),
        built_at: option_env!("DEPLOYD_BUILT_AT").unwrap_or("unknown"),
    }
}

/// Fresh record id
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}
