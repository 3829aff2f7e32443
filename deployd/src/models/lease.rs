//! Per-target execution lease

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The `(web_server_id, deployment_path)` pair mutual exclusion is keyed on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetKey {
    pub web_server_id: String,
    pub deployment_path: String,
}

impl TargetKey {
    pub fn new(web_server_id: impl Into<String>, deployment_path: impl Into<String>) -> Self {
        Self {
            web_server_id: web_server_id.into(),
            deployment_path: deployment_path.into(),
        }
    }

    /// Key in the leases table. Server ids never contain ':'.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.web_server_id, self.deployment_path)
    }
}

impl std::fmt::Display for TargetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.web_server_id, self.deployment_path)
    }
}

/// Lease record. Valid until `expires_at` unless renewed by its holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetLease {
    pub target: TargetKey,
    pub deployment_id: String,
    /// Process instance that owns the executor task
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TargetLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
