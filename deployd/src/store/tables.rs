//! redb table definitions.
//!
//! JSON tables use `&str` keys and `&[u8]` values. Composite keys follow
//! the pattern `{parent_id}:{child}`.

use redb::TableDefinition;

pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// SSH keys keyed by `{key_id}`.
pub const SSH_KEYS: JsonTable = TableDefinition::new("ssh_keys");

/// Web servers keyed by `{server_id}`.
pub const WEB_SERVERS: JsonTable = TableDefinition::new("web_servers");

/// GitHub repositories keyed by `{repo_id}`.
pub const REPOSITORIES: JsonTable = TableDefinition::new("repositories");

/// Deployments keyed by `{deployment_id}`.
pub const DEPLOYMENTS: JsonTable = TableDefinition::new("deployments");

/// Log lines keyed by `{deployment_id}:{seq:020}` so keys sort by cursor.
pub const DEPLOYMENT_LOGS: JsonTable = TableDefinition::new("deployment_logs");

/// Last issued log cursor keyed by `{deployment_id}`.
pub const LOG_CURSORS: TableDefinition<'static, &'static str, u64> =
    TableDefinition::new("log_cursors");

/// Target leases keyed by `{web_server_id}:{deployment_path}`.
pub const LEASES: JsonTable = TableDefinition::new("leases");

/// Key of one log line
pub fn log_key(deployment_id: &str, seq: u64) -> String {
    format!("{}:{:020}", deployment_id, seq)
}
