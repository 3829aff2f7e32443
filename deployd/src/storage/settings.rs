//! Settings file management

use std::path::PathBuf;

use secrecy::SecretString;
use serde::Deserialize;

use crate::errors::DeploydError;
use crate::logs::LogLevel;

pub const MASTER_KEY_ENV: &str = "DEPLOYD_MASTER_KEY";
pub const JWT_SECRET_ENV: &str = "DEPLOYD_JWT_SECRET";
pub const GITHUB_TOKEN_ENV: &str = "DEPLOYD_GITHUB_TOKEN";

/// Orchestrator settings.
///
/// Every field has a default so a partial settings file is valid. Secrets
/// may be supplied through the environment instead of the file.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON formatted logs on stdout
    #[serde(default)]
    pub log_json: bool,

    /// Also write daily-rotated log files under the data directory
    #[serde(default = "default_true")]
    pub log_to_file: bool,

    /// Data directory override
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,

    /// Passphrase used to derive the at-rest encryption key
    #[serde(default)]
    pub master_key: Option<SecretString>,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// Caller authentication
    #[serde(default)]
    pub auth: AuthSettings,

    /// GitHub API access
    #[serde(default)]
    pub github: GitHubSettings,

    /// Remote executor tuning
    #[serde(default)]
    pub executor: ExecutorSettings,

    /// Lease sweeper tuning
    #[serde(default)]
    pub sweeper: SweeperSettings,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_to_file: true,
            storage_dir: None,
            master_key: None,
            server: ServerSettings::default(),
            auth: AuthSettings::default(),
            github: GitHubSettings::default(),
            executor: ExecutorSettings::default(),
            sweeper: SweeperSettings::default(),
        }
    }
}

impl Settings {
    /// Overlay secrets found in the environment
    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var(MASTER_KEY_ENV) {
            self.master_key = Some(SecretString::from(value));
        }
        if let Ok(value) = std::env::var(JWT_SECRET_ENV) {
            self.auth.jwt_secret = Some(SecretString::from(value));
        }
        if let Ok(value) = std::env::var(GITHUB_TOKEN_ENV) {
            self.github.token = Some(SecretString::from(value));
        }
    }

    /// Reject settings the service cannot run with
    pub fn validate(&self) -> Result<(), DeploydError> {
        if self.master_key.is_none() {
            return Err(DeploydError::ConfigError(format!(
                "master_key is required (set it in the settings file or {})",
                MASTER_KEY_ENV
            )));
        }
        if self.auth.jwt_secret.is_none() {
            return Err(DeploydError::ConfigError(format!(
                "auth.jwt_secret is required (set it in the settings file or {})",
                JWT_SECRET_ENV
            )));
        }
        if !self.server.api_prefix.starts_with('/') {
            return Err(DeploydError::ConfigError(
                "server.api_prefix must start with '/'".to_string(),
            ));
        }
        for (name, value) in [
            ("server.base_url", &self.server.base_url),
            ("github.api_base_url", &self.github.api_base_url),
        ] {
            let parsed = url::Url::parse(value)
                .map_err(|e| DeploydError::ConfigError(format!("{} is not a valid URL: {}", name, e)))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(DeploydError::ConfigError(format!("{} must be an http(s) URL", name)));
            }
        }
        if self.executor.lease_ttl_secs < 3 {
            return Err(DeploydError::ConfigError(
                "executor.lease_ttl_secs must be at least 3".to_string(),
            ));
        }
        Ok(())
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Public URL GitHub uses to reach this service
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_api_prefix() -> String {
    "/api/v1".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_url: default_base_url(),
            api_prefix: default_api_prefix(),
        }
    }
}

/// Caller authentication settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthSettings {
    /// HS256 secret shared with the token issuer
    #[serde(default)]
    pub jwt_secret: Option<SecretString>,
}

/// GitHub API settings
#[derive(Debug, Clone, Deserialize)]
pub struct GitHubSettings {
    #[serde(default = "default_github_api")]
    pub api_base_url: String,

    /// Fallback token for repositories without their own
    #[serde(default)]
    pub token: Option<SecretString>,

    #[serde(default = "default_github_timeout")]
    pub timeout_secs: u64,
}

fn default_github_api() -> String {
    "https://api.github.com".to_string()
}

fn default_github_timeout() -> u64 {
    30
}

impl Default for GitHubSettings {
    fn default() -> Self {
        Self {
            api_base_url: default_github_api(),
            token: None,
            timeout_secs: default_github_timeout(),
        }
    }
}

/// Remote executor settings
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSettings {
    #[serde(default = "default_ssh_binary")]
    pub ssh_binary: String,

    #[serde(default = "default_sshpass_binary")]
    pub sshpass_binary: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,

    #[serde(default = "default_lock_wait")]
    pub lock_wait_secs: u64,

    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,

    #[serde(default = "default_activation_timeout")]
    pub activation_timeout_secs: u64,

    /// Seconds to let in-flight deployments finish on shutdown
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

fn default_ssh_binary() -> String {
    "ssh".to_string()
}

fn default_sshpass_binary() -> String {
    "sshpass".to_string()
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_step_timeout() -> u64 {
    1800
}

fn default_lock_wait() -> u64 {
    30
}

fn default_lease_ttl() -> u64 {
    90
}

fn default_activation_timeout() -> u64 {
    60
}

fn default_drain_timeout() -> u64 {
    20
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            ssh_binary: default_ssh_binary(),
            sshpass_binary: default_sshpass_binary(),
            connect_timeout_secs: default_connect_timeout(),
            step_timeout_secs: default_step_timeout(),
            lock_wait_secs: default_lock_wait(),
            lease_ttl_secs: default_lease_ttl(),
            activation_timeout_secs: default_activation_timeout(),
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

/// Lease sweeper settings
#[derive(Debug, Clone, Deserialize)]
pub struct SweeperSettings {
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
}

fn default_sweep_interval() -> u64 {
    30
}

impl Default for SweeperSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval(),
        }
    }
}
