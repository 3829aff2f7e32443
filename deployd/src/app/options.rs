//! Application configuration options

use std::time::Duration;

use secrecy::SecretString;

use crate::errors::DeploydError;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::{ExecutorSettings, GitHubSettings, Settings};
use crate::workers::{deployer, lease_sweeper};

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Data directory layout
    pub layout: StorageLayout,

    /// Passphrase the at-rest encryption key is derived from
    pub master_key: SecretString,

    /// Shared secret for caller tokens
    pub jwt_secret: SecretString,

    /// Server configuration
    pub server: ServerOptions,

    /// GitHub API access
    pub github: GitHubSettings,

    /// Remote executor tuning
    pub executor: ExecutorSettings,

    /// Deployer worker options
    pub deployer: deployer::Options,

    /// Lease sweeper options
    pub lease_sweeper: lease_sweeper::Options,
}

impl AppOptions {
    /// Derive run options from validated settings
    pub fn from_settings(settings: &Settings, layout: StorageLayout) -> Result<Self, DeploydError> {
        settings.validate()?;
        let master_key = settings
            .master_key
            .clone()
            .ok_or_else(|| DeploydError::ConfigError("master_key is required".to_string()))?;
        let jwt_secret = settings
            .auth
            .jwt_secret
            .clone()
            .ok_or_else(|| DeploydError::ConfigError("auth.jwt_secret is required".to_string()))?;
        let drain_timeout = Duration::from_secs(settings.executor.drain_timeout_secs);

        Ok(Self {
            lifecycle: LifecycleOptions {
                // the drain has to fit inside the shutdown budget
                max_shutdown_delay: drain_timeout + Duration::from_secs(10),
            },
            layout,
            master_key,
            jwt_secret,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
                base_url: settings.server.base_url.clone(),
                api_prefix: settings.server.api_prefix.clone(),
            },
            github: settings.github.clone(),
            executor: settings.executor.clone(),
            deployer: deployer::Options { drain_timeout },
            lease_sweeper: lease_sweeper::Options {
                interval: Duration::from_secs(settings.sweeper.interval_secs.max(1)),
            },
        })
    }
}

/// Lifecycle options for the service
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Public URL webhooks are delivered to
    pub base_url: String,

    /// Prefix of every API route
    pub api_prefix: String,
}

impl ServerOptions {
    /// `{base_url}{api_prefix}`, the root of public API URLs
    pub fn public_api_url(&self) -> String {
        format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            self.api_prefix.trim_end_matches('/')
        )
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            base_url: "http://localhost:8080".to_string(),
            api_prefix: "/api/v1".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_secrets() {
        let settings = Settings::default();
        let err = AppOptions::from_settings(&settings, StorageLayout::new("/tmp/deployd")).unwrap_err();
        assert!(matches!(err, DeploydError::ConfigError(_)));
    }

    #[test]
    fn test_from_settings() {
        let mut settings = Settings::default();
        settings.master_key = Some(SecretString::from("master"));
        settings.auth.jwt_secret = Some(SecretString::from("jwt"));
        settings.server.base_url = "https://deploy.example.com/".to_string();
        settings.executor.drain_timeout_secs = 5;

        let options = AppOptions::from_settings(&settings, StorageLayout::new("/tmp/deployd")).unwrap();
        assert_eq!(options.server.public_api_url(), "https://deploy.example.com/api/v1");
        assert_eq!(options.deployer.drain_timeout, Duration::from_secs(5));
        assert!(options.lifecycle.max_shutdown_delay > options.deployer.drain_timeout);
    }
}
