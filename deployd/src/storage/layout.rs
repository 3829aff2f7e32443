//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::DeploydError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Storage layout for the orchestrator's data directory
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Get the database file
    pub fn database_file(&self) -> File {
        File::new(self.base_dir.join("deployd.redb"))
    }

    /// Scratch directory for private key files and SSH control sockets
    pub fn ssh_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("ssh"))
    }

    /// Known hosts file shared by every SSH invocation (trust on first use)
    pub fn known_hosts_file(&self) -> File {
        File::new(self.base_dir.join("known_hosts"))
    }

    /// Get the logs directory
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Setup the storage layout (create directories).
    ///
    /// The SSH scratch directory is recreated so key files left behind by a
    /// crashed process do not outlive it.
    pub async fn setup(&self) -> Result<(), DeploydError> {
        Dir::new(&self.base_dir).create().await?;
        self.ssh_dir().delete().await?;
        self.ssh_dir().create_private().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/var/lib/deployd");

        #[cfg(not(target_os = "linux"))]
        let base_dir = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".deployd");

        Self::new(base_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_setup_creates_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(tmp.path());

        let stale = layout.ssh_dir().file("key-stale");
        stale.write_secret(b"stale").await.unwrap();

        layout.setup().await.unwrap();
        assert!(layout.ssh_dir().exists().await);
        assert!(layout.logs_dir().exists().await);
        assert!(!stale.exists().await);
    }
}
