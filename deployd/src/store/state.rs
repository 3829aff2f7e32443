//! StateStore: open/close, JSON helpers and registry records

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::errors::DeploydError;
use crate::models::deployment::Deployment;
use crate::models::repository::{GitHubRepository, PendingUpdate};
use crate::models::ssh_key::SshKey;
use crate::models::web_server::WebServer;
use crate::store::tables::*;

/// Thread-safe state store backed by redb
#[derive(Clone)]
pub struct StateStore {
    pub(super) db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path
    pub fn open(path: &Path) -> Result<Self, DeploydError> {
        let db = Database::create(path).map_err(map_err!("open database"))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store
    pub fn open_in_memory() -> Result<Self, DeploydError> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!("open in-memory database"))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        Ok(store)
    }

    fn ensure_tables(&self) -> Result<(), DeploydError> {
        let txn = self.db.begin_write().map_err(map_err!("begin write"))?;
        for table in [SSH_KEYS, WEB_SERVERS, REPOSITORIES, DEPLOYMENTS, DEPLOYMENT_LOGS, LEASES] {
            txn.open_table(table).map_err(map_err!("open table"))?;
        }
        txn.open_table(LOG_CURSORS).map_err(map_err!("open table"))?;
        txn.commit().map_err(map_err!("commit"))?;
        Ok(())
    }

    // ── Generic JSON helpers ───────────────────────────────────────

    pub(super) fn put_json<T: Serialize>(
        &self,
        table: JsonTable,
        key: &str,
        value: &T,
    ) -> Result<(), DeploydError> {
        let bytes = serde_json::to_vec(value)?;
        let txn = self.db.begin_write().map_err(map_err!("begin write"))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!("open table"))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!("insert"))?;
        }
        txn.commit().map_err(map_err!("commit"))?;
        Ok(())
    }

    pub(super) fn get_json<T: DeserializeOwned>(
        &self,
        table: JsonTable,
        key: &str,
    ) -> Result<Option<T>, DeploydError> {
        let txn = self.db.begin_read().map_err(map_err!("begin read"))?;
        let t = txn.open_table(table).map_err(map_err!("open table"))?;
        match t.get(key).map_err(map_err!("read"))? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    pub(super) fn list_json<T, F>(&self, table: JsonTable, filter: F) -> Result<Vec<T>, DeploydError>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> bool,
    {
        let txn = self.db.begin_read().map_err(map_err!("begin read"))?;
        let t = txn.open_table(table).map_err(map_err!("open table"))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!("iterate"))? {
            let (_, value) = entry.map_err(map_err!("read"))?;
            let item: T = serde_json::from_slice(value.value())?;
            if filter(&item) {
                results.push(item);
            }
        }
        Ok(results)
    }

    /// Read-modify-write one record inside a single write transaction.
    ///
    /// Returns `None` when the key is absent. An error from `update` aborts
    /// the transaction and leaves the record untouched.
    pub(super) fn update_json<T, F>(
        &self,
        table: JsonTable,
        key: &str,
        update: F,
    ) -> Result<Option<T>, DeploydError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> Result<(), DeploydError>,
    {
        let txn = self.db.begin_write().map_err(map_err!("begin write"))?;
        let updated = {
            let mut t = txn.open_table(table).map_err(map_err!("open table"))?;
            let current: Option<T> = match t.get(key).map_err(map_err!("read"))? {
                Some(guard) => Some(serde_json::from_slice(guard.value())?),
                None => None,
            };
            match current {
                Some(mut value) => {
                    update(&mut value)?;
                    let bytes = serde_json::to_vec(&value)?;
                    t.insert(key, bytes.as_slice()).map_err(map_err!("insert"))?;
                    Some(value)
                }
                None => None,
            }
        };
        txn.commit().map_err(map_err!("commit"))?;
        Ok(updated)
    }

    pub(super) fn remove_key(&self, table: JsonTable, key: &str) -> Result<bool, DeploydError> {
        let txn = self.db.begin_write().map_err(map_err!("begin write"))?;
        let existed = {
            let mut t = txn.open_table(table).map_err(map_err!("open table"))?;
            let removed = t.remove(key).map_err(map_err!("remove"))?;
            removed.is_some()
        };
        txn.commit().map_err(map_err!("commit"))?;
        Ok(existed)
    }

    // ── SSH keys ───────────────────────────────────────────────────

    pub fn put_ssh_key(&self, key: &SshKey) -> Result<(), DeploydError> {
        self.put_json(SSH_KEYS, &key.id, key)
    }

    pub fn get_ssh_key(&self, id: &str) -> Result<Option<SshKey>, DeploydError> {
        self.get_json(SSH_KEYS, id)
    }

    pub fn list_ssh_keys(&self, project_id: &str) -> Result<Vec<SshKey>, DeploydError> {
        let mut keys: Vec<SshKey> = self.list_json(SSH_KEYS, |k: &SshKey| k.project_id == project_id)?;
        keys.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(keys)
    }

    pub fn update_ssh_key<F>(&self, id: &str, update: F) -> Result<Option<SshKey>, DeploydError>
    where
        F: FnOnce(&mut SshKey) -> Result<(), DeploydError>,
    {
        self.update_json(SSH_KEYS, id, update)
    }

    pub fn delete_ssh_key(&self, id: &str) -> Result<bool, DeploydError> {
        self.remove_key(SSH_KEYS, id)
    }

    // ── Web servers ────────────────────────────────────────────────

    pub fn put_web_server(&self, server: &WebServer) -> Result<(), DeploydError> {
        self.put_json(WEB_SERVERS, &server.id, server)
    }

    pub fn get_web_server(&self, id: &str) -> Result<Option<WebServer>, DeploydError> {
        self.get_json(WEB_SERVERS, id)
    }

    pub fn list_web_servers(&self, project_id: &str) -> Result<Vec<WebServer>, DeploydError> {
        let mut servers: Vec<WebServer> =
            self.list_json(WEB_SERVERS, |s: &WebServer| s.project_id == project_id)?;
        servers.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(servers)
    }

    /// Servers in any project that authenticate with the given key
    pub fn web_servers_using_key(&self, key_id: &str) -> Result<Vec<WebServer>, DeploydError> {
        self.list_json(WEB_SERVERS, |s: &WebServer| s.ssh_key_id == key_id)
    }

    pub fn update_web_server<F>(&self, id: &str, update: F) -> Result<Option<WebServer>, DeploydError>
    where
        F: FnOnce(&mut WebServer) -> Result<(), DeploydError>,
    {
        self.update_json(WEB_SERVERS, id, update)
    }

    /// Delete a server unless a deployment that has not finished targets it.
    ///
    /// The deployment scan and the removal share one write transaction, so no
    /// deployment can be created or started against the server in between.
    pub fn delete_web_server(&self, id: &str) -> Result<bool, DeploydError> {
        let txn = self.db.begin_write().map_err(map_err!("begin write"))?;
        let existed = {
            let deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!("open table"))?;
            let mut unfinished = 0usize;
            for entry in deployments.iter().map_err(map_err!("iterate"))? {
                let (_, value) = entry.map_err(map_err!("read"))?;
                let deployment: Deployment = serde_json::from_slice(value.value())?;
                if deployment.web_server_id == id && !deployment.status.is_terminal() {
                    unfinished += 1;
                }
            }
            if unfinished > 0 {
                return Err(DeploydError::Conflict(format!(
                    "Web server {} has {} deployment(s) pending or in progress",
                    id, unfinished
                )));
            }
            let mut servers = txn.open_table(WEB_SERVERS).map_err(map_err!("open table"))?;
            let removed = servers.remove(id).map_err(map_err!("remove"))?;
            removed.is_some()
        };
        txn.commit().map_err(map_err!("commit"))?;
        Ok(existed)
    }

    // ── Repositories ───────────────────────────────────────────────

    pub fn put_repository(&self, repo: &GitHubRepository) -> Result<(), DeploydError> {
        self.put_json(REPOSITORIES, &repo.id, repo)
    }

    pub fn get_repository(&self, id: &str) -> Result<Option<GitHubRepository>, DeploydError> {
        self.get_json(REPOSITORIES, id)
    }

    pub fn list_repositories(&self, project_id: &str) -> Result<Vec<GitHubRepository>, DeploydError> {
        let mut repos: Vec<GitHubRepository> =
            self.list_json(REPOSITORIES, |r: &GitHubRepository| r.project_id == project_id)?;
        repos.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(repos)
    }

    pub fn repositories_using_key(&self, key_id: &str) -> Result<Vec<GitHubRepository>, DeploydError> {
        self.list_json(REPOSITORIES, |r: &GitHubRepository| {
            r.ssh_key_id.as_deref() == Some(key_id)
        })
    }

    pub fn update_repository<F>(
        &self,
        id: &str,
        update: F,
    ) -> Result<Option<GitHubRepository>, DeploydError>
    where
        F: FnOnce(&mut GitHubRepository) -> Result<(), DeploydError>,
    {
        self.update_json(REPOSITORIES, id, update)
    }

    /// Atomically remove and return the repository's pending-update marker
    pub fn take_pending_update(&self, repo_id: &str) -> Result<Option<PendingUpdate>, DeploydError> {
        let mut taken = None;
        self.update_repository(repo_id, |repo| {
            taken = repo.pending_update.take();
            Ok(())
        })?;
        Ok(taken)
    }

    pub fn delete_repository(&self, id: &str) -> Result<bool, DeploydError> {
        self.remove_key(REPOSITORIES, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::web_server::WebServerStatus;
    use chrono::Utc;

    fn server(id: &str, project: &str) -> WebServer {
        WebServer {
            id: id.to_string(),
            project_id: project.to_string(),
            name: format!("server-{}", id),
            description: None,
            host: "192.0.2.10".to_string(),
            port: 22,
            ssh_user: "deploy".to_string(),
            ssh_key_id: "key-1".to_string(),
            deploy_path: "~/deploys".to_string(),
            status: WebServerStatus::Unknown,
            last_checked_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_put_get_list_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_web_server(&server("a", "p1")).unwrap();
        store.put_web_server(&server("b", "p1")).unwrap();
        store.put_web_server(&server("c", "p2")).unwrap();

        assert_eq!(store.get_web_server("a").unwrap().unwrap().name, "server-a");
        assert_eq!(store.list_web_servers("p1").unwrap().len(), 2);
        assert_eq!(store.web_servers_using_key("key-1").unwrap().len(), 3);

        assert!(store.delete_web_server("a").unwrap());
        assert!(!store.delete_web_server("a").unwrap());
        assert!(store.get_web_server("a").unwrap().is_none());
    }

    #[test]
    fn test_update_error_leaves_record_untouched() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_web_server(&server("a", "p1")).unwrap();

        let result = store.update_web_server("a", |s| {
            s.name = "renamed".to_string();
            Err(DeploydError::ValidationError("nope".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(store.get_web_server("a").unwrap().unwrap().name, "server-a");

        let missing = store.update_web_server("zzz", |_| Ok(())).unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_persistent_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.redb");
        {
            let store = StateStore::open(&path).unwrap();
            store.put_web_server(&server("a", "p1")).unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        assert!(store.get_web_server("a").unwrap().is_some());
    }
}
