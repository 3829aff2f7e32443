//! Deployment records, lifecycle transitions and log streams

use chrono::Utc;
use redb::{ReadableDatabase, ReadableTable};

use crate::deploy::fsm::{DeploymentEvent, DeploymentStatus};
use crate::errors::DeploydError;
use crate::models::deployment::{Deployment, LogLine, LogStream};
use crate::store::state::StateStore;
use crate::store::tables::*;

impl StateStore {
    /// Insert a freshly created deployment. Only `pending` is a valid initial state.
    pub fn insert_deployment(&self, deployment: &Deployment) -> Result<(), DeploydError> {
        if deployment.status != DeploymentStatus::Pending {
            return Err(DeploydError::InternalStateError(format!(
                "deployment {} must start pending, got {}",
                deployment.id, deployment.status
            )));
        }
        self.put_json(DEPLOYMENTS, &deployment.id, deployment)
    }

    pub fn get_deployment(&self, id: &str) -> Result<Option<Deployment>, DeploydError> {
        self.get_json(DEPLOYMENTS, id)
    }

    /// Deployments matching `filter`, newest first
    pub fn list_deployments<F>(&self, filter: F) -> Result<Vec<Deployment>, DeploydError>
    where
        F: Fn(&Deployment) -> bool,
    {
        let mut deployments = self.list_json(DEPLOYMENTS, filter)?;
        deployments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(deployments)
    }

    /// Most recent deployment created for a repository
    pub fn latest_deployment_for_repository(
        &self,
        repo_id: &str,
    ) -> Result<Option<Deployment>, DeploydError> {
        let deployments = self.list_deployments(|d| d.github_repository_id.as_deref() == Some(repo_id))?;
        Ok(deployments.into_iter().next())
    }

    /// Apply a lifecycle event inside one write transaction.
    ///
    /// Timestamps follow the transition: `started_at` on `Start`,
    /// `completed_at` on reaching a terminal state.
    pub fn apply_deployment_event(
        &self,
        id: &str,
        event: DeploymentEvent,
    ) -> Result<Deployment, DeploydError> {
        let updated = self.update_json(DEPLOYMENTS, id, |deployment: &mut Deployment| {
            let next = deployment.status.next(&event)?;
            let now = Utc::now();
            if matches!(event, DeploymentEvent::Start) {
                deployment.started_at = Some(now);
            }
            if let DeploymentEvent::Fail(failure) = &event {
                deployment.failure = Some(failure.clone());
            }
            if next.is_terminal() {
                deployment.completed_at = Some(now);
            }
            deployment.status = next;
            Ok(())
        })?;
        updated.ok_or_else(|| DeploydError::NotFound(format!("Deployment {}", id)))
    }

    /// Stamp a pending deployment as handed to the dispatcher
    pub fn mark_deployment_queued(&self, id: &str) -> Result<Deployment, DeploydError> {
        let updated = self.update_json(DEPLOYMENTS, id, |deployment: &mut Deployment| {
            if deployment.status != DeploymentStatus::Pending {
                return Err(DeploydError::Conflict(format!(
                    "Deployment {} is {}",
                    id, deployment.status
                )));
            }
            deployment.queued_at.get_or_insert_with(Utc::now);
            Ok(())
        })?;
        updated.ok_or_else(|| DeploydError::NotFound(format!("Deployment {}", id)))
    }

    /// Queued deployments still waiting to run, oldest first
    pub fn queued_deployments(&self) -> Result<Vec<Deployment>, DeploydError> {
        let mut deployments = self.list_json(DEPLOYMENTS, |d: &Deployment| {
            d.status == DeploymentStatus::Pending && d.queued_at.is_some()
        })?;
        deployments.sort_by(|a, b| a.queued_at.cmp(&b.queued_at));
        Ok(deployments)
    }

    /// Delete a deployment and its log when `allow` accepts the current record.
    ///
    /// The check and the delete share one transaction, so an executor cannot
    /// pick the deployment up in between.
    pub fn delete_deployment_if<F>(&self, id: &str, allow: F) -> Result<Deployment, DeploydError>
    where
        F: FnOnce(&Deployment) -> Result<(), DeploydError>,
    {
        let txn = self.db.begin_write().map_err(map_err!("begin write"))?;
        let deployment = {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!("open table"))?;
            let current: Deployment = match table.get(id).map_err(map_err!("read"))? {
                Some(guard) => serde_json::from_slice(guard.value())?,
                None => return Err(DeploydError::NotFound(format!("Deployment {}", id))),
            };
            allow(&current)?;
            table.remove(id).map_err(map_err!("remove"))?;
            current
        };
        {
            let mut logs = txn.open_table(DEPLOYMENT_LOGS).map_err(map_err!("open table"))?;
            let keys = {
                let lo = log_key(id, 0);
                let hi = log_key(id, u64::MAX);
                let mut keys = Vec::new();
                for entry in logs.range(lo.as_str()..=hi.as_str()).map_err(map_err!("range"))? {
                    let (key, _) = entry.map_err(map_err!("read"))?;
                    keys.push(key.value().to_string());
                }
                keys
            };
            for key in keys {
                logs.remove(key.as_str()).map_err(map_err!("remove"))?;
            }
            let mut cursors = txn.open_table(LOG_CURSORS).map_err(map_err!("open table"))?;
            cursors.remove(id).map_err(map_err!("remove"))?;
        }
        txn.commit().map_err(map_err!("commit"))?;
        Ok(deployment)
    }

    // ── Logs ───────────────────────────────────────────────────────

    /// Append lines to a deployment's log, returning the last cursor issued.
    ///
    /// Rejected once the deployment is terminal: the log is frozen with it.
    pub fn append_logs(
        &self,
        deployment_id: &str,
        lines: &[(LogStream, String)],
    ) -> Result<u64, DeploydError> {
        let txn = self.db.begin_write().map_err(map_err!("begin write"))?;
        let last = {
            let deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!("open table"))?;
            let status = match deployments.get(deployment_id).map_err(map_err!("read"))? {
                Some(guard) => serde_json::from_slice::<Deployment>(guard.value())?.status,
                None => {
                    return Err(DeploydError::NotFound(format!("Deployment {}", deployment_id)))
                }
            };
            if status.is_terminal() {
                return Err(DeploydError::InternalStateError(format!(
                    "log of {} deployment {} is frozen",
                    status, deployment_id
                )));
            }

            let mut cursors = txn.open_table(LOG_CURSORS).map_err(map_err!("open table"))?;
            let mut seq = cursors
                .get(deployment_id)
                .map_err(map_err!("read"))?
                .map(|guard| guard.value())
                .unwrap_or(0);

            let mut logs = txn.open_table(DEPLOYMENT_LOGS).map_err(map_err!("open table"))?;
            let timestamp = Utc::now();
            for (stream, line) in lines {
                seq += 1;
                let entry = LogLine {
                    seq,
                    timestamp,
                    stream: *stream,
                    line: line.clone(),
                };
                let bytes = serde_json::to_vec(&entry)?;
                logs.insert(log_key(deployment_id, seq).as_str(), bytes.as_slice())
                    .map_err(map_err!("insert"))?;
            }
            cursors.insert(deployment_id, seq).map_err(map_err!("insert"))?;
            seq
        };
        txn.commit().map_err(map_err!("commit"))?;
        Ok(last)
    }

    pub fn append_log(
        &self,
        deployment_id: &str,
        stream: LogStream,
        line: impl Into<String>,
    ) -> Result<u64, DeploydError> {
        self.append_logs(deployment_id, &[(stream, line.into())])
    }

    /// Read up to `limit` lines with a cursor greater than `after`.
    ///
    /// Runs in a read transaction, so it never waits on the writer.
    pub fn read_logs(
        &self,
        deployment_id: &str,
        after: u64,
        limit: usize,
    ) -> Result<Vec<LogLine>, DeploydError> {
        if after == u64::MAX || limit == 0 {
            return Ok(Vec::new());
        }
        let txn = self.db.begin_read().map_err(map_err!("begin read"))?;
        let table = txn.open_table(DEPLOYMENT_LOGS).map_err(map_err!("open table"))?;
        let lo = log_key(deployment_id, after + 1);
        let hi = log_key(deployment_id, u64::MAX);
        let mut lines = Vec::new();
        for entry in table.range(lo.as_str()..=hi.as_str()).map_err(map_err!("range"))? {
            let (_, value) = entry.map_err(map_err!("read"))?;
            lines.push(serde_json::from_slice(value.value())?);
            if lines.len() >= limit {
                break;
            }
        }
        Ok(lines)
    }
}
