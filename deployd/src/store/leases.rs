//! Target leases: compare-and-set inside a write transaction

use std::time::Duration;

use chrono::{DateTime, Utc};
use redb::ReadableTable;

use crate::errors::DeploydError;
use crate::models::lease::{TargetKey, TargetLease};
use crate::store::state::StateStore;
use crate::store::tables::*;

fn expiry(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>, DeploydError> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| DeploydError::ConfigError(format!("lease ttl: {}", e)))?;
    Ok(now + ttl)
}

impl StateStore {
    /// Take the lease for `target` unless another deployment holds a live one.
    ///
    /// Re-acquiring a lease the same deployment already holds refreshes it.
    pub fn try_acquire_lease(
        &self,
        target: &TargetKey,
        deployment_id: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<TargetLease>, DeploydError> {
        let key = target.table_key();
        let now = Utc::now();
        let txn = self.db.begin_write().map_err(map_err!("begin write"))?;
        let acquired = {
            let mut table = txn.open_table(LEASES).map_err(map_err!("open table"))?;
            let existing: Option<TargetLease> = match table.get(key.as_str()).map_err(map_err!("read"))? {
                Some(guard) => Some(serde_json::from_slice(guard.value())?),
                None => None,
            };
            match existing {
                Some(lease) if lease.deployment_id != deployment_id && !lease.is_expired(now) => None,
                _ => {
                    let lease = TargetLease {
                        target: target.clone(),
                        deployment_id: deployment_id.to_string(),
                        holder: holder.to_string(),
                        acquired_at: now,
                        expires_at: expiry(now, ttl)?,
                    };
                    let bytes = serde_json::to_vec(&lease)?;
                    table.insert(key.as_str(), bytes.as_slice()).map_err(map_err!("insert"))?;
                    Some(lease)
                }
            }
        };
        match acquired {
            Some(_) => txn.commit().map_err(map_err!("commit"))?,
            None => txn.abort().map_err(map_err!("abort"))?,
        }
        Ok(acquired)
    }

    /// Push the expiry forward. Returns false when the lease was lost.
    pub fn renew_lease(
        &self,
        target: &TargetKey,
        deployment_id: &str,
        ttl: Duration,
    ) -> Result<bool, DeploydError> {
        let key = target.table_key();
        let now = Utc::now();
        let mut renewed = false;
        self.update_json(LEASES, &key, |lease: &mut TargetLease| {
            if lease.deployment_id == deployment_id {
                lease.expires_at = expiry(now, ttl)?;
                renewed = true;
            }
            Ok(())
        })?;
        Ok(renewed)
    }

    /// Drop the lease if `deployment_id` still holds it
    pub fn release_lease(&self, target: &TargetKey, deployment_id: &str) -> Result<bool, DeploydError> {
        let key = target.table_key();
        let txn = self.db.begin_write().map_err(map_err!("begin write"))?;
        let released = {
            let mut table = txn.open_table(LEASES).map_err(map_err!("open table"))?;
            let holder: Option<String> = match table.get(key.as_str()).map_err(map_err!("read"))? {
                Some(guard) => Some(serde_json::from_slice::<TargetLease>(guard.value())?.deployment_id),
                None => None,
            };
            if holder.as_deref() == Some(deployment_id) {
                table.remove(key.as_str()).map_err(map_err!("remove"))?;
                true
            } else {
                false
            }
        };
        txn.commit().map_err(map_err!("commit"))?;
        Ok(released)
    }

    pub fn get_lease(&self, target: &TargetKey) -> Result<Option<TargetLease>, DeploydError> {
        self.get_json(LEASES, &target.table_key())
    }

    pub fn list_leases(&self) -> Result<Vec<TargetLease>, DeploydError> {
        self.list_json(LEASES, |_: &TargetLease| true)
    }

    /// Remove every lease that expired before `now`, returning what was reclaimed
    pub fn remove_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<TargetLease>, DeploydError> {
        let txn = self.db.begin_write().map_err(map_err!("begin write"))?;
        let expired = {
            let mut table = txn.open_table(LEASES).map_err(map_err!("open table"))?;
            let mut expired = Vec::new();
            for entry in table.iter().map_err(map_err!("iterate"))? {
                let (_, value) = entry.map_err(map_err!("read"))?;
                let lease: TargetLease = serde_json::from_slice(value.value())?;
                if lease.is_expired(now) {
                    expired.push(lease);
                }
            }
            for lease in &expired {
                table
                    .remove(lease.target.table_key().as_str())
                    .map_err(map_err!("remove"))?;
            }
            expired
        };
        txn.commit().map_err(map_err!("commit"))?;
        Ok(expired)
    }
}
