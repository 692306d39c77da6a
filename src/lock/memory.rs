//! In-Memory Lock Store
//!
//! A complete [`LockStore`] for tests and local runs.
//!
//! Committed rows live behind a read-write lock. Reads that take no row
//! locks (dataset-lock pages, per-rule views, inspection helpers) see the
//! last committed state and never wait on open transactions. A transaction
//! claims the rows it reads for update or writes, buffers its writes, and
//! applies them on commit. Claims are released on commit, rollback or drop.
//! A claim on a row held by another transaction fails at once under
//! `NoWait` and waits for the holder under `Blocking`.
//!
//! The DID hierarchy and location catalog sit behind a separate lock, so the
//! store can serve as [`DidResolver`] and [`LocationDirectory`] while a
//! transaction is open. Seeding helpers stand in for the rule-placement
//! subsystem.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{Notify, RwLock};
use uuid::Uuid;

use super::adapters::{DidResolver, LocationDirectory};
use super::error::LockError;
use super::state::{DidType, LockState};
use super::store::{DatasetLockKey, DatasetLockScan, FileLocks, LockStore, LockTx};
use super::types::{
    DatasetLock, Did, FileLockFilter, LockMode, ReplicaLock, ReplicationRule, RseId,
    RuleHistoryRecord, RuleId, UpdatedCollectionReplica,
};

#[derive(Debug, Clone)]
struct RseEntry {
    name: String,
    attributes: FxHashMap<String, serde_json::Value>,
}

/// Read-only side of the store, outside transactions
#[derive(Debug, Default)]
struct Catalog {
    rses: FxHashMap<RseId, RseEntry>,
    dids: FxHashMap<Did, DidType>,
    /// parent -> children, in attachment order
    contents: FxHashMap<Did, Vec<Did>>,
    /// Datasets whose dataset-lock writes fail, for fault injection
    failing_datasets: FxHashSet<Did>,
}

impl Catalog {
    fn check_writable(&self, scope: &str, name: &str) -> Result<(), LockError> {
        let did = Did::new(scope, name);
        if self.failing_datasets.contains(&did) {
            return Err(LockError::DatabaseError(format!(
                "write to dataset locks of {} rejected",
                did
            )));
        }
        Ok(())
    }
}

/// Committed rows
#[derive(Debug, Default)]
struct Tables {
    rules: FxHashMap<RuleId, ReplicationRule>,
    replica_locks: Vec<ReplicaLock>,
    dataset_locks: Vec<DatasetLock>,
    updated_collection_replicas: Vec<UpdatedCollectionReplica>,
    rule_history: Vec<RuleHistoryRecord>,
}

impl Tables {
    fn apply(&mut self, writes: PendingWrites) {
        for lock in &mut self.replica_locks {
            if let Some(state) = writes.replica_states.get(&RowKey::replica(lock)) {
                lock.state = *state;
            }
        }
        for (rule_id, rule) in writes.rules {
            if let Some(stored) = self.rules.get_mut(&rule_id) {
                *stored = rule;
            }
        }
        for lock in &mut self.dataset_locks {
            let key = lock.key();
            if let Some(state) = writes.dataset_states.get(&key) {
                lock.state = *state;
            }
            if let Some(accessed_at) = writes.dataset_accessed.get(&key) {
                lock.accessed_at = Some(*accessed_at);
            }
        }
        self.updated_collection_replicas.extend(writes.markers);
        self.rule_history.extend(writes.history);
    }
}

/// A lockable row
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RowKey {
    Replica {
        scope: String,
        name: String,
        rse_id: RseId,
        rule_id: RuleId,
    },
    Rule(RuleId),
    Dataset(DatasetLockKey),
}

impl RowKey {
    fn replica(lock: &ReplicaLock) -> Self {
        RowKey::Replica {
            scope: lock.scope.clone(),
            name: lock.name.clone(),
            rse_id: lock.rse_id,
            rule_id: lock.rule_id,
        }
    }
}

/// Row claims of open transactions
#[derive(Default)]
struct RowClaims {
    owners: std::sync::Mutex<FxHashMap<RowKey, u64>>,
    released: Notify,
    next_tx: AtomicU64,
}

impl RowClaims {
    fn next_tx(&self) -> u64 {
        self.next_tx.fetch_add(1, Ordering::Relaxed)
    }

    fn held(&self) -> MutexGuard<'_, FxHashMap<RowKey, u64>> {
        self.owners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim every key for `tx` at once. Keys already held by `tx` are fine.
    async fn claim(&self, tx: u64, keys: &[RowKey], mode: LockMode) -> Result<(), LockError> {
        loop {
            let released = self.released.notified();
            {
                let mut held = self.held();
                let busy = keys
                    .iter()
                    .any(|key| held.get(key).is_some_and(|owner| *owner != tx));
                if !busy {
                    for key in keys {
                        held.insert(key.clone(), tx);
                    }
                    return Ok(());
                }
            }
            if mode == LockMode::NoWait {
                return Err(LockError::LockAcquisitionFailed(
                    "rows held by a concurrent transaction".into(),
                ));
            }
            released.await;
        }
    }

    fn release(&self, tx: u64) {
        self.held().retain(|_, owner| *owner != tx);
        self.released.notify_waiters();
    }
}

/// In-memory lock store
#[derive(Clone, Default)]
pub struct MemoryLockStore {
    catalog: Arc<RwLock<Catalog>>,
    tables: Arc<RwLock<Tables>>,
    claims: Arc<RowClaims>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    // === Seeding ===

    /// Register a location, returning its id
    pub async fn add_rse(&self, name: &str) -> RseId {
        let rse_id = Uuid::new_v4();
        self.catalog.write().await.rses.insert(
            rse_id,
            RseEntry {
                name: name.to_string(),
                attributes: FxHashMap::default(),
            },
        );
        rse_id
    }

    pub async fn set_rse_attribute(&self, rse_id: RseId, key: &str, value: serde_json::Value) {
        if let Some(rse) = self.catalog.write().await.rses.get_mut(&rse_id) {
            rse.attributes.insert(key.to_string(), value);
        }
    }

    pub async fn add_did(&self, did: Did, did_type: DidType) {
        self.catalog.write().await.dids.insert(did, did_type);
    }

    /// Attach `child` to `parent`; repeated attachments are ignored
    pub async fn attach(&self, parent: &Did, child: Did) {
        let mut catalog = self.catalog.write().await;
        let children = catalog.contents.entry(parent.clone()).or_default();
        if !children.contains(&child) {
            children.push(child);
        }
    }

    pub async fn insert_rule(&self, rule: ReplicationRule) {
        self.tables.write().await.rules.insert(rule.id, rule);
    }

    pub async fn insert_replica_lock(&self, lock: ReplicaLock) {
        self.tables.write().await.replica_locks.push(lock);
    }

    pub async fn insert_dataset_lock(&self, lock: DatasetLock) {
        self.tables.write().await.dataset_locks.push(lock);
    }

    /// Make every dataset-lock write for `did` fail with a storage error
    pub async fn fail_dataset_lock_writes(&self, did: Did) {
        self.catalog.write().await.failing_datasets.insert(did);
    }

    // === Inspection (committed state) ===

    pub async fn rule(&self, rule_id: RuleId) -> Option<ReplicationRule> {
        self.tables.read().await.rules.get(&rule_id).cloned()
    }

    pub async fn replica_lock(
        &self,
        scope: &str,
        name: &str,
        rse_id: RseId,
        rule_id: RuleId,
    ) -> Option<ReplicaLock> {
        self.tables
            .read()
            .await
            .replica_locks
            .iter()
            .find(|l| {
                l.scope == scope && l.name == name && l.rse_id == rse_id && l.rule_id == rule_id
            })
            .cloned()
    }

    pub async fn dataset_locks_of_rule(&self, rule_id: RuleId) -> Vec<DatasetLock> {
        self.tables
            .read()
            .await
            .dataset_locks
            .iter()
            .filter(|l| l.rule_id == rule_id)
            .cloned()
            .collect()
    }

    pub async fn updated_collection_replicas(&self) -> Vec<UpdatedCollectionReplica> {
        self.tables.read().await.updated_collection_replicas.clone()
    }

    pub async fn rule_history(&self, rule_id: RuleId) -> Vec<RuleHistoryRecord> {
        self.tables
            .read()
            .await
            .rule_history
            .iter()
            .filter(|h| h.rule_id == rule_id)
            .cloned()
            .collect()
    }

    /// Number of replica locks owned by a rule
    pub async fn lock_count(&self, rule_id: RuleId) -> i64 {
        self.tables
            .read()
            .await
            .replica_locks
            .iter()
            .filter(|l| l.rule_id == rule_id)
            .count() as i64
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn begin(&self, mode: LockMode) -> Result<Box<dyn LockTx>, LockError> {
        Ok(Box::new(MemoryLockTx {
            id: self.claims.next_tx(),
            mode,
            tables: self.tables.clone(),
            catalog: self.catalog.clone(),
            claims: self.claims.clone(),
            writes: PendingWrites::default(),
        }))
    }

    async fn dataset_locks_page(
        &self,
        scan: &DatasetLockScan,
        after: Option<&DatasetLockKey>,
        limit: usize,
    ) -> Result<Vec<DatasetLock>, LockError> {
        let tables = self.tables.read().await;
        let mut locks: Vec<&DatasetLock> = tables
            .dataset_locks
            .iter()
            .filter(|l| match scan {
                DatasetLockScan::Dataset(did) => l.scope == did.scope && l.name == did.name,
                DatasetLockScan::Location(rse_id) => l.rse_id == *rse_id,
            })
            .collect();
        locks.sort_by_key(|l| l.key());

        Ok(locks
            .into_iter()
            .filter(|l| after.is_none_or(|key| l.key() > *key))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn replica_locks_for_rule(&self, rule_id: RuleId) -> Result<Vec<ReplicaLock>, LockError> {
        let tables = self.tables.read().await;
        let mut locks: Vec<ReplicaLock> = tables
            .replica_locks
            .iter()
            .filter(|l| l.rule_id == rule_id)
            .cloned()
            .collect();
        locks.sort_by(|a, b| (&a.scope, &a.name, a.rse_id).cmp(&(&b.scope, &b.name, b.rse_id)));
        Ok(locks)
    }

    async fn rule_locations(&self, rule_id: RuleId) -> Result<Vec<RseId>, LockError> {
        let tables = self.tables.read().await;
        let mut rse_ids: Vec<RseId> = tables
            .replica_locks
            .iter()
            .filter(|l| l.rule_id == rule_id)
            .map(|l| l.rse_id)
            .collect();
        rse_ids.sort();
        rse_ids.dedup();
        Ok(rse_ids)
    }
}

#[async_trait]
impl DidResolver for MemoryLockStore {
    async fn resolve(&self, scope: &str, name: &str) -> Result<DidType, LockError> {
        let did = Did::new(scope, name);
        self.catalog
            .read()
            .await
            .dids
            .get(&did)
            .copied()
            .ok_or_else(|| LockError::NotFound(did.to_string()))
    }

    async fn child_datasets(&self, scope: &str, name: &str) -> Result<Vec<Did>, LockError> {
        let catalog = self.catalog.read().await;
        let parent = Did::new(scope, name);
        Ok(catalog
            .contents
            .get(&parent)
            .map(|children| {
                children
                    .iter()
                    .filter(|c| catalog.dids.get(*c) == Some(&DidType::Dataset))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl LocationDirectory for MemoryLockStore {
    async fn name(&self, rse_id: RseId) -> Result<String, LockError> {
        self.catalog
            .read()
            .await
            .rses
            .get(&rse_id)
            .map(|rse| rse.name.clone())
            .ok_or_else(|| LockError::NotFound(format!("RSE {}", rse_id)))
    }

    async fn attribute(
        &self,
        rse_id: RseId,
        key: &str,
    ) -> Result<Option<serde_json::Value>, LockError> {
        let catalog = self.catalog.read().await;
        let rse = catalog
            .rses
            .get(&rse_id)
            .ok_or_else(|| LockError::NotFound(format!("RSE {}", rse_id)))?;
        Ok(rse.attributes.get(key).cloned())
    }
}

/// Writes buffered until commit
#[derive(Debug, Default)]
struct PendingWrites {
    replica_states: FxHashMap<RowKey, LockState>,
    rules: FxHashMap<RuleId, ReplicationRule>,
    dataset_states: FxHashMap<DatasetLockKey, LockState>,
    dataset_accessed: FxHashMap<DatasetLockKey, DateTime<Utc>>,
    markers: Vec<UpdatedCollectionReplica>,
    history: Vec<RuleHistoryRecord>,
}

/// Open transaction: committed rows plus this transaction's own writes
pub struct MemoryLockTx {
    id: u64,
    mode: LockMode,
    tables: Arc<RwLock<Tables>>,
    catalog: Arc<RwLock<Catalog>>,
    claims: Arc<RowClaims>,
    writes: PendingWrites,
}

impl MemoryLockTx {
    async fn claim(&self, keys: &[RowKey]) -> Result<(), LockError> {
        self.claims.claim(self.id, keys, self.mode).await
    }

    /// A committed replica lock as this transaction sees it
    fn visible(&self, lock: &ReplicaLock) -> ReplicaLock {
        let mut lock = lock.clone();
        if let Some(state) = self.writes.replica_states.get(&RowKey::replica(&lock)) {
            lock.state = *state;
        }
        lock
    }

    async fn visible_rule(&self, rule_id: RuleId) -> Option<ReplicationRule> {
        match self.writes.rules.get(&rule_id) {
            Some(rule) => Some(rule.clone()),
            None => self.tables.read().await.rules.get(&rule_id).cloned(),
        }
    }

    /// Replica locks of the given files that `keep` accepts, grouped per file
    async fn file_locks(
        &self,
        files: &[Did],
        keep: impl Fn(&ReplicaLock) -> bool + Send,
    ) -> FileLocks {
        let tables = self.tables.read().await;
        let mut found: FileLocks = files.iter().map(|f| (f.clone(), Vec::new())).collect();
        for lock in tables.replica_locks.iter().map(|l| self.visible(l)) {
            if let Some(locks) = found.get_mut(&Did::new(&lock.scope, &lock.name))
                && keep(&lock)
            {
                locks.push(lock);
            }
        }
        found
    }

    /// Claim the matching locks, then re-read them so the result reflects
    /// commits that landed while waiting
    async fn lock_files(
        &self,
        files: &[Did],
        keep: impl Fn(&ReplicaLock) -> bool + Send + Sync,
    ) -> Result<FileLocks, LockError> {
        let keys: FxHashSet<RowKey> = self
            .file_locks(files, &keep)
            .await
            .values()
            .flatten()
            .map(RowKey::replica)
            .collect();
        let keys: Vec<RowKey> = keys.into_iter().collect();
        self.claim(&keys).await?;

        let claimed: FxHashSet<RowKey> = keys.into_iter().collect();
        Ok(self
            .file_locks(files, |l| claimed.contains(&RowKey::replica(l)) && keep(l))
            .await)
    }

    async fn dataset_lock_keys(
        &self,
        matches: impl Fn(&DatasetLock) -> bool + Send,
    ) -> Vec<DatasetLockKey> {
        self.tables
            .read()
            .await
            .dataset_locks
            .iter()
            .filter(|l| matches(l))
            .map(DatasetLock::key)
            .collect()
    }
}

#[async_trait]
impl LockTx for MemoryLockTx {
    fn mode(&self) -> LockMode {
        self.mode
    }

    async fn replica_locks(
        &mut self,
        scope: &str,
        name: &str,
        rse_ids: Option<&[RseId]>,
        state: Option<LockState>,
    ) -> Result<Vec<ReplicaLock>, LockError> {
        let rse_ids = rse_ids.filter(|ids| !ids.is_empty());
        let file = Did::new(scope, name);
        let mut locks: Vec<ReplicaLock> = self
            .lock_files(std::slice::from_ref(&file), |l| {
                rse_ids.is_none_or(|ids| ids.contains(&l.rse_id))
                    && state.is_none_or(|s| l.state == s)
            })
            .await?
            .into_values()
            .flatten()
            .collect();
        locks.sort_by_key(|l| (l.rule_id, l.rse_id));
        Ok(locks)
    }

    async fn files_and_replica_locks(
        &mut self,
        scope: &str,
        name: &str,
        filter: &FileLockFilter,
    ) -> Result<FileLocks, LockError> {
        let files: Vec<Did> = {
            let catalog = self.catalog.read().await;
            catalog
                .contents
                .get(&Did::new(scope, name))
                .map(|children| {
                    children
                        .iter()
                        .filter(|c| filter.accepts_file(&c.name))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        self.lock_files(&files, |l| filter.accepts_lock(l)).await
    }

    async fn rule_for_update(
        &mut self,
        rule_id: RuleId,
    ) -> Result<Option<ReplicationRule>, LockError> {
        self.claim(&[RowKey::Rule(rule_id)]).await?;
        Ok(self.visible_rule(rule_id).await)
    }

    async fn update_replica_lock_state(&mut self, lock: &ReplicaLock) -> Result<(), LockError> {
        let key = RowKey::replica(lock);
        self.claim(std::slice::from_ref(&key)).await?;
        let exists = self.tables.read().await.replica_locks.iter().any(|l| {
            l.scope == lock.scope
                && l.name == lock.name
                && l.rse_id == lock.rse_id
                && l.rule_id == lock.rule_id
        });
        if !exists {
            return Err(LockError::Integrity(format!(
                "replica lock {}:{} of rule {} vanished",
                lock.scope, lock.name, lock.rule_id
            )));
        }
        self.writes.replica_states.insert(key, lock.state);
        Ok(())
    }

    async fn update_rule(&mut self, rule: &ReplicationRule) -> Result<(), LockError> {
        self.claim(&[RowKey::Rule(rule.id)]).await?;
        let mut stored = self
            .visible_rule(rule.id)
            .await
            .ok_or_else(|| LockError::Integrity(format!("rule {} vanished", rule.id)))?;
        stored.state = rule.state;
        stored.locks_ok_cnt = rule.locks_ok_cnt;
        stored.locks_replicating_cnt = rule.locks_replicating_cnt;
        stored.locks_stuck_cnt = rule.locks_stuck_cnt;
        stored.error = rule.error.clone();
        self.writes.rules.insert(rule.id, stored);
        Ok(())
    }

    async fn set_dataset_lock_states(
        &mut self,
        rule_id: RuleId,
        state: LockState,
    ) -> Result<u64, LockError> {
        let keys = self.dataset_lock_keys(|l| l.rule_id == rule_id).await;
        let rows: Vec<RowKey> = keys.iter().cloned().map(RowKey::Dataset).collect();
        self.claim(&rows).await?;

        let updated = keys.len() as u64;
        for key in keys {
            self.writes.dataset_states.insert(key, state);
        }
        Ok(updated)
    }

    async fn insert_updated_collection_replica(
        &mut self,
        marker: &UpdatedCollectionReplica,
    ) -> Result<(), LockError> {
        self.writes.markers.push(marker.clone());
        Ok(())
    }

    async fn insert_rule_history(&mut self, record: &RuleHistoryRecord) -> Result<(), LockError> {
        self.writes.history.push(record.clone());
        Ok(())
    }

    async fn set_dataset_lock_accessed_at(
        &mut self,
        scope: &str,
        name: &str,
        rse_id: RseId,
        accessed_at: DateTime<Utc>,
    ) -> Result<u64, LockError> {
        self.catalog.read().await.check_writable(scope, name)?;
        let keys = self
            .dataset_lock_keys(|l| l.scope == scope && l.name == name && l.rse_id == rse_id)
            .await;
        let rows: Vec<RowKey> = keys.iter().cloned().map(RowKey::Dataset).collect();
        self.claim(&rows).await?;

        let updated = keys.len() as u64;
        for key in keys {
            self.writes.dataset_accessed.insert(key, accessed_at);
        }
        Ok(updated)
    }

    async fn dataset_lock_rule_ids(
        &mut self,
        scope: &str,
        name: &str,
        rse_id: RseId,
    ) -> Result<Vec<RuleId>, LockError> {
        Ok(self
            .dataset_lock_keys(|l| l.scope == scope && l.name == name && l.rse_id == rse_id)
            .await
            .into_iter()
            .map(|key| key.rule_id)
            .collect())
    }

    async fn set_rule_eol(
        &mut self,
        rule_id: RuleId,
        eol_at: Option<DateTime<Utc>>,
    ) -> Result<(), LockError> {
        self.claim(&[RowKey::Rule(rule_id)]).await?;
        if let Some(mut rule) = self.visible_rule(rule_id).await {
            rule.eol_at = eol_at;
            self.writes.rules.insert(rule_id, rule);
        }
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), LockError> {
        let writes = std::mem::take(&mut self.writes);
        self.tables.write().await.apply(writes);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), LockError> {
        Ok(())
    }
}

impl Drop for MemoryLockTx {
    fn drop(&mut self) {
        self.claims.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    async fn seeded_locks(files: &[&str]) -> (MemoryLockStore, RseId, RuleId) {
        let store = MemoryLockStore::new();
        let rse_id = store.add_rse("SITE_A").await;
        let rule_id = Uuid::new_v4();
        for file in files {
            store
                .insert_replica_lock(ReplicaLock {
                    scope: "mc".into(),
                    name: file.to_string(),
                    rse_id,
                    rule_id,
                    state: LockState::Replicating,
                })
                .await;
        }
        (store, rse_id, rule_id)
    }

    #[tokio::test]
    async fn test_nowait_conflicts_only_on_held_rows() {
        let (store, _, _) = seeded_locks(&["f1", "f2"]).await;
        let mut holder = store.begin(LockMode::Blocking).await.unwrap();
        holder.replica_locks("mc", "f1", None, None).await.unwrap();

        let mut contender = store.begin(LockMode::NoWait).await.unwrap();
        let result = contender.replica_locks("mc", "f1", None, None).await;
        assert!(matches!(result, Err(LockError::LockAcquisitionFailed(_))));
        assert_eq!(
            contender.replica_locks("mc", "f2", None, None).await.unwrap().len(),
            1
        );
        contender.rollback().await.unwrap();

        holder.rollback().await.unwrap();
        let mut after = store.begin(LockMode::NoWait).await.unwrap();
        assert_eq!(after.replica_locks("mc", "f1", None, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_blocking_waits_for_holder_commit() {
        let (store, rse_id, rule_id) = seeded_locks(&["f1"]).await;
        let mut holder = store.begin(LockMode::Blocking).await.unwrap();
        let mut lock = holder.replica_locks("mc", "f1", None, None).await.unwrap().remove(0);

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut tx = store.begin(LockMode::Blocking).await.unwrap();
                let locks = tx.replica_locks("mc", "f1", None, None).await.unwrap();
                tx.rollback().await.unwrap();
                locks
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        lock.state = LockState::Ok;
        holder.update_replica_lock_state(&lock).await.unwrap();
        holder.commit().await.unwrap();

        let seen = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter released on commit")
            .unwrap();
        assert_eq!(seen[0].state, LockState::Ok);
        assert_eq!(
            store.replica_lock("mc", "f1", rse_id, rule_id).await.unwrap().state,
            LockState::Ok
        );
    }

    #[tokio::test]
    async fn test_dropped_transaction_releases_rows() {
        let (store, _, rule_id) = seeded_locks(&["f1"]).await;
        {
            let mut tx = store.begin(LockMode::Blocking).await.unwrap();
            tx.replica_locks("mc", "f1", None, None).await.unwrap();
            tx.rule_for_update(rule_id).await.unwrap();
        }
        let mut tx = store.begin(LockMode::NoWait).await.unwrap();
        assert!(tx.replica_locks("mc", "f1", None, None).await.is_ok());
        assert!(tx.rule_for_update(rule_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_plain_reads_see_committed_state_during_transaction() {
        let (store, rse_id, rule_id) = seeded_locks(&["f1"]).await;
        let mut tx = store.begin(LockMode::Blocking).await.unwrap();
        let mut lock = tx.replica_locks("mc", "f1", None, None).await.unwrap().remove(0);
        lock.state = LockState::Stuck;
        tx.update_replica_lock_state(&lock).await.unwrap();

        let committed = tokio::time::timeout(
            Duration::from_secs(2),
            store.replica_locks_for_rule(rule_id),
        )
        .await
        .expect("read not blocked by open transaction")
        .unwrap();
        assert_eq!(committed[0].state, LockState::Replicating);

        let own = tx
            .replica_locks("mc", "f1", Some(&[rse_id][..]), Some(LockState::Stuck))
            .await
            .unwrap();
        assert_eq!(own.len(), 1);
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_rollback_discards_changes() {
        let store = MemoryLockStore::new();
        let rse_id = store.add_rse("SITE_A").await;
        let rule_id = Uuid::new_v4();
        store
            .insert_replica_lock(ReplicaLock {
                scope: "mc".into(),
                name: "f1".into(),
                rse_id,
                rule_id,
                state: LockState::Replicating,
            })
            .await;

        let mut tx = store.begin(LockMode::Blocking).await.unwrap();
        let mut lock = tx.replica_locks("mc", "f1", None, None).await.unwrap().remove(0);
        lock.state = LockState::Ok;
        tx.update_replica_lock_state(&lock).await.unwrap();
        tx.rollback().await.unwrap();

        let stored = store.replica_lock("mc", "f1", rse_id, rule_id).await.unwrap();
        assert_eq!(stored.state, LockState::Replicating);
    }

    #[tokio::test]
    async fn test_commit_publishes_changes() {
        let store = MemoryLockStore::new();
        let rse_id = store.add_rse("SITE_A").await;
        let rule_id = Uuid::new_v4();
        store
            .insert_replica_lock(ReplicaLock {
                scope: "mc".into(),
                name: "f1".into(),
                rse_id,
                rule_id,
                state: LockState::Replicating,
            })
            .await;

        let mut tx = store.begin(LockMode::NoWait).await.unwrap();
        let mut lock = tx.replica_locks("mc", "f1", Some(&[rse_id][..]), None).await.unwrap().remove(0);
        lock.state = LockState::Stuck;
        tx.update_replica_lock_state(&lock).await.unwrap();
        tx.commit().await.unwrap();

        let stored = store.replica_lock("mc", "f1", rse_id, rule_id).await.unwrap();
        assert_eq!(stored.state, LockState::Stuck);
    }

    #[tokio::test]
    async fn test_missing_rule_update_is_integrity_violation() {
        let store = MemoryLockStore::new();
        let mut tx = store.begin(LockMode::Blocking).await.unwrap();
        let rule = ReplicationRule {
            id: Uuid::new_v4(),
            scope: "mc".into(),
            name: "ds".into(),
            did_type: DidType::Dataset,
            state: crate::lock::state::RuleState::Ok,
            grouping: crate::lock::state::RuleGrouping::None,
            locks_ok_cnt: 0,
            locks_replicating_cnt: 0,
            locks_stuck_cnt: 0,
            notification: crate::lock::state::RuleNotification::No,
            error: None,
            eol_at: None,
        };
        let result = tx.update_rule(&rule).await;
        assert!(matches!(result, Err(LockError::Integrity(_))));
    }

    #[tokio::test]
    async fn test_child_datasets_skip_files() {
        let store = MemoryLockStore::new();
        let container = Did::new("mc", "cont");
        let ds = Did::new("mc", "ds1");
        let file = Did::new("mc", "f1");
        store.add_did(container.clone(), DidType::Container).await;
        store.add_did(ds.clone(), DidType::Dataset).await;
        store.add_did(file.clone(), DidType::File).await;
        store.attach(&container, ds.clone()).await;
        store.attach(&container, file).await;

        let children = store.child_datasets("mc", "cont").await.unwrap();
        assert_eq!(children, vec![ds]);
    }
}
