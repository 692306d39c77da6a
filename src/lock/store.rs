//! Lock Store
//!
//! Storage seam of the lock core. Reads that need no row locks go through
//! [`LockStore`] directly; every mutation and every `FOR UPDATE` read goes
//! through an explicit [`LockTx`] obtained from [`LockStore::begin`].
//!
//! The acquisition mode is fixed per transaction: a `NoWait` transaction
//! fails with [`LockError::LockAcquisitionFailed`] instead of blocking on
//! rows held elsewhere.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::LockError;
use super::state::LockState;
use super::types::{
    DatasetLock, Did, FileLockFilter, LockMode, ReplicaLock, ReplicationRule, RseId,
    RuleHistoryRecord, RuleId, UpdatedCollectionReplica,
};

/// Selection for paged dataset-lock scans
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasetLockScan {
    Dataset(Did),
    Location(RseId),
}

/// Keyset cursor of a dataset-lock scan, ordered as `(scope, name, rse_id, rule_id)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatasetLockKey {
    pub scope: String,
    pub name: String,
    pub rse_id: RseId,
    pub rule_id: RuleId,
}

impl DatasetLock {
    pub fn key(&self) -> DatasetLockKey {
        DatasetLockKey {
            scope: self.scope.clone(),
            name: self.name.clone(),
            rse_id: self.rse_id,
            rule_id: self.rule_id,
        }
    }
}

/// Files of a dataset mapped to their (possibly empty) replica locks
pub type FileLocks = BTreeMap<Did, Vec<ReplicaLock>>;

/// Backing store of lock and rule rows
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Open a transaction acquiring row locks in `mode`
    async fn begin(&self, mode: LockMode) -> Result<Box<dyn LockTx>, LockError>;

    /// One page of dataset locks strictly after `after`, at most `limit` rows
    async fn dataset_locks_page(
        &self,
        scan: &DatasetLockScan,
        after: Option<&DatasetLockKey>,
        limit: usize,
    ) -> Result<Vec<DatasetLock>, LockError>;

    async fn replica_locks_for_rule(&self, rule_id: RuleId) -> Result<Vec<ReplicaLock>, LockError>;

    /// Distinct locations hosting any lock of the rule
    async fn rule_locations(&self, rule_id: RuleId) -> Result<Vec<RseId>, LockError>;
}

/// Open transaction against a [`LockStore`]
///
/// Dropping a transaction without committing discards its changes.
#[async_trait]
pub trait LockTx: Send {
    fn mode(&self) -> LockMode;

    /// Lock and return the replica locks of a file, optionally restricted to
    /// locations and to one state
    async fn replica_locks(
        &mut self,
        scope: &str,
        name: &str,
        rse_ids: Option<&[RseId]>,
        state: Option<LockState>,
    ) -> Result<Vec<ReplicaLock>, LockError>;

    /// Lock and return every file of a dataset with its matching replica locks
    async fn files_and_replica_locks(
        &mut self,
        scope: &str,
        name: &str,
        filter: &FileLockFilter,
    ) -> Result<FileLocks, LockError>;

    /// Lock and return a rule row
    async fn rule_for_update(&mut self, rule_id: RuleId)
    -> Result<Option<ReplicationRule>, LockError>;

    async fn update_replica_lock_state(&mut self, lock: &ReplicaLock) -> Result<(), LockError>;

    /// Persist state, counters and error of a rule
    async fn update_rule(&mut self, rule: &ReplicationRule) -> Result<(), LockError>;

    /// Lock and bulk-set every dataset lock of a rule, returning the row count
    async fn set_dataset_lock_states(
        &mut self,
        rule_id: RuleId,
        state: LockState,
    ) -> Result<u64, LockError>;

    async fn insert_updated_collection_replica(
        &mut self,
        marker: &UpdatedCollectionReplica,
    ) -> Result<(), LockError>;

    async fn insert_rule_history(&mut self, record: &RuleHistoryRecord) -> Result<(), LockError>;

    /// Set `accessed_at` on the dataset locks of a dataset at a location
    async fn set_dataset_lock_accessed_at(
        &mut self,
        scope: &str,
        name: &str,
        rse_id: RseId,
        accessed_at: DateTime<Utc>,
    ) -> Result<u64, LockError>;

    /// Rules owning a dataset lock of a dataset at a location
    async fn dataset_lock_rule_ids(
        &mut self,
        scope: &str,
        name: &str,
        rse_id: RseId,
    ) -> Result<Vec<RuleId>, LockError>;

    async fn set_rule_eol(
        &mut self,
        rule_id: RuleId,
        eol_at: Option<DateTime<Utc>>,
    ) -> Result<(), LockError>;

    async fn commit(self: Box<Self>) -> Result<(), LockError>;

    async fn rollback(self: Box<Self>) -> Result<(), LockError>;
}
