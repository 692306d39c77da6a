//! Lock Core Types
//!
//! Plain records for the lock tables. Rows are fetched and mutated through an
//! explicit [`LockTx`](super::store::LockTx); nothing here is bound to a
//! session.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::LockError;
use super::state::{DidType, LockState, RuleGrouping, RuleNotification, RuleState};

/// Storage location (RSE) identifier
pub type RseId = Uuid;

/// Replication rule identifier
pub type RuleId = Uuid;

/// Stored rule errors longer than this many characters are cut and suffixed with `...`
pub const MAX_ERROR_CHARS: usize = 245;

/// Truncate a rule error message for storage.
///
/// Messages longer than [`MAX_ERROR_CHARS`] characters keep their first
/// [`MAX_ERROR_CHARS`] characters followed by `"..."`.
pub fn truncate_error(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_CHARS) {
        Some((cut, _)) => format!("{}...", &message[..cut]),
        None => message.to_string(),
    }
}

/// Namespaced data identifier `scope:name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Did {
    pub scope: String,
    pub name: String,
}

impl Did {
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.name)
    }
}

/// Input item for bulk dataset-lock lookups; `did_type` is resolved when absent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DidRef {
    pub scope: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub did_type: Option<DidType>,
}

/// File-level lock: one rule's fulfillment of one file at one location
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicaLock {
    pub scope: String,
    pub name: String,
    pub rse_id: RseId,
    pub rule_id: RuleId,
    pub state: LockState,
}

/// Replica lock enriched with the location name
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicaLockInfo {
    #[serde(flatten)]
    pub lock: ReplicaLock,
    pub rse: String,
}

/// A location hosting at least one lock of a rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleLocation {
    pub rse_id: RseId,
    pub rse: String,
}

/// Dataset-level lock, a projection of the file locks of one rule at one location
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetLock {
    pub scope: String,
    pub name: String,
    pub rse_id: RseId,
    pub rule_id: RuleId,
    pub account: String,
    pub state: LockState,
    pub length: Option<i64>,
    pub bytes: Option<i64>,
    pub accessed_at: Option<DateTime<Utc>>,
}

/// Dataset lock enriched with the location name
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetLockInfo {
    #[serde(flatten)]
    pub lock: DatasetLock,
    pub rse: String,
}

/// Replication rule, restricted to the fields the lock core reads or writes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicationRule {
    pub id: RuleId,
    pub scope: String,
    pub name: String,
    pub did_type: DidType,
    pub state: RuleState,
    pub grouping: RuleGrouping,
    pub locks_ok_cnt: i64,
    pub locks_replicating_cnt: i64,
    pub locks_stuck_cnt: i64,
    pub notification: RuleNotification,
    pub error: Option<String>,
    pub eol_at: Option<DateTime<Utc>>,
}

impl ReplicationRule {
    /// Sum of the three lock counters
    #[inline]
    pub fn total_locks(&self) -> i64 {
        self.locks_ok_cnt + self.locks_replicating_cnt + self.locks_stuck_cnt
    }

    /// Move one lock from `from` to `to` in the counters
    pub fn shift_lock(&mut self, from: LockState, to: LockState) {
        *self.counter_mut(from) -= 1;
        *self.counter_mut(to) += 1;
    }

    fn counter_mut(&mut self, state: LockState) -> &mut i64 {
        match state {
            LockState::Replicating => &mut self.locks_replicating_cnt,
            LockState::Ok => &mut self.locks_ok_cnt,
            LockState::Stuck => &mut self.locks_stuck_cnt,
        }
    }

    /// Counters rendered as `[ok/replicating/stuck]` for logs
    pub fn counters(&self) -> String {
        format!(
            "[{}/{}/{}]",
            self.locks_ok_cnt, self.locks_replicating_cnt, self.locks_stuck_cnt
        )
    }
}

/// Marker telling the collection-replica sweep that a dataset's replica
/// state at a location may have changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdatedCollectionReplica {
    pub scope: String,
    pub name: String,
    pub did_type: DidType,
    pub rse_id: RseId,
}

/// Immutable snapshot of a rule written after each lock transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleHistoryRecord {
    pub rule_id: RuleId,
    pub state: RuleState,
    pub locks_ok_cnt: i64,
    pub locks_replicating_cnt: i64,
    pub locks_stuck_cnt: i64,
    pub error: Option<String>,
    /// `false` for the rolling recent history, `true` for the long-term archive
    pub longterm: bool,
    pub created_at: DateTime<Utc>,
}

impl RuleHistoryRecord {
    pub fn snapshot(rule: &ReplicationRule, longterm: bool) -> Self {
        Self {
            rule_id: rule.id,
            state: rule.state,
            locks_ok_cnt: rule.locks_ok_cnt,
            locks_replicating_cnt: rule.locks_replicating_cnt,
            locks_stuck_cnt: rule.locks_stuck_cnt,
            error: rule.error.clone(),
            longterm,
            created_at: Utc::now(),
        }
    }
}

/// Row lock acquisition mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    /// Wait for conflicting transactions to finish
    #[default]
    Blocking,
    /// Fail immediately with [`LockError::LockAcquisitionFailed`]
    NoWait,
}

impl LockMode {
    pub fn from_nowait(nowait: bool) -> Self {
        if nowait {
            LockMode::NoWait
        } else {
            LockMode::Blocking
        }
    }

    #[inline]
    pub fn is_nowait(&self) -> bool {
        matches!(self, LockMode::NoWait)
    }
}

/// Deterministic partition of a dataset's files across independent workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    total: u32,
    id: u32,
}

impl ShardSpec {
    pub fn new(total: u32, id: u32) -> Result<Self, LockError> {
        if total == 0 || id >= total {
            return Err(LockError::InvalidArgument(format!(
                "shard {} out of range for {} shards",
                id, total
            )));
        }
        Ok(Self { total, id })
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// A single shard covers everything
    #[inline]
    pub fn is_partitioned(&self) -> bool {
        self.total > 1
    }

    /// Shard of a file name.
    ///
    /// First 32 bits of md5(name) as a signed big-endian integer, absolute
    /// value, modulo `total`. Matches the Postgres expression
    /// `mod(abs(('x'||md5(name))::bit(32)::int::bigint), total)`.
    pub fn shard_of(name: &str, total: u32) -> u32 {
        let digest = md5::compute(name.as_bytes());
        let head = i32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        (i64::from(head).abs() % i64::from(total.max(1))) as u32
    }

    pub fn contains(&self, name: &str) -> bool {
        !self.is_partitioned() || Self::shard_of(name, self.total) == self.id
    }
}

/// Options for [`files_and_replica_locks_of_dataset`](super::query::LockQueryService::files_and_replica_locks_of_dataset)
#[derive(Debug, Clone, Default)]
pub struct FileLockFilter {
    /// Only consider locks at these locations; an empty list means no restriction
    pub restrict_rses: Option<Vec<RseId>>,
    /// Only return locks currently `STUCK`
    pub only_stuck: bool,
    pub shard: Option<ShardSpec>,
}

impl FileLockFilter {
    /// Effective location restriction
    pub fn locations(&self) -> Option<&[RseId]> {
        self.restrict_rses.as_deref().filter(|rses| !rses.is_empty())
    }

    pub fn accepts_file(&self, name: &str) -> bool {
        self.shard.is_none_or(|shard| shard.contains(name))
    }

    pub fn accepts_lock(&self, lock: &ReplicaLock) -> bool {
        if self.only_stuck && lock.state != LockState::Stuck {
            return false;
        }
        self.locations()
            .is_none_or(|rses| rses.contains(&lock.rse_id))
    }
}

/// One entry of a dataset-lock touch batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TouchRequest {
    pub scope: String,
    pub name: String,
    pub rse_id: RseId,
    #[serde(default)]
    pub accessed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule() -> ReplicationRule {
        ReplicationRule {
            id: Uuid::new_v4(),
            scope: "mc".to_string(),
            name: "ds".to_string(),
            did_type: DidType::Dataset,
            state: RuleState::Replicating,
            grouping: RuleGrouping::Dataset,
            locks_ok_cnt: 1,
            locks_replicating_cnt: 2,
            locks_stuck_cnt: 0,
            notification: RuleNotification::No,
            error: None,
            eol_at: None,
        }
    }

    #[test]
    fn test_truncate_error_short_message_untouched() {
        assert_eq!(truncate_error("transfer failed"), "transfer failed");
        let exact = "x".repeat(MAX_ERROR_CHARS);
        assert_eq!(truncate_error(&exact), exact);
    }

    #[test]
    fn test_truncate_error_long_message() {
        let message = "e".repeat(300);
        let stored = truncate_error(&message);
        assert_eq!(stored.len(), MAX_ERROR_CHARS + 3);
        assert!(stored.ends_with("..."));
        assert_eq!(&stored[..MAX_ERROR_CHARS], &message[..MAX_ERROR_CHARS]);
    }

    #[test]
    fn test_truncate_error_counts_characters() {
        let message = "é".repeat(MAX_ERROR_CHARS + 1);
        let stored = truncate_error(&message);
        assert_eq!(stored.chars().count(), MAX_ERROR_CHARS + 3);
    }

    #[test]
    fn test_shift_lock_keeps_total() {
        let mut rule = rule();
        rule.shift_lock(LockState::Replicating, LockState::Ok);
        assert_eq!(rule.counters(), "[2/1/0]");
        rule.shift_lock(LockState::Ok, LockState::Stuck);
        assert_eq!(rule.counters(), "[1/1/1]");
        assert_eq!(rule.total_locks(), 3);
    }

    #[test]
    fn test_shard_spec_validation() {
        assert!(ShardSpec::new(0, 0).is_err());
        assert!(ShardSpec::new(4, 4).is_err());
        assert!(ShardSpec::new(4, 3).is_ok());
    }

    #[test]
    fn test_shards_are_disjoint() {
        let shards: Vec<ShardSpec> = (0..4).map(|id| ShardSpec::new(4, id).unwrap()).collect();
        for i in 0..200 {
            let name = format!("file_{:04}.root", i);
            let owners = shards.iter().filter(|s| s.contains(&name)).count();
            assert_eq!(owners, 1, "{} owned by {} shards", name, owners);
        }
    }

    #[test]
    fn test_single_shard_covers_everything() {
        let shard = ShardSpec::new(1, 0).unwrap();
        assert!(!shard.is_partitioned());
        assert!(shard.contains("anything"));
    }

    #[test]
    fn test_filter_empty_restriction_is_no_restriction() {
        let filter = FileLockFilter {
            restrict_rses: Some(vec![]),
            ..Default::default()
        };
        assert!(filter.locations().is_none());
    }

    #[test]
    fn test_filter_accepts_lock() {
        let rse = Uuid::new_v4();
        let lock = ReplicaLock {
            scope: "mc".to_string(),
            name: "f1".to_string(),
            rse_id: rse,
            rule_id: Uuid::new_v4(),
            state: LockState::Ok,
        };
        let stuck_only = FileLockFilter {
            only_stuck: true,
            ..Default::default()
        };
        assert!(!stuck_only.accepts_lock(&lock));

        let elsewhere = FileLockFilter {
            restrict_rses: Some(vec![Uuid::new_v4()]),
            ..Default::default()
        };
        assert!(!elsewhere.accepts_lock(&lock));

        let here = FileLockFilter {
            restrict_rses: Some(vec![rse]),
            ..Default::default()
        };
        assert!(here.accepts_lock(&lock));
    }
}
