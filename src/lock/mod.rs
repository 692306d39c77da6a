//! Replica Lock Core
//!
//! Tracks whether every replica a replication rule requires exists and is
//! healthy, and reconciles transfer outcomes into lock, rule and dataset-lock
//! state.
//!
//! # Architecture
//!
//! - [`LockQueryService`]: paged and locking reads over lock rows
//! - [`TransferReconciler`]: transfer outcome state machine
//! - [`LockTouchService`]: dataset access time and rule expiry bookkeeping
//!
//! All three work through a [`LockStore`]. Postgres ([`PgLockStore`]) is the
//! production backend; [`MemoryLockStore`] backs tests and local runs.
//!
//! # Lock State Machine
//!
//! ```text
//!                success
//!   REPLICATING ─────────→ OK
//!        │                 │ ↑
//!        │ failure failure │ │ success
//!        ↓                 ↓ │
//!        └──────────────→ STUCK
//! ```
//!
//! # Invariants
//!
//! 1. **Counter sum**: `ok + replicating + stuck` equals the rule's lock count
//!    at every committed state
//! 2. **Rule OK**: only with no replicating and no stuck locks, never from SUSPENDED
//! 3. **Dataset locks**: bulk-flipped by the reconciler only
//! 4. **No row lifecycle**: rows are created and deleted elsewhere; this
//!    module changes states and counters only

pub mod adapters;
pub mod error;
pub mod memory;
pub mod pg;
pub mod query;
pub mod reconciler;
pub mod state;
pub mod store;
pub mod touch;
pub mod types;


// Re-exports for convenience
pub use adapters::{
    DidResolver, FixedLifetimePolicy, HistoryRuleNotifier, LocationDirectory, PgDirectory,
    RetentionPolicy, RuleNotifier,
};
pub use error::LockError;
pub use memory::MemoryLockStore;
pub use pg::{PgLockStore, init_schema};
pub use query::{DatasetLockStream, LockQueryService};
pub use reconciler::{ReconcileSummary, TransferFailure, TransferReconciler};
pub use state::{DidType, LockState, RuleGrouping, RuleNotification, RuleState};
pub use store::{DatasetLockKey, DatasetLockScan, FileLocks, LockStore, LockTx};
pub use touch::LockTouchService;
pub use types::{
    DatasetLock, DatasetLockInfo, Did, DidRef, FileLockFilter, LockMode, ReplicaLock,
    ReplicaLockInfo, ReplicationRule, RseId, RuleHistoryRecord, RuleId, RuleLocation, ShardSpec,
    TouchRequest, UpdatedCollectionReplica, truncate_error,
};
