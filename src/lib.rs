//! Replica Locks - lock and rule reconciliation for distributed data management
//!
//! Tracks, per replication rule, whether every required replica exists and
//! is healthy, and folds transfer outcomes into lock, rule and dataset-lock
//! state under concurrent, at-least-once delivery.
//!
//! # Modules
//!
//! - [`lock`] - Lock store, query service, transfer reconciler, touch service
//! - [`gateway`] - Permission-checked heartbeat entry points
//! - [`db`] - PostgreSQL connection pool
//! - [`config`] - YAML application configuration
//! - [`logging`] - Tracing subscriber setup

pub mod config;
pub mod db;
pub mod gateway;
pub mod lock;
pub mod logging;

// Convenient re-exports at crate root
pub use lock::{
    LockError, LockMode, LockQueryService, LockStore, LockTouchService, LockTx, MemoryLockStore,
    PgLockStore, TransferReconciler,
};
