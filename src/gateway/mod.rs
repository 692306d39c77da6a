//! Gateway Boundary
//!
//! Permission-checked entry points for worker processes. The gateway does
//! no reconciliation itself; it authorizes the issuer and forwards to the
//! liveness registry.

pub mod heartbeat;
pub mod liveness;

pub use heartbeat::{DEFAULT_VO, HeartbeatGateway};
pub use liveness::MemoryLivenessRegistry;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lock::{LockError, ShardSpec};

/// Gateway errors
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Registry error: {0}")]
    Registry(String),
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::AccessDenied(_) => "ACCESS_DENIED",
            GatewayError::Registry(_) => "REGISTRY_ERROR",
        }
    }
}

/// Outcome of a permission check
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PermissionResult {
    pub allowed: bool,
    /// Reason shown to the issuer when denied
    pub message: String,
}

impl PermissionResult {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            message: String::new(),
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait PermissionChecker: Send + Sync {
    async fn has_permission(
        &self,
        issuer: &str,
        vo: &str,
        action: &str,
        context: &serde_json::Value,
    ) -> Result<PermissionResult, GatewayError>;
}

/// Grants every action to a fixed set of accounts
#[derive(Debug, Clone, Default)]
pub struct AdminPermissions {
    admins: FxHashSet<String>,
}

impl AdminPermissions {
    pub fn new<I, S>(admins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            admins: admins.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl PermissionChecker for AdminPermissions {
    async fn has_permission(
        &self,
        issuer: &str,
        _vo: &str,
        action: &str,
        _context: &serde_json::Value,
    ) -> Result<PermissionResult, GatewayError> {
        if self.admins.contains(issuer) {
            Ok(PermissionResult::allow())
        } else {
            Ok(PermissionResult::deny(format!(
                "Only admin accounts may {}",
                action.replace('_', " ")
            )))
        }
    }
}

/// A liveness report from one worker thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub executable: String,
    pub hostname: String,
    pub pid: u32,
    pub thread: String,
    /// Peers of the same executable silent for longer than this are dropped
    #[serde(with = "seconds")]
    pub older_than: Duration,
    #[serde(default)]
    pub payload: Option<String>,
}

/// Stored liveness of one worker thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartbeatRecord {
    pub executable: String,
    pub hostname: String,
    pub pid: u32,
    pub thread: String,
    pub payload: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Slot of a worker among the live workers of its executable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LivenessAssignment {
    pub assign_thread: u32,
    pub nr_threads: u32,
}

impl LivenessAssignment {
    /// Shard of dataset files this worker owns
    pub fn shard(&self) -> Result<ShardSpec, LockError> {
        ShardSpec::new(self.nr_threads, self.assign_thread)
    }
}

#[async_trait]
pub trait LivenessRegistry: Send + Sync {
    async fn record(&self, heartbeat: &Heartbeat) -> Result<LivenessAssignment, GatewayError>;

    async fn list(&self) -> Result<Vec<HeartbeatRecord>, GatewayError>;
}

mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_admin_permissions() {
        let checker = AdminPermissions::new(["root"]);
        let context = json!({"issuer": "root"});

        let allowed = checker
            .has_permission("root", DEFAULT_VO, "list_heartbeats", &context)
            .await
            .unwrap();
        assert!(allowed.allowed);

        let denied = checker
            .has_permission("jdoe", DEFAULT_VO, "send_heartbeats", &context)
            .await
            .unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.message, "Only admin accounts may send heartbeats");
    }

    #[test]
    fn test_heartbeat_older_than_in_seconds() {
        let heartbeat: Heartbeat = serde_json::from_value(json!({
            "executable": "conveyor-finisher",
            "hostname": "node-01",
            "pid": 4242,
            "thread": "worker-0",
            "older_than": 600
        }))
        .unwrap();
        assert_eq!(heartbeat.older_than, Duration::from_secs(600));
        assert!(heartbeat.payload.is_none());
    }

    #[test]
    fn test_assignment_shard() {
        let assignment = LivenessAssignment {
            assign_thread: 2,
            nr_threads: 4,
        };
        let shard = assignment.shard().unwrap();
        assert_eq!((shard.total(), shard.id()), (4, 2));
    }
}
