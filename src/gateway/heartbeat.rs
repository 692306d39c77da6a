//! Heartbeat Gateway

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use super::{
    GatewayError, Heartbeat, HeartbeatRecord, LivenessAssignment, LivenessRegistry,
    PermissionChecker,
};

/// Virtual organisation assumed when the caller names none
pub const DEFAULT_VO: &str = "def";

pub struct HeartbeatGateway {
    permissions: Arc<dyn PermissionChecker>,
    registry: Arc<dyn LivenessRegistry>,
}

impl HeartbeatGateway {
    pub fn new(permissions: Arc<dyn PermissionChecker>, registry: Arc<dyn LivenessRegistry>) -> Self {
        Self {
            permissions,
            registry,
        }
    }

    /// All heartbeats, for issuers allowed to `list_heartbeats`
    pub async fn list_heartbeats(
        &self,
        issuer: &str,
        vo: &str,
    ) -> Result<Vec<HeartbeatRecord>, GatewayError> {
        self.authorize(issuer, vo, "list_heartbeats", "list").await?;
        self.registry.list().await
    }

    /// Record a heartbeat, for issuers allowed to `send_heartbeats`
    pub async fn create_heartbeat(
        &self,
        issuer: &str,
        vo: &str,
        heartbeat: &Heartbeat,
    ) -> Result<LivenessAssignment, GatewayError> {
        self.authorize(issuer, vo, "send_heartbeats", "send").await?;
        let assignment = self.registry.record(heartbeat).await?;
        debug!(
            executable = %heartbeat.executable,
            hostname = %heartbeat.hostname,
            pid = heartbeat.pid,
            thread = %heartbeat.thread,
            assign_thread = assignment.assign_thread,
            nr_threads = assignment.nr_threads,
            "Heartbeat recorded"
        );
        Ok(assignment)
    }

    async fn authorize(
        &self,
        issuer: &str,
        vo: &str,
        action: &str,
        verb: &str,
    ) -> Result<(), GatewayError> {
        let context = json!({ "issuer": issuer });
        let result = self
            .permissions
            .has_permission(issuer, vo, action, &context)
            .await?;
        if !result.allowed {
            warn!(issuer = issuer, vo = vo, action = action, "Permission denied");
            return Err(GatewayError::AccessDenied(format!(
                "{} cannot {} heartbeats. {}",
                issuer, verb, result.message
            )));
        }
        Ok(())
    }
}
