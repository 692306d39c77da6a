//! In-memory liveness registry
//!
//! Each worker thread is keyed by `(executable, hostname, pid, thread)`.
//! Recording a heartbeat drops peers of the same executable that have been
//! silent longer than the caller's `older_than`, then assigns the caller its
//! position among the remaining live workers.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use super::{GatewayError, Heartbeat, HeartbeatRecord, LivenessAssignment, LivenessRegistry};

type WorkerKey = (String, String, u32, String);

#[derive(Debug, Default)]
pub struct MemoryLivenessRegistry {
    workers: DashMap<WorkerKey, HeartbeatRecord>,
}

impl MemoryLivenessRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LivenessRegistry for MemoryLivenessRegistry {
    async fn record(&self, heartbeat: &Heartbeat) -> Result<LivenessAssignment, GatewayError> {
        let now = Utc::now();
        let key = (
            heartbeat.executable.clone(),
            heartbeat.hostname.clone(),
            heartbeat.pid,
            heartbeat.thread.clone(),
        );
        self.workers.insert(
            key.clone(),
            HeartbeatRecord {
                executable: heartbeat.executable.clone(),
                hostname: heartbeat.hostname.clone(),
                pid: heartbeat.pid,
                thread: heartbeat.thread.clone(),
                payload: heartbeat.payload.clone(),
                updated_at: now,
            },
        );

        if !heartbeat.older_than.is_zero() {
            let window = chrono::Duration::from_std(heartbeat.older_than)
                .map_err(|e| GatewayError::Registry(format!("Invalid older_than: {}", e)))?;
            let cutoff = now - window;
            self.workers.retain(|k, record| {
                k.0 != heartbeat.executable || record.updated_at >= cutoff
            });
        }

        let mut live: Vec<WorkerKey> = self
            .workers
            .iter()
            .filter(|entry| entry.key().0 == heartbeat.executable)
            .map(|entry| entry.key().clone())
            .collect();
        live.sort();

        let position = live
            .iter()
            .position(|k| *k == key)
            .ok_or_else(|| GatewayError::Registry("heartbeat vanished while recording".into()))?;

        Ok(LivenessAssignment {
            assign_thread: position as u32,
            nr_threads: live.len() as u32,
        })
    }

    async fn list(&self) -> Result<Vec<HeartbeatRecord>, GatewayError> {
        let mut records: Vec<HeartbeatRecord> =
            self.workers.iter().map(|entry| entry.value().clone()).collect();
        records.sort_by(|a, b| {
            (&a.executable, &a.hostname, a.pid, &a.thread).cmp(&(
                &b.executable,
                &b.hostname,
                b.pid,
                &b.thread,
            ))
        });
        Ok(records)
    }
}
