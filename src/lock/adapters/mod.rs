//! Collaborator Ports
//!
//! Narrow interfaces the lock core consumes from neighbouring subsystems:
//! DID hierarchy, location directory, retention policy and the rule
//! subsystem. The rule subsystem calls back into the lock core, so it is
//! reached only through [`RuleNotifier`].

pub mod postgres;
pub mod rules;

pub use postgres::PgDirectory;
pub use rules::{FixedLifetimePolicy, HistoryRuleNotifier};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::LockError;
use super::state::DidType;
use super::store::LockTx;
use super::types::{Did, ReplicationRule, RseId, RuleId};

/// Location attribute marking destinations that stage from tape
pub const STAGING_REQUIRED: &str = "staging_required";

/// DID hierarchy lookups
#[async_trait]
pub trait DidResolver: Send + Sync {
    /// Type of a DID, [`LockError::NotFound`] when unknown
    async fn resolve(&self, scope: &str, name: &str) -> Result<DidType, LockError>;

    /// Immediate child datasets of a container
    async fn child_datasets(&self, scope: &str, name: &str) -> Result<Vec<Did>, LockError>;
}

/// Storage location directory
#[async_trait]
pub trait LocationDirectory: Send + Sync {
    async fn name(&self, rse_id: RseId) -> Result<String, LockError>;

    async fn attribute(
        &self,
        rse_id: RseId,
        key: &str,
    ) -> Result<Option<serde_json::Value>, LockError>;
}

/// Expiry computation of the retention subsystem
#[async_trait]
pub trait RetentionPolicy: Send + Sync {
    async fn end_of_life(
        &self,
        scope: &str,
        name: &str,
        rse_ids: &[RseId],
    ) -> Result<Option<DateTime<Utc>>, LockError>;
}

/// Callbacks into the rule subsystem, executed inside the reconciler's transaction
#[async_trait]
pub trait RuleNotifier: Send + Sync {
    /// Rule progress/completion event. `replicating_before` is the replicating
    /// counter before the triggering lock moved, so consumers can fire exactly
    /// once on the `> 0` to `== 0` edge.
    async fn notify(
        &self,
        tx: &mut dyn LockTx,
        rule: &ReplicationRule,
        replicating_before: i64,
    ) -> Result<(), LockError>;

    /// End-user notice that a rule with notification `YES` completed
    async fn notify_completion(
        &self,
        tx: &mut dyn LockTx,
        rule: &ReplicationRule,
    ) -> Result<(), LockError>;

    /// Release a parent rule waiting on `child_rule_id`
    async fn release_parent_rule(
        &self,
        tx: &mut dyn LockTx,
        child_rule_id: RuleId,
    ) -> Result<(), LockError>;

    async fn append_history(
        &self,
        tx: &mut dyn LockTx,
        rule: &ReplicationRule,
        recent: bool,
        longterm: bool,
    ) -> Result<(), LockError>;
}

/// Interpret a location attribute as a flag.
///
/// Booleans are taken as is; strings `true`, `yes` and `1` (any case) and
/// non-zero numbers count as set.
pub fn attribute_flag(value: Option<&serde_json::Value>) -> bool {
    match value {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::String(s)) => {
            matches!(s.to_ascii_lowercase().as_str(), "true" | "yes" | "1")
        }
        Some(serde_json::Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
        _ => false,
    }
}

/// Recording notifier for testing
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum RuleEvent {
        Notify {
            rule_id: RuleId,
            replicating_before: i64,
            replicating_after: i64,
        },
        Completion(RuleId),
        ReleaseParent(RuleId),
    }

    /// Records every callback and writes history through the transaction
    #[derive(Default)]
    pub struct RecordingNotifier {
        events: Mutex<Vec<RuleEvent>>,
        fail_notify: Mutex<bool>,
    }

    impl RecordingNotifier {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn events(&self) -> Vec<RuleEvent> {
            self.events.lock().unwrap().clone()
        }

        pub fn set_fail_notify(&self, fail: bool) {
            *self.fail_notify.lock().unwrap() = fail;
        }

        pub fn notify_count(&self) -> usize {
            self.events()
                .iter()
                .filter(|e| matches!(e, RuleEvent::Notify { .. }))
                .count()
        }
    }

    #[async_trait]
    impl RuleNotifier for RecordingNotifier {
        async fn notify(
            &self,
            _tx: &mut dyn LockTx,
            rule: &ReplicationRule,
            replicating_before: i64,
        ) -> Result<(), LockError> {
            if *self.fail_notify.lock().unwrap() {
                return Err(LockError::DatabaseError("Mock notify failure".to_string()));
            }
            self.events.lock().unwrap().push(RuleEvent::Notify {
                rule_id: rule.id,
                replicating_before,
                replicating_after: rule.locks_replicating_cnt,
            });
            Ok(())
        }

        async fn notify_completion(
            &self,
            _tx: &mut dyn LockTx,
            rule: &ReplicationRule,
        ) -> Result<(), LockError> {
            self.events
                .lock()
                .unwrap()
                .push(RuleEvent::Completion(rule.id));
            Ok(())
        }

        async fn release_parent_rule(
            &self,
            _tx: &mut dyn LockTx,
            child_rule_id: RuleId,
        ) -> Result<(), LockError> {
            self.events
                .lock()
                .unwrap()
                .push(RuleEvent::ReleaseParent(child_rule_id));
            Ok(())
        }

        async fn append_history(
            &self,
            tx: &mut dyn LockTx,
            rule: &ReplicationRule,
            recent: bool,
            longterm: bool,
        ) -> Result<(), LockError> {
            HistoryRuleNotifier
                .append_history(tx, rule, recent, longterm)
                .await
        }
    }
}

#[cfg(test)]
pub use mock::{RecordingNotifier, RuleEvent};

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_attribute_flag() {
        assert!(attribute_flag(Some(&json!(true))));
        assert!(attribute_flag(Some(&json!("True"))));
        assert!(attribute_flag(Some(&json!("1"))));
        assert!(attribute_flag(Some(&json!(1))));
        assert!(!attribute_flag(Some(&json!(false))));
        assert!(!attribute_flag(Some(&json!("false"))));
        assert!(!attribute_flag(Some(&json!(0))));
        assert!(!attribute_flag(None));
    }
}
