//! Default Rule-Side Adapters
//!
//! [`HistoryRuleNotifier`] persists rule history through the reconciler's
//! transaction and reports rule events as structured log records.
//! [`FixedLifetimePolicy`] assigns every touched lock the same lifetime.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use super::{RetentionPolicy, RuleNotifier};
use crate::lock::error::LockError;
use crate::lock::store::LockTx;
use crate::lock::types::{ReplicationRule, RseId, RuleHistoryRecord, RuleId};

/// Rule notifier backed by the history tables
#[derive(Debug, Default, Clone)]
pub struct HistoryRuleNotifier;

impl HistoryRuleNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RuleNotifier for HistoryRuleNotifier {
    async fn notify(
        &self,
        _tx: &mut dyn LockTx,
        rule: &ReplicationRule,
        replicating_before: i64,
    ) -> Result<(), LockError> {
        if replicating_before > 0 && rule.locks_replicating_cnt == 0 {
            info!(
                rule_id = %rule.id,
                did = %format!("{}:{}", rule.scope, rule.name),
                state = %rule.state,
                "Rule replication finished"
            );
        } else {
            info!(
                rule_id = %rule.id,
                replicating_before = replicating_before,
                replicating_after = rule.locks_replicating_cnt,
                "Rule progress"
            );
        }
        Ok(())
    }

    async fn notify_completion(
        &self,
        _tx: &mut dyn LockTx,
        rule: &ReplicationRule,
    ) -> Result<(), LockError> {
        info!(rule_id = %rule.id, "Rule OK notification requested");
        Ok(())
    }

    async fn release_parent_rule(
        &self,
        _tx: &mut dyn LockTx,
        child_rule_id: RuleId,
    ) -> Result<(), LockError> {
        debug!(child_rule_id = %child_rule_id, "No parent rule registry, nothing to release");
        Ok(())
    }

    async fn append_history(
        &self,
        tx: &mut dyn LockTx,
        rule: &ReplicationRule,
        recent: bool,
        longterm: bool,
    ) -> Result<(), LockError> {
        if recent {
            tx.insert_rule_history(&RuleHistoryRecord::snapshot(rule, false))
                .await?;
        }
        if longterm {
            tx.insert_rule_history(&RuleHistoryRecord::snapshot(rule, true))
                .await?;
        }
        Ok(())
    }
}

/// Retention policy granting a fixed lifetime from the moment of the lookup
#[derive(Debug, Clone, Default)]
pub struct FixedLifetimePolicy {
    lifetime: Option<Duration>,
}

impl FixedLifetimePolicy {
    pub fn new(lifetime: Option<Duration>) -> Self {
        Self { lifetime }
    }

    pub fn from_days(days: Option<u32>) -> Self {
        Self::new(days.map(|d| Duration::days(i64::from(d))))
    }
}

#[async_trait]
impl RetentionPolicy for FixedLifetimePolicy {
    async fn end_of_life(
        &self,
        _scope: &str,
        _name: &str,
        _rse_ids: &[RseId],
    ) -> Result<Option<DateTime<Utc>>, LockError> {
        Ok(self.lifetime.map(|lifetime| Utc::now() + lifetime))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixed_lifetime_none() {
        let policy = FixedLifetimePolicy::from_days(None);
        let eol = policy.end_of_life("mc", "ds", &[]).await.unwrap();
        assert!(eol.is_none());
    }

    #[tokio::test]
    async fn test_fixed_lifetime_days() {
        let policy = FixedLifetimePolicy::from_days(Some(30));
        let before = Utc::now();
        let eol = policy.end_of_life("mc", "ds", &[]).await.unwrap().unwrap();
        assert!(eol >= before + Duration::days(30));
        assert!(eol <= Utc::now() + Duration::days(30));
    }

    #[tokio::test]
    async fn test_history_written_per_requested_table() {
        use crate::lock::memory::MemoryLockStore;
        use crate::lock::state::{DidType, RuleGrouping, RuleNotification, RuleState};
        use crate::lock::store::LockStore;
        use crate::lock::types::LockMode;

        let store = MemoryLockStore::new();
        let rule = ReplicationRule {
            id: uuid::Uuid::new_v4(),
            scope: "mc".into(),
            name: "ds".into(),
            did_type: DidType::Dataset,
            state: RuleState::Stuck,
            grouping: RuleGrouping::Dataset,
            locks_ok_cnt: 1,
            locks_replicating_cnt: 0,
            locks_stuck_cnt: 1,
            notification: RuleNotification::No,
            error: Some("timeout".into()),
            eol_at: None,
        };

        let mut tx = store.begin(LockMode::Blocking).await.unwrap();
        let notifier = HistoryRuleNotifier::new();
        notifier.append_history(tx.as_mut(), &rule, true, true).await.unwrap();
        notifier.append_history(tx.as_mut(), &rule, false, false).await.unwrap();
        tx.commit().await.unwrap();

        let history = store.rule_history(rule.id).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history.iter().filter(|h| h.longterm).count(), 1);
        assert!(history.iter().all(|h| h.state == RuleState::Stuck));
    }
}
