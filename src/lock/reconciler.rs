//! Transfer Outcome Reconciler
//!
//! Applies transfer outcomes to replica locks and keeps the owning rules'
//! counters, states and dataset locks consistent. Each call runs in one
//! store transaction: it either commits every change or none.
//!
//! Per lock:
//!
//! ```text
//!   success: REPLICATING -> OK, STUCK -> OK, OK -> OK (skipped)
//!   failure: REPLICATING -> STUCK, OK -> STUCK, STUCK -> STUCK (skipped)
//! ```
//!
//! Per rule, with SUSPENDED left alone:
//!
//! ```text
//!   REPLICATING -> OK         last replicating lock done, none stuck
//!   REPLICATING <-> STUCK     first stuck lock / external repair
//!   any -> SUSPENDED          failure names the rule as broken
//! ```

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::adapters::{
    DidResolver, LocationDirectory, RuleNotifier, STAGING_REQUIRED, attribute_flag,
};
use super::error::LockError;
use super::state::{DidType, LockState, RuleNotification, RuleState};
use super::store::{LockStore, LockTx};
use super::types::{
    LockMode, ReplicaLock, ReplicationRule, RseId, RuleId, UpdatedCollectionReplica,
    truncate_error,
};

/// Failure report of one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFailure {
    pub error_message: String,
    /// Rule to suspend because the transfer can never succeed for it
    pub broken_rule_id: Option<RuleId>,
    /// Error stored on the suspended rule, `error_message` when absent
    pub broken_message: Option<String>,
}

impl TransferFailure {
    pub fn new(error_message: impl Into<String>) -> Self {
        Self {
            error_message: error_message.into(),
            broken_rule_id: None,
            broken_message: None,
        }
    }

    pub fn broken(mut self, rule_id: RuleId, message: impl Into<String>) -> Self {
        self.broken_rule_id = Some(rule_id);
        self.broken_message = Some(message.into());
        self
    }

    fn suspension_message(&self) -> &str {
        self.broken_message.as_deref().unwrap_or(&self.error_message)
    }
}

/// What a reconciliation call changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub locks_changed: usize,
    pub rules_changed: usize,
}

/// Rule-level effect of one successful lock
enum SuccessEffect {
    Unchanged,
    Completed,
    Progress,
}

pub struct TransferReconciler {
    store: Arc<dyn LockStore>,
    dids: Arc<dyn DidResolver>,
    locations: Arc<dyn LocationDirectory>,
    rules: Arc<dyn RuleNotifier>,
}

impl TransferReconciler {
    pub fn new(
        store: Arc<dyn LockStore>,
        dids: Arc<dyn DidResolver>,
        locations: Arc<dyn LocationDirectory>,
        rules: Arc<dyn RuleNotifier>,
    ) -> Self {
        Self {
            store,
            dids,
            locations,
            rules,
        }
    }

    /// Mark every lock of a file at a location as OK after a successful transfer.
    ///
    /// Idempotent: locks already OK are skipped, so a repeated report changes nothing.
    pub async fn successful_transfer(
        &self,
        scope: &str,
        name: &str,
        rse_id: RseId,
        mode: LockMode,
    ) -> Result<ReconcileSummary, LockError> {
        let mut tx = self.store.begin(mode).await?;
        match self.apply_success(tx.as_mut(), scope, name, rse_id).await {
            Ok(summary) => {
                tx.commit().await?;
                debug!(
                    scope = scope,
                    name = name,
                    rse_id = %rse_id,
                    locks = summary.locks_changed,
                    rules = summary.rules_changed,
                    "Successful transfer reconciled"
                );
                Ok(summary)
            }
            Err(e) => {
                abort(tx, "successful_transfer", scope, name, rse_id, &e).await;
                Err(e)
            }
        }
    }

    /// Mark the locks of a file at a location as STUCK after a failed transfer.
    ///
    /// At destinations that stage from tape only REPLICATING locks are
    /// reconsidered. Elsewhere an OK lock regresses to STUCK.
    pub async fn failed_transfer(
        &self,
        scope: &str,
        name: &str,
        rse_id: RseId,
        failure: &TransferFailure,
        mode: LockMode,
    ) -> Result<ReconcileSummary, LockError> {
        let staging_required =
            attribute_flag(self.locations.attribute(rse_id, STAGING_REQUIRED).await?.as_ref());

        let mut tx = self.store.begin(mode).await?;
        match self
            .apply_failure(tx.as_mut(), scope, name, rse_id, staging_required, failure)
            .await
        {
            Ok(summary) => {
                tx.commit().await?;
                debug!(
                    scope = scope,
                    name = name,
                    rse_id = %rse_id,
                    locks = summary.locks_changed,
                    rules = summary.rules_changed,
                    "Failed transfer reconciled"
                );
                Ok(summary)
            }
            Err(e) => {
                abort(tx, "failed_transfer", scope, name, rse_id, &e).await;
                Err(e)
            }
        }
    }

    async fn apply_success(
        &self,
        tx: &mut dyn LockTx,
        scope: &str,
        name: &str,
        rse_id: RseId,
    ) -> Result<ReconcileSummary, LockError> {
        let mut summary = ReconcileSummary::default();
        let locks = tx.replica_locks(scope, name, Some(&[rse_id]), None).await?;

        for mut lock in locks {
            if lock.state == LockState::Ok {
                continue;
            }
            debug!(
                scope = scope,
                name = name,
                rule_id = %lock.rule_id,
                rse_id = %rse_id,
                "Marking lock as OK"
            );

            let mut rule = locked_rule(tx, &lock).await?;
            debug!(rule_id = %rule.id, counters = %rule.counters(), "Updating rule counters");
            rule.shift_lock(lock.state, LockState::Ok);
            lock.state = LockState::Ok;
            tx.update_replica_lock_state(&lock).await?;
            summary.locks_changed += 1;
            debug!(rule_id = %rule.id, counters = %rule.counters(), "Finished updating rule counters");

            self.mark_collection_replicas(tx, &rule, rse_id).await?;

            let effect = if rule.state == RuleState::Suspended || rule.locks_stuck_cnt > 0 {
                SuccessEffect::Unchanged
            } else if rule.locks_replicating_cnt == 0 && rule.state == RuleState::Replicating {
                SuccessEffect::Completed
            } else if rule.state == RuleState::Replicating
                && rule.notification == RuleNotification::Progress
            {
                SuccessEffect::Progress
            } else {
                SuccessEffect::Unchanged
            };

            let replicating_before = rule.locks_replicating_cnt + 1;
            match effect {
                SuccessEffect::Completed => {
                    rule.state = RuleState::Ok;
                    summary.rules_changed += 1;
                    if rule.grouping.tracks_datasets() {
                        let flipped = tx.set_dataset_lock_states(rule.id, LockState::Ok).await?;
                        debug!(rule_id = %rule.id, dataset_locks = flipped, "Dataset locks marked OK");
                    }
                    tx.update_rule(&rule).await?;
                    info!(
                        rule_id = %rule.id,
                        did = %format!("{}:{}", rule.scope, rule.name),
                        counters = %rule.counters(),
                        "Rule replicated"
                    );

                    self.rules.notify(tx, &rule, replicating_before).await?;
                    if rule.notification == RuleNotification::Yes {
                        self.rules.notify_completion(tx, &rule).await?;
                    }
                    self.rules.release_parent_rule(tx, rule.id).await?;
                }
                SuccessEffect::Progress => {
                    tx.update_rule(&rule).await?;
                    self.rules.notify(tx, &rule, replicating_before).await?;
                }
                SuccessEffect::Unchanged => {
                    tx.update_rule(&rule).await?;
                }
            }

            self.rules.append_history(tx, &rule, true, false).await?;
        }

        Ok(summary)
    }

    async fn apply_failure(
        &self,
        tx: &mut dyn LockTx,
        scope: &str,
        name: &str,
        rse_id: RseId,
        staging_required: bool,
        failure: &TransferFailure,
    ) -> Result<ReconcileSummary, LockError> {
        let mut summary = ReconcileSummary::default();
        let state_filter = if staging_required {
            debug!(
                rse_id = %rse_id,
                "Destination requires staging, leaving OK replica locks untouched"
            );
            Some(LockState::Replicating)
        } else {
            None
        };
        let locks = tx
            .replica_locks(scope, name, Some(&[rse_id]), state_filter)
            .await?;

        for mut lock in locks {
            if lock.state == LockState::Stuck {
                continue;
            }
            debug!(
                scope = scope,
                name = name,
                rule_id = %lock.rule_id,
                rse_id = %rse_id,
                "Marking lock as STUCK"
            );

            let mut rule = locked_rule(tx, &lock).await?;
            debug!(rule_id = %rule.id, counters = %rule.counters(), "Updating rule counters");
            if lock.state == LockState::Ok {
                warn!(
                    scope = scope,
                    name = name,
                    rule_id = %rule.id,
                    rse_id = %rse_id,
                    "Failure report regresses an OK lock"
                );
            }
            rule.shift_lock(lock.state, LockState::Stuck);
            lock.state = LockState::Stuck;
            tx.update_replica_lock_state(&lock).await?;
            summary.locks_changed += 1;
            debug!(rule_id = %rule.id, counters = %rule.counters(), "Finished updating rule counters");

            if rule.state == RuleState::Suspended {
                // suspended rules wait for manual intervention
            } else if failure.broken_rule_id == Some(rule.id) {
                rule.state = RuleState::Suspended;
                rule.error = Some(truncate_error(failure.suspension_message()));
                summary.rules_changed += 1;
                if rule.grouping.tracks_datasets() {
                    tx.set_dataset_lock_states(rule.id, LockState::Stuck).await?;
                }
                info!(rule_id = %rule.id, error = ?rule.error, "Rule suspended");
            } else if rule.locks_stuck_cnt > 0 {
                if rule.state != RuleState::Stuck {
                    rule.state = RuleState::Stuck;
                    summary.rules_changed += 1;
                    if rule.grouping.tracks_datasets() {
                        tx.set_dataset_lock_states(rule.id, LockState::Stuck).await?;
                    }
                    info!(rule_id = %rule.id, counters = %rule.counters(), "Rule stuck");
                }
                if rule.error.as_deref() != Some(failure.error_message.as_str()) {
                    rule.error = Some(truncate_error(&failure.error_message));
                }
            }

            tx.update_rule(&rule).await?;
            self.rules.append_history(tx, &rule, true, false).await?;
        }

        Ok(summary)
    }

    /// Tell the collection-replica sweep which datasets changed at `rse_id`
    async fn mark_collection_replicas(
        &self,
        tx: &mut dyn LockTx,
        rule: &ReplicationRule,
        rse_id: RseId,
    ) -> Result<(), LockError> {
        match rule.did_type {
            DidType::Dataset => {
                tx.insert_updated_collection_replica(&UpdatedCollectionReplica {
                    scope: rule.scope.clone(),
                    name: rule.name.clone(),
                    did_type: DidType::Dataset,
                    rse_id,
                })
                .await?;
            }
            DidType::Container => {
                for dataset in self.dids.child_datasets(&rule.scope, &rule.name).await? {
                    tx.insert_updated_collection_replica(&UpdatedCollectionReplica {
                        scope: dataset.scope,
                        name: dataset.name,
                        did_type: DidType::Dataset,
                        rse_id,
                    })
                    .await?;
                }
            }
            DidType::File => {}
        }
        Ok(())
    }
}

/// Lock the rule owning `lock`; its absence is an integrity fault
async fn locked_rule(
    tx: &mut dyn LockTx,
    lock: &ReplicaLock,
) -> Result<ReplicationRule, LockError> {
    tx.rule_for_update(lock.rule_id).await?.ok_or_else(|| {
        LockError::Integrity(format!(
            "rule {} owning lock {}:{} at {} is missing",
            lock.rule_id, lock.scope, lock.name, lock.rse_id
        ))
    })
}

async fn abort(
    tx: Box<dyn LockTx>,
    operation: &str,
    scope: &str,
    name: &str,
    rse_id: RseId,
    e: &LockError,
) {
    if matches!(e, LockError::Integrity(_)) {
        error!(
            operation = operation,
            scope = scope,
            name = name,
            rse_id = %rse_id,
            error = %e,
            "Lock integrity violation, rolling back"
        );
    } else {
        warn!(
            operation = operation,
            scope = scope,
            name = name,
            rse_id = %rse_id,
            code = e.code(),
            error = %e,
            "Reconciliation aborted"
        );
    }
    if let Err(rollback_err) = tx.rollback().await {
        warn!(operation = operation, error = %rollback_err, "Rollback failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suspension_message_falls_back_to_error() {
        let failure = TransferFailure::new("checksum mismatch");
        assert_eq!(failure.suspension_message(), "checksum mismatch");

        let failure = failure.broken(uuid::Uuid::new_v4(), "source lost");
        assert_eq!(failure.suspension_message(), "source lost");
    }
}
