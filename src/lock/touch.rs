//! Lock Touch Service
//!
//! Records dataset access and refreshes rule expiry. Each item commits on
//! its own; a storage failure stops the batch but leaves earlier items
//! applied.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::adapters::RetentionPolicy;
use super::error::LockError;
use super::store::{LockStore, LockTx};
use super::types::{LockMode, TouchRequest};

pub struct LockTouchService {
    store: Arc<dyn LockStore>,
    retention: Arc<dyn RetentionPolicy>,
}

impl LockTouchService {
    pub fn new(store: Arc<dyn LockStore>, retention: Arc<dyn RetentionPolicy>) -> Self {
        Self { store, retention }
    }

    /// Touch a batch of dataset locks.
    ///
    /// Returns `Ok(false)` when a storage error aborted the batch part way.
    /// Errors of the retention policy are returned as is.
    pub async fn touch(&self, requests: &[TouchRequest]) -> Result<bool, LockError> {
        let now = Utc::now();

        for (idx, request) in requests.iter().enumerate() {
            let eol_at = self
                .retention
                .end_of_life(&request.scope, &request.name, &[request.rse_id])
                .await?;
            let accessed_at = request.accessed_at.unwrap_or(now);

            if let Err(e) = self.touch_one(request, accessed_at, eol_at).await {
                warn!(
                    scope = %request.scope,
                    name = %request.name,
                    rse_id = %request.rse_id,
                    applied = idx,
                    remaining = requests.len() - idx,
                    error = %e,
                    "Dataset lock touch failed, aborting batch"
                );
                return Ok(false);
            }
        }

        debug!(count = requests.len(), "Dataset locks touched");
        Ok(true)
    }

    async fn touch_one(
        &self,
        request: &TouchRequest,
        accessed_at: DateTime<Utc>,
        eol_at: Option<DateTime<Utc>>,
    ) -> Result<(), LockError> {
        let mut tx = self.store.begin(LockMode::Blocking).await?;
        match apply(tx.as_mut(), request, accessed_at, eol_at).await {
            Ok(()) => tx.commit().await,
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                Err(e)
            }
        }
    }
}

async fn apply(
    tx: &mut dyn LockTx,
    request: &TouchRequest,
    accessed_at: DateTime<Utc>,
    eol_at: Option<DateTime<Utc>>,
) -> Result<(), LockError> {
    // rule rows in id order before dataset-lock rows, as the reconciler locks them
    let mut rule_ids = tx
        .dataset_lock_rule_ids(&request.scope, &request.name, request.rse_id)
        .await?;
    rule_ids.sort();
    for rule_id in &rule_ids {
        tx.set_rule_eol(*rule_id, eol_at).await?;
    }

    let touched = tx
        .set_dataset_lock_accessed_at(&request.scope, &request.name, request.rse_id, accessed_at)
        .await?;

    debug!(
        scope = %request.scope,
        name = %request.name,
        rse_id = %request.rse_id,
        dataset_locks = touched,
        rules = rule_ids.len(),
        eol_at = ?eol_at,
        "Dataset lock touched"
    );
    Ok(())
}
