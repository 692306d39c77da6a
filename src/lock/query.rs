//! Lock Query Service
//!
//! Read paths over lock rows. Dataset-lock reads are lazy keyset-paged
//! streams; every call starts a fresh scan, so a consumer can restart by
//! calling again. Reads that take row locks run inside a caller-supplied
//! [`LockTx`] and inherit its [`LockMode`].

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tracing::debug;

use super::adapters::{DidResolver, LocationDirectory};
use super::error::LockError;
use super::state::DidType;
use super::store::{DatasetLockKey, DatasetLockScan, FileLocks, LockStore, LockTx};
use super::types::{
    DatasetLockInfo, Did, DidRef, FileLockFilter, LockMode, ReplicaLock, ReplicaLockInfo, RseId,
    RuleId, RuleLocation,
};

/// Rows fetched per round trip when streaming dataset locks
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Stream of dataset locks with resolved location names
pub type DatasetLockStream = BoxStream<'static, Result<DatasetLockInfo, LockError>>;

enum ScanCursor {
    Start,
    After(DatasetLockKey),
    Done,
}

#[derive(Clone)]
pub struct LockQueryService {
    store: Arc<dyn LockStore>,
    dids: Arc<dyn DidResolver>,
    locations: Arc<dyn LocationDirectory>,
    batch_size: usize,
}

impl LockQueryService {
    pub fn new(
        store: Arc<dyn LockStore>,
        dids: Arc<dyn DidResolver>,
        locations: Arc<dyn LocationDirectory>,
    ) -> Self {
        Self {
            store,
            dids,
            locations,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Open a transaction for the locking reads
    pub async fn begin(&self, mode: LockMode) -> Result<Box<dyn LockTx>, LockError> {
        self.store.begin(mode).await
    }

    /// Dataset locks of one dataset
    pub fn dataset_locks(&self, scope: &str, name: &str) -> DatasetLockStream {
        self.scan(DatasetLockScan::Dataset(Did::new(scope, name)))
    }

    /// Dataset locks hosted at one location
    pub fn dataset_locks_by_location(&self, rse_id: RseId) -> DatasetLockStream {
        self.scan(DatasetLockScan::Location(rse_id))
    }

    /// Dataset locks of several datasets or containers.
    ///
    /// Containers are expanded one level into their child datasets. Unknown
    /// DIDs are skipped. The same lock may be yielded more than once when
    /// inputs overlap.
    pub fn dataset_locks_bulk(&self, dids: Vec<DidRef>) -> DatasetLockStream {
        let expander = self.clone();
        let scanner = self.clone();

        stream::iter(dids)
            .then(move |did| {
                let expander = expander.clone();
                async move { expander.expand(did).await }
            })
            .map_ok(move |datasets| {
                let scanner = scanner.clone();
                stream::iter(datasets)
                    .map(move |did| scanner.scan(DatasetLockScan::Dataset(did)))
                    .flatten()
            })
            .try_flatten()
            .boxed()
    }

    /// Lock and return the replica locks of a file, optionally restricted to locations
    pub async fn replica_locks(
        &self,
        tx: &mut dyn LockTx,
        scope: &str,
        name: &str,
        restrict_rses: Option<&[RseId]>,
    ) -> Result<Vec<ReplicaLock>, LockError> {
        tx.replica_locks(scope, name, restrict_rses, None).await
    }

    pub async fn replica_locks_for_rule(
        &self,
        rule_id: RuleId,
    ) -> Result<Vec<ReplicaLockInfo>, LockError> {
        let locks = self.store.replica_locks_for_rule(rule_id).await?;
        let mut infos = Vec::with_capacity(locks.len());
        for lock in locks {
            let rse = self.locations.name(lock.rse_id).await?;
            infos.push(ReplicaLockInfo { lock, rse });
        }
        Ok(infos)
    }

    /// Distinct locations hosting a lock of the rule
    pub async fn replica_locks_for_rule_by_location(
        &self,
        rule_id: RuleId,
    ) -> Result<Vec<RuleLocation>, LockError> {
        let rse_ids = self.store.rule_locations(rule_id).await?;
        let mut locations = Vec::with_capacity(rse_ids.len());
        for rse_id in rse_ids {
            let rse = self.locations.name(rse_id).await?;
            locations.push(RuleLocation { rse_id, rse });
        }
        Ok(locations)
    }

    /// Lock and return every current file of a dataset with its replica locks.
    ///
    /// Files without a matching lock map to an empty list. With a shard in
    /// the filter only the files hashing to that shard are returned.
    pub async fn files_and_replica_locks_of_dataset(
        &self,
        tx: &mut dyn LockTx,
        scope: &str,
        name: &str,
        filter: &FileLockFilter,
    ) -> Result<FileLocks, LockError> {
        let files = tx.files_and_replica_locks(scope, name, filter).await?;
        debug!(
            scope = scope,
            name = name,
            files = files.len(),
            only_stuck = filter.only_stuck,
            shard = ?filter.shard,
            "Fetched files and replica locks of dataset"
        );
        Ok(files)
    }

    fn scan(&self, scan: DatasetLockScan) -> DatasetLockStream {
        let store = self.store.clone();
        let locations = self.locations.clone();
        let limit = self.batch_size;

        stream::try_unfold(ScanCursor::Start, move |cursor| {
            let store = store.clone();
            let locations = locations.clone();
            let scan = scan.clone();
            async move {
                let after = match cursor {
                    ScanCursor::Done => return Ok(None),
                    ScanCursor::Start => None,
                    ScanCursor::After(key) => Some(key),
                };

                let page = store.dataset_locks_page(&scan, after.as_ref(), limit).await?;
                if page.is_empty() {
                    return Ok(None);
                }
                let next = match page.last() {
                    Some(last) if page.len() == limit => ScanCursor::After(last.key()),
                    _ => ScanCursor::Done,
                };

                let mut infos = Vec::with_capacity(page.len());
                for lock in page {
                    let rse = locations.name(lock.rse_id).await?;
                    infos.push(DatasetLockInfo { lock, rse });
                }
                Ok::<_, LockError>(Some((infos, next)))
            }
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, LockError>)))
        .try_flatten()
        .boxed()
    }

    /// Datasets an input DID stands for
    async fn expand(&self, did: DidRef) -> Result<Vec<Did>, LockError> {
        let did_type = match did.did_type {
            Some(did_type) => did_type,
            None => match self.dids.resolve(&did.scope, &did.name).await {
                Ok(did_type) => did_type,
                Err(LockError::NotFound(_)) => {
                    debug!(scope = %did.scope, name = %did.name, "Skipping unknown DID");
                    return Ok(Vec::new());
                }
                Err(e) => return Err(e),
            },
        };

        match did_type {
            DidType::Dataset => Ok(vec![Did::new(did.scope, did.name)]),
            DidType::Container => match self.dids.child_datasets(&did.scope, &did.name).await {
                Ok(datasets) => Ok(datasets),
                Err(LockError::NotFound(_)) => Ok(Vec::new()),
                Err(e) => Err(e),
            },
            DidType::File => Err(LockError::InvalidArgument(format!(
                "{}:{} is a file, expected a dataset or container",
                did.scope, did.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::memory::MemoryLockStore;
    use crate::lock::state::LockState;
    use crate::lock::types::DatasetLock;
    use uuid::Uuid;

    async fn service(store: &MemoryLockStore, batch_size: usize) -> LockQueryService {
        let store = Arc::new(store.clone());
        LockQueryService::new(store.clone(), store.clone(), store).with_batch_size(batch_size)
    }

    async fn seed_dataset_locks(store: &MemoryLockStore, dataset: &Did, count: usize) -> RseId {
        let rse_id = store.add_rse("SITE_A").await;
        store.add_did(dataset.clone(), DidType::Dataset).await;
        for _ in 0..count {
            store
                .insert_dataset_lock(DatasetLock {
                    scope: dataset.scope.clone(),
                    name: dataset.name.clone(),
                    rse_id,
                    rule_id: Uuid::new_v4(),
                    account: "root".to_string(),
                    state: LockState::Replicating,
                    length: Some(3),
                    bytes: Some(3_000),
                    accessed_at: None,
                })
                .await;
        }
        rse_id
    }

    #[tokio::test]
    async fn test_dataset_locks_stream_across_pages() {
        let store = MemoryLockStore::new();
        let dataset = Did::new("mc", "ds1");
        seed_dataset_locks(&store, &dataset, 7).await;
        let service = service(&store, 3).await;

        let locks: Vec<DatasetLockInfo> =
            service.dataset_locks("mc", "ds1").try_collect().await.unwrap();
        assert_eq!(locks.len(), 7);
        assert!(locks.iter().all(|l| l.rse == "SITE_A"));

        let mut rule_ids: Vec<RuleId> = locks.iter().map(|l| l.lock.rule_id).collect();
        rule_ids.sort();
        rule_ids.dedup();
        assert_eq!(rule_ids.len(), 7, "no lock yielded twice");
    }

    #[tokio::test]
    async fn test_dataset_locks_stream_is_restartable() {
        let store = MemoryLockStore::new();
        let dataset = Did::new("mc", "ds1");
        seed_dataset_locks(&store, &dataset, 4).await;
        let service = service(&store, 2).await;

        let first: Vec<_> = service.dataset_locks("mc", "ds1").try_collect().await.unwrap();
        let second: Vec<_> = service.dataset_locks("mc", "ds1").try_collect().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_dataset_locks_by_location() {
        let store = MemoryLockStore::new();
        let rse_a = seed_dataset_locks(&store, &Did::new("mc", "ds1"), 2).await;
        seed_dataset_locks(&store, &Did::new("mc", "ds2"), 3).await;
        let service = service(&store, 500).await;

        let locks: Vec<_> = service
            .dataset_locks_by_location(rse_a)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(locks.len(), 2);
        assert!(locks.iter().all(|l| l.lock.rse_id == rse_a));
    }

    #[tokio::test]
    async fn test_empty_dataset_yields_nothing() {
        let store = MemoryLockStore::new();
        let service = service(&store, 500).await;
        let locks: Vec<_> = service.dataset_locks("mc", "none").try_collect().await.unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_bulk_rejects_files() {
        let store = MemoryLockStore::new();
        store.add_did(Did::new("mc", "f1"), DidType::File).await;
        let service = service(&store, 500).await;

        let result: Result<Vec<_>, _> = service
            .dataset_locks_bulk(vec![DidRef {
                scope: "mc".to_string(),
                name: "f1".to_string(),
                did_type: None,
            }])
            .try_collect()
            .await;
        assert!(matches!(result, Err(LockError::InvalidArgument(_))));
    }
}
