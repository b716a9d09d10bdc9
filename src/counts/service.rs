//! Counter lifecycle and orchestration.
//!
//! Ties the in-memory counter state to the transaction stream and the
//! durable snapshot store. Lifecycle: [`open`] maps the snapshot store,
//! [`init`] loads the last persisted snapshot (or flags a rebuild),
//! [`start`] rebuilds from primary storage when needed, [`force`] persists
//! the current state at checkpoints, and [`shutdown`] does a final force and
//! closes the files.
//!
//! [`open`]: CountsStorageService::open
//! [`init`]: CountsStorageService::init
//! [`start`]: CountsStorageService::start
//! [`force`]: CountsStorageService::force
//! [`shutdown`]: CountsStorageService::shutdown

use crate::config::StoreConfig;
use crate::counts::keys::CountsKey;
use crate::counts::legacy::{LegacyCountsTracker, MultiUpdater};
use crate::counts::memory::InMemoryCountsStore;
use crate::counts::statistics::StatisticsStore;
use crate::error::{Result, StoreError};
use std::collections::HashMap;
use std::mem;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Where the last committed transaction id comes from.
pub trait TransactionIdSource: Send + Sync {
    fn last_committed_transaction_id(&self) -> u64;
}

/// Sink for count deltas. Deltas accumulate until [`complete`] applies them
/// as one unit.
///
/// [`complete`]: CountsUpdater::complete
pub trait CountsUpdater {
    fn increment_node_count(&mut self, label_id: i32, delta: i64);

    fn increment_relationship_count(
        &mut self,
        start_label_id: i32,
        type_id: i32,
        end_label_id: i32,
        delta: i64,
    );

    /// Apply the accumulated deltas. Later calls are no-ops.
    fn complete(&mut self);
}

/// Mutation interface for index statistics and samples, maintained outside
/// the transaction stream by index population and sampling.
pub trait IndexStatsUpdater {
    fn replace_index_update_and_size(
        &self,
        label_id: i32,
        property_key_id: i32,
        updates: i64,
        size: i64,
    );

    fn replace_index_sample(&self, label_id: i32, property_key_id: i32, unique: i64, size: i64);

    fn increment_index_updates(&self, label_id: i32, property_key_id: i32, delta: i64);
}

/// Receiver for a full dump of the counter state.
pub trait CountsVisitor {
    fn visit_node_count(&mut self, label_id: i32, count: i64);

    fn visit_relationship_count(
        &mut self,
        start_label_id: i32,
        type_id: i32,
        end_label_id: i32,
        count: i64,
    );

    fn visit_index_statistics(&mut self, label_id: i32, property_key_id: i32, updates: i64, size: i64);

    fn visit_index_sample(&mut self, label_id: i32, property_key_id: i32, unique: i64, size: i64);
}

/// Derives the counter state from primary storage. Used to rebuild counts
/// when no usable snapshot exists.
pub trait CountsSource {
    fn feed(&self, updater: &mut dyn CountsUpdater) -> Result<()>;
}

/// Accumulates deltas locally and applies them to the in-memory store on
/// completion, under the transaction id when there is one.
struct DeltaUpdater {
    memory: Arc<InMemoryCountsStore>,
    tx_id: Option<u64>,
    deltas: HashMap<CountsKey, Vec<i64>>,
    done: bool,
}

impl DeltaUpdater {
    fn new(memory: Arc<InMemoryCountsStore>, tx_id: Option<u64>) -> Self {
        Self {
            memory,
            tx_id,
            deltas: HashMap::new(),
            done: false,
        }
    }

    fn add(&mut self, key: CountsKey, delta: i64) {
        let values = self
            .deltas
            .entry(key)
            .or_insert_with(|| vec![0; key.arity()]);
        values[0] += delta;
    }
}

impl CountsUpdater for DeltaUpdater {
    fn increment_node_count(&mut self, label_id: i32, delta: i64) {
        self.add(CountsKey::node(label_id), delta);
    }

    fn increment_relationship_count(
        &mut self,
        start_label_id: i32,
        type_id: i32,
        end_label_id: i32,
        delta: i64,
    ) {
        self.add(
            CountsKey::relationship(start_label_id, type_id, end_label_id),
            delta,
        );
    }

    fn complete(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        let deltas = mem::take(&mut self.deltas);
        match self.tx_id {
            // An empty delta set still marks the transaction as applied.
            Some(tx_id) => {
                self.memory.update_all(tx_id, deltas);
            }
            None => {
                for (key, values) in deltas {
                    self.memory.update(key, &values);
                }
            }
        }
    }
}

/// Updater handed out per transaction. May be a no-op (transaction already
/// counted) or fan out to a legacy tracker during migration. Dropping the
/// handle completes it.
pub struct UpdaterHandle {
    inner: MultiUpdater,
}

impl UpdaterHandle {
    fn no_op() -> Self {
        Self {
            inner: MultiUpdater::new(),
        }
    }

    /// False when every update through this handle is discarded.
    pub fn is_applying(&self) -> bool {
        !self.inner.is_empty()
    }
}

impl CountsUpdater for UpdaterHandle {
    fn increment_node_count(&mut self, label_id: i32, delta: i64) {
        self.inner.increment_node_count(label_id, delta);
    }

    fn increment_relationship_count(
        &mut self,
        start_label_id: i32,
        type_id: i32,
        end_label_id: i32,
        delta: i64,
    ) {
        self.inner
            .increment_relationship_count(start_label_id, type_id, end_label_id, delta);
    }

    fn complete(&mut self) {
        self.inner.complete();
    }
}

impl Drop for UpdaterHandle {
    fn drop(&mut self) {
        self.inner.complete();
    }
}

/// The counter subsystem: live state, snapshot persistence, rebuild, and the
/// per-transaction updater factory.
pub struct CountsStorageService {
    statistics: StatisticsStore,
    memory: Arc<InMemoryCountsStore>,
    tx_ids: Arc<dyn TransactionIdSource>,
    legacy: Option<Arc<dyn LegacyCountsTracker>>,
    read_only: bool,
    needs_rebuild: bool,
}

impl CountsStorageService {
    /// Map the snapshot store. The service is unusable until [`init`] runs.
    ///
    /// [`init`]: Self::init
    pub fn open(
        path: impl AsRef<Path>,
        config: StoreConfig,
        tx_ids: Arc<dyn TransactionIdSource>,
    ) -> Result<Self> {
        let read_only = config.read_only;
        let statistics = StatisticsStore::open(path, config)?;
        Ok(Self {
            statistics,
            memory: Arc::new(InMemoryCountsStore::new(0)),
            tx_ids,
            legacy: None,
            read_only,
            needs_rebuild: false,
        })
    }

    /// Run alongside a legacy tracker: writes fan out to it and reads are
    /// cross-checked against it.
    pub fn with_legacy_tracker(mut self, tracker: Arc<dyn LegacyCountsTracker>) -> Self {
        self.legacy = Some(tracker);
        self
    }

    /// Load the persisted snapshot into memory, or flag a rebuild when the
    /// store holds no usable one.
    pub fn init(&mut self) -> Result<()> {
        match self.statistics.read_snapshot()? {
            Some(snapshot) => {
                info!(
                    tx_id = snapshot.tx_id(),
                    entries = snapshot.len(),
                    "counts initialized from snapshot"
                );
                self.memory = Arc::new(InMemoryCountsStore::from_snapshot(snapshot));
            }
            None => {
                info!("no usable counts snapshot, rebuild required");
                self.needs_rebuild = true;
            }
        }
        Ok(())
    }

    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild
    }

    /// Rebuild the counter state from primary storage if [`init`] found no
    /// snapshot. Runs after recovery, so the rebuilt state is stamped with
    /// the last committed transaction id.
    ///
    /// [`init`]: Self::init
    pub fn start(&mut self, source: &dyn CountsSource) -> Result<()> {
        if !self.needs_rebuild {
            return Ok(());
        }
        let tx_id = self.tx_ids.last_committed_transaction_id();
        info!(tx_id, "rebuilding counts from primary storage");
        self.memory = Arc::new(InMemoryCountsStore::new(tx_id));
        let mut updater = DeltaUpdater::new(Arc::clone(&self.memory), None);
        source.feed(&mut updater)?;
        updater.complete();
        self.needs_rebuild = false;
        Ok(())
    }

    /// Updater applying `tx_id`'s deltas. A transaction the store has
    /// already counted gets a no-op handle, so recovery replay cannot
    /// double-count.
    pub fn new_transactional_updater(&self, tx_id: u64) -> Result<UpdaterHandle> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        if self.memory.seen_tx(tx_id) {
            debug!(tx_id, "transaction already counted, handing out no-op updater");
            return Ok(UpdaterHandle::no_op());
        }
        let mut inner = MultiUpdater::new();
        inner.push(Box::new(DeltaUpdater::new(
            Arc::clone(&self.memory),
            Some(tx_id),
        )));
        if let Some(legacy) = &self.legacy {
            if let Some(updater) = legacy.apply(tx_id) {
                inner.push(updater);
            }
        }
        Ok(UpdaterHandle { inner })
    }

    /// Updater applying deltas outside any transaction, with no
    /// deduplication.
    pub fn new_non_transactional_updater(&self) -> Result<UpdaterHandle> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        let mut inner = MultiUpdater::new();
        inner.push(Box::new(DeltaUpdater::new(Arc::clone(&self.memory), None)));
        Ok(UpdaterHandle { inner })
    }

    /// Persist the current state, stamped with the last committed
    /// transaction id. Skipped while a rebuild is pending; there is nothing
    /// trustworthy to write.
    pub fn force(&mut self) -> Result<()> {
        if self.read_only {
            debug!("read-only counts store, skipping snapshot");
            return Ok(());
        }
        if self.needs_rebuild {
            debug!("counts awaiting rebuild, skipping snapshot");
            return Ok(());
        }
        let snapshot = self
            .memory
            .snapshot_at(self.tx_ids.last_committed_transaction_id());
        self.statistics.write(&snapshot)
    }

    fn check_single(&self, key: CountsKey, count: i64, expected: Option<i64>) -> Result<i64> {
        if let Some(expected) = expected {
            if expected != count {
                return Err(StoreError::CountsMismatch {
                    context: format!("{:?}", key),
                    legacy: (expected, 0),
                    current: (count, 0),
                });
            }
        }
        Ok(count)
    }

    fn check_pair(
        &self,
        key: CountsKey,
        pair: (i64, i64),
        expected: Option<(i64, i64)>,
    ) -> Result<(i64, i64)> {
        if let Some(expected) = expected {
            if expected != pair {
                return Err(StoreError::CountsMismatch {
                    context: format!("{:?}", key),
                    legacy: expected,
                    current: pair,
                });
            }
        }
        Ok(pair)
    }

    pub fn node_count(&self, label_id: i32) -> Result<i64> {
        let key = CountsKey::node(label_id);
        let count = self.memory.get(&key)[0];
        let expected = self.legacy.as_ref().map(|l| l.node_count(label_id));
        self.check_single(key, count, expected)
    }

    pub fn relationship_count(
        &self,
        start_label_id: i32,
        type_id: i32,
        end_label_id: i32,
    ) -> Result<i64> {
        let key = CountsKey::relationship(start_label_id, type_id, end_label_id);
        let count = self.memory.get(&key)[0];
        let expected = self
            .legacy
            .as_ref()
            .map(|l| l.relationship_count(start_label_id, type_id, end_label_id));
        self.check_single(key, count, expected)
    }

    /// (updates, size) pair for an index.
    pub fn index_updates_and_size(&self, label_id: i32, property_key_id: i32) -> Result<(i64, i64)> {
        let key = CountsKey::index_statistics(label_id, property_key_id);
        let values = self.memory.get(&key);
        let expected = self
            .legacy
            .as_ref()
            .map(|l| l.index_updates_and_size(label_id, property_key_id));
        self.check_pair(key, (values[0], values[1]), expected)
    }

    /// (unique, size) pair for an index sample.
    pub fn index_sample(&self, label_id: i32, property_key_id: i32) -> Result<(i64, i64)> {
        let key = CountsKey::index_sample(label_id, property_key_id);
        let values = self.memory.get(&key);
        let expected = self
            .legacy
            .as_ref()
            .map(|l| l.index_sample(label_id, property_key_id));
        self.check_pair(key, (values[0], values[1]), expected)
    }

    /// Dump every counter to `visitor`; order is unspecified.
    pub fn accept(&self, visitor: &mut dyn CountsVisitor) {
        self.memory.for_each(|key, values| match *key {
            CountsKey::EntityNode { label_id } => visitor.visit_node_count(label_id, values[0]),
            CountsKey::EntityRelationship {
                start_label_id,
                type_id,
                end_label_id,
            } => visitor.visit_relationship_count(start_label_id, type_id, end_label_id, values[0]),
            CountsKey::IndexStatistics {
                label_id,
                property_key_id,
            } => visitor.visit_index_statistics(label_id, property_key_id, values[0], values[1]),
            CountsKey::IndexSample {
                label_id,
                property_key_id,
            } => visitor.visit_index_sample(label_id, property_key_id, values[0], values[1]),
        });
    }

    /// Highest transaction id applied to the counter state.
    pub fn last_tx_id(&self) -> u64 {
        self.memory.last_tx_id()
    }

    /// Final snapshot and close. The service is unusable afterwards.
    pub fn shutdown(&mut self) -> Result<()> {
        if !self.read_only && !self.needs_rebuild {
            self.force()?;
        }
        self.statistics.close()
    }
}

impl IndexStatsUpdater for CountsStorageService {
    fn replace_index_update_and_size(
        &self,
        label_id: i32,
        property_key_id: i32,
        updates: i64,
        size: i64,
    ) {
        if self.read_only {
            return;
        }
        self.memory.replace(
            CountsKey::index_statistics(label_id, property_key_id),
            vec![updates, size],
        );
    }

    fn replace_index_sample(&self, label_id: i32, property_key_id: i32, unique: i64, size: i64) {
        if self.read_only {
            return;
        }
        self.memory.replace(
            CountsKey::index_sample(label_id, property_key_id),
            vec![unique, size],
        );
    }

    fn increment_index_updates(&self, label_id: i32, property_key_id: i32, delta: i64) {
        if self.read_only {
            return;
        }
        self.memory
            .increment_index_updates(label_id, property_key_id, delta);
    }
}
