//! Authoritative live counter state.

use crate::counts::keys::CountsKey;
use crate::counts::snapshot::CountsSnapshot;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tracing::debug;

struct Inner {
    counts: HashMap<CountsKey, Vec<i64>>,
    /// Every transaction id at or below this is considered applied.
    base_tx_id: u64,
    /// Transaction ids above the base that have been applied. Replay after
    /// partial recovery may arrive out of order, so a plain watermark is not
    /// enough.
    applied: HashSet<u64>,
    /// Highest transaction id applied so far.
    last_tx_id: u64,
}

impl Inner {
    fn add(&mut self, key: CountsKey, deltas: &[i64]) {
        let values = self
            .counts
            .entry(key)
            .or_insert_with(|| vec![0; key.arity()]);
        for (value, delta) in values.iter_mut().zip(deltas) {
            *value += delta;
        }
    }
}

/// Live mapping from counter key to value vector, with per-transaction
/// deduplication.
///
/// Snapshot production takes the same lock as updates, so no update is ever
/// visible in part in a snapshot.
pub struct InMemoryCountsStore {
    inner: RwLock<Inner>,
}

impl InMemoryCountsStore {
    /// Empty store considering every transaction up to `tx_id` applied.
    pub fn new(tx_id: u64) -> Self {
        Self {
            inner: RwLock::new(Inner {
                counts: HashMap::new(),
                base_tx_id: tx_id,
                applied: HashSet::new(),
                last_tx_id: tx_id,
            }),
        }
    }

    /// Store initialized from a durable snapshot.
    pub fn from_snapshot(snapshot: CountsSnapshot) -> Self {
        let (tx_id, counts) = snapshot.into_counts();
        Self {
            inner: RwLock::new(Inner {
                counts,
                base_tx_id: tx_id,
                applied: HashSet::new(),
                last_tx_id: tx_id,
            }),
        }
    }

    /// Current value vector for a key. A key never written is
    /// indistinguishable from a zero-valued one: both yield an all-zero
    /// vector of the key's arity.
    pub fn get(&self, key: &CountsKey) -> Vec<i64> {
        let inner = self.inner.read();
        inner
            .counts
            .get(key)
            .cloned()
            .unwrap_or_else(|| vec![0; key.arity()])
    }

    /// Additively apply deltas to one key, outside any transaction.
    /// Used by rebuild only.
    pub fn update(&self, key: CountsKey, deltas: &[i64]) {
        debug_assert_eq!(deltas.len(), key.arity());
        self.inner.write().add(key, deltas);
    }

    /// Additively apply a batch of deltas tagged with a transaction id.
    ///
    /// Idempotent: a transaction already applied is skipped and `false` is
    /// returned, so recovery replay can never double-count.
    pub fn update_all(&self, tx_id: u64, deltas: HashMap<CountsKey, Vec<i64>>) -> bool {
        let mut inner = self.inner.write();
        if tx_id <= inner.base_tx_id || inner.applied.contains(&tx_id) {
            debug!(tx_id, "transaction already applied to counts, skipping");
            return false;
        }
        for (key, delta) in deltas {
            inner.add(key, &delta);
        }
        inner.applied.insert(tx_id);
        // Ids contiguous with the base fold into it, keeping the set bounded
        // by the replay gap instead of the session length.
        let mut next = inner.base_tx_id + 1;
        while inner.applied.remove(&next) {
            inner.base_tx_id = next;
            next += 1;
        }
        if tx_id > inner.last_tx_id {
            inner.last_tx_id = tx_id;
        }
        true
    }

    /// Unconditionally overwrite a value vector. Used for index statistics
    /// and sample replacement rather than accumulation.
    pub fn replace(&self, key: CountsKey, values: Vec<i64>) {
        debug_assert_eq!(values.len(), key.arity());
        self.inner.write().counts.insert(key, values);
    }

    /// Add a delta to the updates component of an index statistics counter.
    pub fn increment_index_updates(&self, label_id: i32, property_key_id: i32, delta: i64) {
        self.inner.write().add(
            CountsKey::index_statistics(label_id, property_key_id),
            &[delta, 0],
        );
    }

    /// Whether a transaction id has already been applied.
    pub fn seen_tx(&self, tx_id: u64) -> bool {
        let inner = self.inner.read();
        tx_id <= inner.base_tx_id || inner.applied.contains(&tx_id)
    }

    /// Highest transaction id applied so far.
    pub fn last_tx_id(&self) -> u64 {
        self.inner.read().last_tx_id
    }

    /// Immutable copy of the full mapping stamped with the last applied
    /// transaction id.
    pub fn snapshot(&self) -> CountsSnapshot {
        let inner = self.inner.read();
        CountsSnapshot::new(inner.last_tx_id, inner.counts.clone())
    }

    /// Immutable copy of the full mapping stamped with the given transaction
    /// id.
    pub fn snapshot_at(&self, tx_id: u64) -> CountsSnapshot {
        let inner = self.inner.read();
        CountsSnapshot::new(tx_id, inner.counts.clone())
    }

    /// Visit all entries; order is unspecified.
    pub fn for_each(&self, mut visitor: impl FnMut(&CountsKey, &[i64])) {
        let inner = self.inner.read();
        for (key, values) in &inner.counts {
            visitor(key, values);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unseen_key_reads_as_zero() {
        let store = InMemoryCountsStore::new(0);
        assert_eq!(store.get(&CountsKey::node(9)), vec![0]);
        assert_eq!(store.get(&CountsKey::index_sample(1, 2)), vec![0, 0]);
    }

    #[test]
    fn test_increments_accumulate() {
        let store = InMemoryCountsStore::new(0);
        store.update(CountsKey::node(3), &[5]);
        store.update(CountsKey::node(3), &[-2]);
        assert_eq!(store.get(&CountsKey::node(3)), vec![3]);
    }

    #[test]
    fn test_update_all_is_idempotent() {
        let store = InMemoryCountsStore::new(0);
        let deltas: HashMap<_, _> = [(CountsKey::node(1), vec![10])].into_iter().collect();

        assert!(store.update_all(5, deltas.clone()));
        assert!(!store.update_all(5, deltas));
        assert_eq!(store.get(&CountsKey::node(1)), vec![10]);
        assert!(store.seen_tx(5));
        assert!(!store.seen_tx(6));
    }

    #[test]
    fn test_base_tx_id_covers_older_transactions() {
        let store = InMemoryCountsStore::new(40);
        assert!(store.seen_tx(40));
        assert!(store.seen_tx(12));
        let deltas: HashMap<_, _> = [(CountsKey::node(1), vec![1])].into_iter().collect();
        assert!(!store.update_all(40, deltas.clone()));
        assert!(store.update_all(41, deltas));
    }

    #[test]
    fn test_out_of_order_replay() {
        let store = InMemoryCountsStore::new(0);
        let deltas: HashMap<_, _> = [(CountsKey::node(1), vec![1])].into_iter().collect();

        assert!(store.update_all(3, deltas.clone()));
        assert!(store.update_all(2, deltas.clone()));
        assert!(!store.update_all(3, deltas));
        assert_eq!(store.get(&CountsKey::node(1)), vec![2]);
        assert_eq!(store.last_tx_id(), 3);
    }

    #[test]
    fn test_contiguous_applied_ids_fold_into_base() {
        let store = InMemoryCountsStore::new(0);
        let deltas: HashMap<_, _> = [(CountsKey::node(1), vec![1])].into_iter().collect();

        for tx_id in 1..=50u64 {
            assert!(store.update_all(tx_id, deltas.clone()));
        }
        {
            let inner = store.inner.read();
            assert_eq!(inner.base_tx_id, 50);
            assert!(inner.applied.is_empty());
        }

        // A gap keeps later ids in the set until it closes.
        assert!(store.update_all(52, deltas.clone()));
        assert_eq!(store.inner.read().base_tx_id, 50);
        assert!(store.update_all(51, deltas.clone()));
        {
            let inner = store.inner.read();
            assert_eq!(inner.base_tx_id, 52);
            assert!(inner.applied.is_empty());
        }

        // Folded ids are still deduplicated.
        assert!(!store.update_all(30, deltas.clone()));
        assert!(!store.update_all(52, deltas));
        assert_eq!(store.get(&CountsKey::node(1)), vec![52]);
    }

    #[test]
    fn test_replace_overwrites() {
        let store = InMemoryCountsStore::new(0);
        store.update(CountsKey::index_statistics(1, 2), &[5, 5]);
        store.replace(CountsKey::index_statistics(1, 2), vec![100, 7]);
        assert_eq!(store.get(&CountsKey::index_statistics(1, 2)), vec![100, 7]);
    }

    #[test]
    fn test_increment_index_updates_only_touches_first_value() {
        let store = InMemoryCountsStore::new(0);
        store.replace(CountsKey::index_statistics(1, 2), vec![10, 50]);
        store.increment_index_updates(1, 2, 3);
        assert_eq!(store.get(&CountsKey::index_statistics(1, 2)), vec![13, 50]);
    }

    #[test]
    fn test_snapshot_carries_tx_id_and_contents() {
        let store = InMemoryCountsStore::new(7);
        let deltas: HashMap<_, _> = [(CountsKey::node(1), vec![4])].into_iter().collect();
        store.update_all(9, deltas);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.tx_id(), 9);
        assert_eq!(snapshot.get(&CountsKey::node(1)), Some(&[4][..]));

        let snapshot = store.snapshot_at(42);
        assert_eq!(snapshot.tx_id(), 42);
    }

    #[test]
    fn test_for_each_visits_everything() {
        let store = InMemoryCountsStore::new(0);
        store.update(CountsKey::node(1), &[1]);
        store.update(CountsKey::relationship(1, 2, 3), &[2]);
        let mut n = 0;
        store.for_each(|_, _| n += 1);
        assert_eq!(n, 2);
    }
}
