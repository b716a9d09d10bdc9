//! Migration shim for running alongside an older counter implementation.
//!
//! While both implementations are live, every transaction's deltas are fanned
//! out to both through a [`MultiUpdater`], and reads are cross-checked entry
//! by entry. Any disagreement is fatal; a silent divergence would make the
//! migration unverifiable.

use crate::counts::service::CountsUpdater;

/// Read and write access to the older counter implementation.
pub trait LegacyCountsTracker: Send + Sync {
    fn node_count(&self, label_id: i32) -> i64;

    fn relationship_count(&self, start_label_id: i32, type_id: i32, end_label_id: i32) -> i64;

    /// (updates, size) pair for an index.
    fn index_updates_and_size(&self, label_id: i32, property_key_id: i32) -> (i64, i64);

    /// (unique, size) pair for an index sample.
    fn index_sample(&self, label_id: i32, property_key_id: i32) -> (i64, i64);

    /// Updater applying `tx_id` to the older implementation, or `None` when
    /// it has already seen the transaction.
    fn apply(&self, tx_id: u64) -> Option<Box<dyn CountsUpdater>>;
}

/// Fans every update out to a set of underlying updaters.
#[derive(Default)]
pub struct MultiUpdater {
    updaters: Vec<Box<dyn CountsUpdater>>,
}

impl MultiUpdater {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, updater: Box<dyn CountsUpdater>) {
        self.updaters.push(updater);
    }

    pub fn is_empty(&self) -> bool {
        self.updaters.is_empty()
    }
}

impl CountsUpdater for MultiUpdater {
    fn increment_node_count(&mut self, label_id: i32, delta: i64) {
        for updater in &mut self.updaters {
            updater.increment_node_count(label_id, delta);
        }
    }

    fn increment_relationship_count(
        &mut self,
        start_label_id: i32,
        type_id: i32,
        end_label_id: i32,
        delta: i64,
    ) {
        for updater in &mut self.updaters {
            updater.increment_relationship_count(start_label_id, type_id, end_label_id, delta);
        }
    }

    fn complete(&mut self) {
        for updater in &mut self.updaters {
            updater.complete();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    struct Recording {
        total: Arc<AtomicI64>,
        completed: Arc<AtomicI64>,
    }

    impl CountsUpdater for Recording {
        fn increment_node_count(&mut self, _label_id: i32, delta: i64) {
            self.total.fetch_add(delta, Ordering::SeqCst);
        }

        fn increment_relationship_count(&mut self, _: i32, _: i32, _: i32, delta: i64) {
            self.total.fetch_add(delta, Ordering::SeqCst);
        }

        fn complete(&mut self) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_fans_out_to_all_updaters() {
        let total = Arc::new(AtomicI64::new(0));
        let completed = Arc::new(AtomicI64::new(0));

        let mut multi = MultiUpdater::new();
        for _ in 0..3 {
            multi.push(Box::new(Recording {
                total: Arc::clone(&total),
                completed: Arc::clone(&completed),
            }));
        }

        multi.increment_node_count(1, 5);
        multi.increment_relationship_count(1, 2, 3, 2);
        multi.complete();

        assert_eq!(total.load(Ordering::SeqCst), 21);
        assert_eq!(completed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_empty_multi_updater_is_a_no_op() {
        let mut multi = MultiUpdater::new();
        assert!(multi.is_empty());
        multi.increment_node_count(1, 5);
        multi.complete();
    }
}
