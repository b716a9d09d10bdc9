//! Point-in-time copies of the full counter state.

use crate::counts::keys::CountsKey;
use std::collections::HashMap;

/// Immutable pairing of a transaction id and the complete counter mapping as
/// of applying transactions up to and including that id.
#[derive(Clone, Debug)]
pub struct CountsSnapshot {
    tx_id: u64,
    counts: HashMap<CountsKey, Vec<i64>>,
}

impl CountsSnapshot {
    pub fn new(tx_id: u64, counts: HashMap<CountsKey, Vec<i64>>) -> Self {
        Self { tx_id, counts }
    }

    /// Transaction id this snapshot is consistent with.
    pub fn tx_id(&self) -> u64 {
        self.tx_id
    }

    /// Value vector for a key, if present in the snapshot.
    pub fn get(&self, key: &CountsKey) -> Option<&[i64]> {
        self.counts.get(key).map(|v| v.as_slice())
    }

    /// Number of distinct counter keys.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Iterate all entries; order is unspecified.
    pub fn iter(&self) -> impl Iterator<Item = (&CountsKey, &Vec<i64>)> {
        self.counts.iter()
    }

    pub(crate) fn into_counts(self) -> (u64, HashMap<CountsKey, Vec<i64>>) {
        (self.tx_id, self.counts)
    }
}
