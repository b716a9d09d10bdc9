//! Durable counter snapshots on top of the record store.
//!
//! Persistence is full-rewrite: a snapshot is written by truncating the
//! backing store and writing every entry fresh, with record 0 holding the
//! snapshot's transaction id under a reserved sentinel key. A store whose
//! record 0 is absent or not in use holds no usable snapshot, which is how a
//! rewrite torn by a crash is detected.

use crate::config::StoreConfig;
use crate::counts::format::{StatisticsCodec, StatisticsRecord};
use crate::counts::keys::CountsKey;
use crate::counts::snapshot::CountsSnapshot;
use crate::error::{Result, StoreError};
use crate::records::{RecordLoad, RecordStore, StoreRecord};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Sentinel key for record 0. The label id is outside the range any real
/// token registry hands out.
const LAST_APPLIED_TX_LABEL: i32 = -42;

fn last_applied_tx_key() -> CountsKey {
    CountsKey::node(LAST_APPLIED_TX_LABEL)
}

/// Snapshot persistence for the counter state.
pub struct StatisticsStore {
    store: RecordStore<StatisticsCodec>,
}

impl StatisticsStore {
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        Ok(Self {
            store: RecordStore::open(path, StatisticsCodec, config)?,
        })
    }

    /// Replace the entire persisted state with `snapshot`.
    ///
    /// Record 0 carries the snapshot's transaction id and is written first;
    /// readers treat its absence as "no snapshot". A crash before record 0
    /// reaches disk therefore loses the snapshot entirely rather than
    /// surfacing a stale one; a crash later in the rewrite can still leave a
    /// snapshot missing some of its entries.
    pub fn write(&mut self, snapshot: &CountsSnapshot) -> Result<()> {
        debug!(
            store = %self.store.path().display(),
            tx_id = snapshot.tx_id(),
            entries = snapshot.len(),
            "persisting counts snapshot"
        );
        self.store.truncate_and_reopen()?;

        let id = self.store.next_id()?;
        let tx_record = StatisticsRecord::for_write(
            id,
            last_applied_tx_key(),
            vec![snapshot.tx_id() as i64],
        )?;
        self.store.update_record(&tx_record)?;

        for (key, values) in snapshot.iter() {
            let id = self.store.next_id()?;
            let record = StatisticsRecord::for_write(id, *key, values.clone())?;
            self.store.update_record(&record)?;
        }
        self.store.flush()
    }

    /// Read the persisted snapshot, or `None` when the store holds no usable
    /// one (never written, or a rewrite did not complete).
    pub fn read_snapshot(&self) -> Result<Option<CountsSnapshot>> {
        if !self.store.is_in_use(0)? {
            return Ok(None);
        }
        let tx_record = self.store.get_record(0, RecordLoad::Normal)?;
        let entry = tx_record
            .entry()
            .ok_or_else(|| StoreError::Corruption("transaction id record has no entry".into()))?;
        if entry.key != last_applied_tx_key() {
            return Err(StoreError::Corruption(format!(
                "record 0 holds {:?} instead of the transaction id marker",
                entry.key
            )));
        }
        let tx_id = entry.values[0] as u64;

        let mut counts = HashMap::new();
        for id in 1..self.store.high_id()? {
            let record = self.store.get_record(id, RecordLoad::Check)?;
            if !record.in_use() {
                continue;
            }
            if let Some(entry) = record.entry() {
                counts.insert(entry.key, entry.values.clone());
            }
        }
        Ok(Some(CountsSnapshot::new(tx_id, counts)))
    }

    pub fn is_store_ok(&self) -> bool {
        self.store.is_store_ok()
    }

    pub fn make_store_ok(&mut self) -> Result<()> {
        self.store.make_store_ok()
    }

    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }

    pub fn close(&mut self) -> Result<()> {
        self.store.close()
    }
}
