//! Transactional aggregate counters: live in-memory state, durable
//! snapshots, and the orchestration service tying them to the transaction
//! stream.

mod format;
mod keys;
mod legacy;
mod memory;
mod service;
mod snapshot;
mod statistics;

pub use format::{StatisticsCodec, StatisticsEntry, StatisticsRecord, STATISTICS_RECORD_SIZE};
pub use keys::CountsKey;
pub use legacy::{LegacyCountsTracker, MultiUpdater};
pub use memory::InMemoryCountsStore;
pub use service::{
    CountsSource, CountsStorageService, CountsUpdater, CountsVisitor, IndexStatsUpdater,
    TransactionIdSource, UpdaterHandle,
};
pub use snapshot::CountsSnapshot;
pub use statistics::StatisticsStore;
