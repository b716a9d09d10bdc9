//! # Tallystore
//!
//! Crash-consistent fixed-size record storage with a transactional
//! aggregate-counter subsystem built on top of it.
//!
//! ## Core Concepts
//!
//! - **Record stores**: Fixed-size records mapped onto pages, addressed by
//!   id, read under an optimistic-retry protocol
//! - **Id generators**: Free-list backed id allocation that detects unclean
//!   shutdown and rebuilds itself from a store scan
//! - **Counts**: Live aggregate counters keyed by entity labels and index
//!   descriptors, deduplicated per transaction
//! - **Snapshots**: Full-rewrite persistence of the counter state, stamped
//!   with the transaction id it is consistent with
//!
//! ## Example
//!
//! ```ignore
//! use tallystore::{CountsStorageService, CountsUpdater, StoreConfig};
//!
//! let mut counts = CountsStorageService::open("./counts.db", StoreConfig::default(), tx_ids)?;
//! counts.init()?;
//! if counts.needs_rebuild() {
//!     counts.start(&primary_store)?;
//! }
//!
//! // Apply a transaction's deltas
//! let mut updater = counts.new_transactional_updater(tx_id)?;
//! updater.increment_node_count(label_id, 1);
//! updater.complete();
//!
//! // Checkpoint
//! counts.force()?;
//! ```

pub mod config;
pub mod counts;
pub mod error;
pub mod ids;
pub mod paging;
pub mod records;

// Re-exports
pub use config::StoreConfig;
pub use counts::{
    CountsKey, CountsSnapshot, CountsSource, CountsStorageService, CountsUpdater, CountsVisitor,
    InMemoryCountsStore, IndexStatsUpdater, LegacyCountsTracker, MultiUpdater, StatisticsStore,
    TransactionIdSource, UpdaterHandle,
};
pub use error::{Result, StoreError};
pub use ids::IdGenerator;
pub use paging::{LockMode, PageCursor, PagedFile};
pub use records::{RecordCodec, RecordLoad, RecordStore, StoreRecord};
