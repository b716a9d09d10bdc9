//! Store configuration.

/// Configuration shared by all record stores in the engine.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Page size used when mapping store files. The effective file page size
    /// is rounded down to a whole number of records.
    pub page_size: usize,

    /// Whether to create store files that don't exist.
    pub create_if_missing: bool,

    /// Skip the forward free-list scan when rebuilding an id generator.
    /// Reclaimed ids are then lost until the next full rebuild, but recovery
    /// after a crash on a large store is much faster.
    pub rebuild_id_generators_fast: bool,

    /// Refuse all mutating operations at the counts service level.
    pub read_only: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            page_size: 8192,
            create_if_missing: true,
            rebuild_id_generators_fast: false,
            read_only: false,
        }
    }
}
