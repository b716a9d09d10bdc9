//! Paged record store.
//!
//! Maps a fixed-size record layout onto pages of a [`PagedFile`], owns the
//! store's [`IdGenerator`] and file lifecycle, and provides id-indexed
//! get/update/scan under the optimistic-retry read protocol.

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::ids::IdGenerator;
use crate::paging::{LockMode, PageCursor, PagedFile};
use crate::records::codec::{RecordCodec, RecordLoad, StoreRecord};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Durable, id-addressed fixed-size record storage with optimistic
/// concurrent reads.
///
/// A store opened after an unclean shutdown comes up in a "not ok" state:
/// reads work, but id allocation is refused until [`make_store_ok`]
/// (which must only run after crash recovery has replayed outstanding
/// transactions) rebuilds the id generator from a scan.
///
/// [`make_store_ok`]: RecordStore::make_store_ok
pub struct RecordStore<C: RecordCodec> {
    path: PathBuf,
    id_path: PathBuf,
    config: StoreConfig,
    codec: C,
    store_file: Option<PagedFile>,
    id_generator: Option<IdGenerator>,
    store_ok: bool,
    not_ok_cause: Option<String>,
}

impl<C: RecordCodec> RecordStore<C> {
    /// Map the backing paged file and open the id generator.
    ///
    /// A missing file is created when the config requests it, otherwise the
    /// open fails with [`StoreError::StoreNotFound`]. An id file that fails
    /// validation leaves the store open but "not ok".
    pub fn open(path: impl AsRef<Path>, codec: C, config: StoreConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let id_path = PathBuf::from(format!("{}.id", path.display()));

        let record_size = codec.record_size();
        if record_size == 0 {
            return Err(StoreError::InvalidFormat("record size must be non-zero".into()));
        }
        let file_page_size = config.page_size - config.page_size % record_size;
        if file_page_size == 0 {
            return Err(StoreError::InvalidFormat(format!(
                "record size {} exceeds page size {}",
                record_size, config.page_size
            )));
        }

        let newly_created = !path.exists();
        if newly_created && !config.create_if_missing {
            return Err(StoreError::StoreNotFound(path));
        }

        let store_file = PagedFile::map(&path, file_page_size, config.create_if_missing)?;

        let mut store = Self {
            path,
            id_path,
            config,
            codec,
            store_file: Some(store_file),
            id_generator: None,
            store_ok: true,
            not_ok_cause: None,
        };

        if newly_created {
            store.initialize_new_store_file()?;
        }

        match IdGenerator::open(&store.id_path) {
            Ok(ids) => {
                store.id_generator = Some(ids);
                let high = store.scan_for_high_id()?;
                store.set_high_id(high);
            }
            Err(cause @ (StoreError::InvalidIdGenerator(_) | StoreError::ChecksumMismatch { .. })) => {
                warn!(
                    store = %store.path.display(),
                    %cause,
                    "id generator unusable, store requires rebuild"
                );
                store.store_ok = false;
                store.not_ok_cause = Some(cause.to_string());
            }
            Err(e) => return Err(e),
        }

        Ok(store)
    }

    fn initialize_new_store_file(&mut self) -> Result<()> {
        if self.codec.reserved_low_ids() > 0 {
            let file = self.store_file()?;
            let mut cursor = file.io(0, LockMode::Write);
            if cursor.next()? {
                loop {
                    cursor.set_offset(0);
                    self.codec.write_header(&mut cursor)?;
                    if !cursor.should_retry()? {
                        break;
                    }
                }
            }
        }
        IdGenerator::create(&self.id_path, self.codec.reserved_low_ids())?;
        Ok(())
    }

    fn store_file(&self) -> Result<&PagedFile> {
        self.store_file.as_ref().ok_or(StoreError::Closed)
    }

    fn check_store_ok(&self) -> Result<()> {
        if self.store_ok {
            Ok(())
        } else {
            Err(StoreError::StoreNotOk(
                self.not_ok_cause.clone().unwrap_or_else(|| "unknown cause".into()),
            ))
        }
    }

    /// Whether the store needs [`make_store_ok`](Self::make_store_ok) before
    /// it can allocate ids.
    pub fn is_store_ok(&self) -> bool {
        self.store_ok
    }

    /// Path of the backing store file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialized record size.
    pub fn record_size(&self) -> usize {
        self.codec.record_size()
    }

    fn records_per_page(&self) -> Result<usize> {
        Ok(self.store_file()?.page_size() / self.codec.record_size())
    }

    fn page_id_for_record(&self, id: u64) -> Result<u64> {
        Ok(id / self.records_per_page()? as u64)
    }

    fn offset_for_id(&self, id: u64) -> Result<usize> {
        Ok((id % self.records_per_page()? as u64) as usize * self.codec.record_size())
    }

    /// Allocate a record id. Refused while the store is not ok.
    pub fn next_id(&self) -> Result<u64> {
        self.check_store_ok()?;
        let ids = self
            .id_generator
            .as_ref()
            .ok_or_else(|| StoreError::StoreNotOk("id generator not open".into()))?;
        Ok(ids.next_id())
    }

    /// Return an id for reuse. A no-op while the id generator is unavailable;
    /// records deleted during recovery replay are reclaimed by the rebuild.
    pub fn free_id(&self, id: u64) {
        if let Some(ids) = &self.id_generator {
            ids.free_id(id);
        }
    }

    /// Exclusive upper bound of valid ids. Falls back to a backward scan when
    /// the id generator is unavailable.
    pub fn high_id(&self) -> Result<u64> {
        match &self.id_generator {
            Some(ids) => Ok(ids.high_id()),
            None => self.scan_for_high_id(),
        }
    }

    /// Raise the high id; lowering is a no-op. Ignored while the id generator
    /// is unavailable, rebuild recomputes it afterwards.
    pub fn set_high_id(&self, high_id: u64) {
        if let Some(ids) = &self.id_generator {
            ids.set_high_id(high_id);
        }
    }

    /// Highest id that could currently be in use.
    pub fn highest_possible_id_in_use(&self) -> Result<u64> {
        match &self.id_generator {
            Some(ids) => Ok(ids.highest_possible_id_in_use()),
            None => Ok(self.scan_for_high_id()?.saturating_sub(1)),
        }
    }

    /// Read the record at `id` under the load strictness of `mode`.
    ///
    /// An id beyond anything ever written yields a cleared record stamped
    /// with the requested id (which `Normal` then rejects).
    pub fn get_record(&self, id: u64, mode: RecordLoad) -> Result<C::Record> {
        let file = self.store_file()?;
        let page_id = self.page_id_for_record(id)?;
        let mut record = self.codec.new_record(id);
        let mut cursor = file.io(page_id, LockMode::Read);
        if cursor.next_to(page_id)? {
            self.read_with_retry(&mut cursor, id, &mut record, mode)?;
        } else {
            record.set_id(id);
            record.clear();
            mode.verify(&record)?;
        }
        Ok(record)
    }

    /// Read one record through an already positioned cursor, redoing the copy
    /// while the paged file reports concurrent modification. A decode error
    /// on a copy that must be retried anyway is a torn read, not corruption.
    fn read_with_retry(
        &self,
        cursor: &mut PageCursor<'_>,
        id: u64,
        record: &mut C::Record,
        mode: RecordLoad,
    ) -> Result<()> {
        let offset = self.offset_for_id(id)?;
        record.set_id(id);
        loop {
            record.set_in_use(false);
            cursor.set_offset(offset);
            match self.codec.read(cursor, record, mode) {
                Ok(()) => {
                    if !cursor.should_retry()? {
                        break;
                    }
                }
                Err(e) => {
                    if !cursor.should_retry()? {
                        return Err(e);
                    }
                }
            }
        }
        if !mode.verify(record)? {
            record.clear();
        }
        Ok(())
    }

    /// Whether the slot at `id` holds an in-use record.
    pub fn is_in_use(&self, id: u64) -> Result<bool> {
        Ok(self.get_record(id, RecordLoad::Force)?.in_use())
    }

    /// Write `record` to its slot. Frees the record's id when it was just
    /// marked not-in-use, and any secondary-unit id no longer required.
    pub fn update_record(&self, record: &C::Record) -> Result<()> {
        let file = self.store_file()?;
        let id = record.id();
        let page_id = self.page_id_for_record(id)?;
        let offset = self.offset_for_id(id)?;
        let mut cursor = file.io(page_id, LockMode::Write);
        if cursor.next_to(page_id)? {
            // Writers hold the page write lock, so the retry loop is a
            // correctness belt rather than an expected path.
            loop {
                cursor.set_offset(offset);
                self.codec.write(&mut cursor, record)?;
                if !cursor.should_retry()? {
                    break;
                }
            }
            if !record.in_use() {
                self.free_id(id);
            }
            if let Some(secondary) = record.secondary_unit_id() {
                if !record.in_use() || !record.requires_secondary_unit() {
                    self.free_id(secondary);
                }
            }
        }
        Ok(())
    }

    /// Sequential forward scan over all in-use records. The visitor returns
    /// true to stop early. The record reference is reused between calls.
    pub fn scan_all_records(
        &self,
        mut visitor: impl FnMut(&C::Record) -> Result<bool>,
    ) -> Result<()> {
        let file = self.store_file()?;
        let high = self.high_id()?;
        if high == 0 {
            return Ok(());
        }
        let records_per_page = self.records_per_page()?;
        let end_page = self.page_id_for_record(high - 1)?;
        let mut record = self.codec.new_record(0);
        let mut cursor = file.io(0, LockMode::Read);
        let mut current_id = 0u64;
        let mut page_id = 0u64;
        while page_id <= end_page && cursor.next_to(page_id)? {
            for _ in 0..records_per_page {
                if current_id >= high {
                    return Ok(());
                }
                self.read_with_retry(&mut cursor, current_id, &mut record, RecordLoad::Check)?;
                if record.in_use() && visitor(&record)? {
                    return Ok(());
                }
                current_id += 1;
            }
            page_id += 1;
        }
        Ok(())
    }

    /// Traverse a linked chain of records starting at `first_id` until the
    /// codec reports no next reference. A not-in-use link ends the chain
    /// under `Check` and `Force`; under `Normal` it is an error.
    pub fn get_records(&self, first_id: u64, mode: RecordLoad) -> Result<Vec<C::Record>> {
        let file = self.store_file()?;
        let mut records = Vec::new();
        let mut cursor = file.io(0, LockMode::Read);
        let mut current = Some(first_id);
        while let Some(id) = current {
            let page_id = self.page_id_for_record(id)?;
            if !cursor.next_to(page_id)? {
                break;
            }
            let mut record = self.codec.new_record(id);
            self.read_with_retry(&mut cursor, id, &mut record, mode)?;
            if !record.in_use() {
                break;
            }
            current = self.codec.next_reference(&record);
            records.push(record);
        }
        Ok(records)
    }

    /// Backward scan from the last page for one past the highest in-use id.
    fn scan_for_high_id(&self) -> Result<u64> {
        let file = self.store_file()?;
        let reserved = self.codec.reserved_low_ids();
        let records_per_page = self.records_per_page()?;
        let record_size = self.codec.record_size();

        let mut page_id = match file.last_page_id() {
            Some(last) => last,
            None => return Ok(reserved),
        };
        let mut cursor = file.io(page_id, LockMode::Read);
        loop {
            if cursor.next_to(page_id)? {
                let mut found;
                loop {
                    found = None;
                    for slot in (0..records_per_page).rev() {
                        cursor.set_offset(slot * record_size);
                        if self.codec.is_in_use(&mut cursor)? {
                            found = Some(page_id * records_per_page as u64 + slot as u64 + 1);
                            break;
                        }
                    }
                    if !cursor.should_retry()? {
                        break;
                    }
                }
                if let Some(high) = found {
                    return Ok(high.max(reserved));
                }
            }
            if page_id == 0 {
                return Ok(reserved);
            }
            page_id -= 1;
        }
    }

    /// Rebuild the id generator from a full scan: backward for the high id,
    /// then forward collecting reclaimable ids page by page (skipped in fast
    /// rebuild mode).
    pub fn rebuild_id_generator(&mut self) -> Result<()> {
        info!(store = %self.path.display(), "rebuilding id generator");

        if let Some(ids) = self.id_generator.take() {
            ids.close()?;
        }
        IdGenerator::create(&self.id_path, self.codec.reserved_low_ids())?;
        self.id_generator = Some(IdGenerator::open(&self.id_path)?);

        let found_high = self.scan_for_high_id()?;
        self.set_high_id(found_high);

        let mut defragged = 0u64;
        if !self.config.rebuild_id_generators_fast {
            defragged = self.reclaim_free_ids(found_high)?;
            // Persist the reclaimed free-list so it survives the session.
            if let Some(ids) = self.id_generator.take() {
                ids.close()?;
            }
            self.id_generator = Some(IdGenerator::open(&self.id_path)?);
        }

        info!(
            store = %self.path.display(),
            high_id = found_high,
            defragged,
            "id generator rebuilt"
        );
        Ok(())
    }

    /// Forward page-by-page pass freeing not-in-use ids below `found_high`,
    /// clearing any reserved markers along the way.
    fn reclaim_free_ids(&self, found_high: u64) -> Result<u64> {
        let file = self.store_file()?;
        let records_per_page = self.records_per_page()?;
        let record_size = self.codec.record_size();
        let last_page = match file.last_page_id() {
            Some(last) => last,
            None => return Ok(0),
        };

        let mut cursor = file.io(0, LockMode::Write);
        let mut reclaimed = 0u64;
        let mut starting_slot = self.codec.reserved_low_ids() as usize;
        let mut freed = Vec::with_capacity(records_per_page);
        let mut done = false;
        let mut page_id = 0u64;

        while !done && page_id <= last_page && cursor.next_to(page_id)? {
            loop {
                freed.clear();
                done = false;
                for slot in starting_slot..records_per_page {
                    let record_id = page_id * records_per_page as u64 + slot as u64;
                    if record_id >= found_high {
                        done = true;
                        break;
                    }
                    let offset = slot * record_size;
                    cursor.set_offset(offset);
                    if !self.codec.is_in_use(&mut cursor)? {
                        freed.push(record_id);
                    } else {
                        cursor.set_offset(offset);
                        if self.codec.is_reserved(&mut cursor)? {
                            cursor.set_offset(offset);
                            self.codec.clear_reserved(&mut cursor)?;
                            freed.push(record_id);
                        }
                    }
                }
                if !cursor.should_retry()? {
                    break;
                }
            }
            for id in &freed {
                self.free_id(*id);
            }
            reclaimed += freed.len() as u64;
            starting_slot = 0;
            page_id += 1;
        }
        Ok(reclaimed)
    }

    /// Rebuild the id generator if the store came up not-ok. Must not overlap
    /// with recovery replay.
    pub fn make_store_ok(&mut self) -> Result<()> {
        if !self.store_ok {
            self.rebuild_id_generator()?;
            self.store_ok = true;
            self.not_ok_cause = None;
        }
        Ok(())
    }

    /// Reset the store file to empty and recreate a fresh id generator.
    /// Used by full-rewrite persistence.
    pub fn truncate_and_reopen(&mut self) -> Result<()> {
        self.store_file()?.truncate()?;
        if let Some(ids) = self.id_generator.take() {
            ids.delete()?;
        }
        IdGenerator::create(&self.id_path, self.codec.reserved_low_ids())?;
        self.id_generator = Some(IdGenerator::open(&self.id_path)?);
        self.store_ok = true;
        self.not_ok_cause = None;
        Ok(())
    }

    /// Force all dirty pages to stable storage. Failure is fatal to the
    /// session; there is no partial-success signaling.
    pub fn flush(&self) -> Result<()> {
        self.store_file()?.flush_and_force()
    }

    /// Flush and close the store file, then the id generator. The generator
    /// is only marked cleanly closed if the store file closed cleanly. The
    /// store is unusable afterwards.
    pub fn close(&mut self) -> Result<()> {
        let file = self.store_file.take().ok_or(StoreError::Closed)?;
        file.flush_and_force()?;
        drop(file);
        if let Some(ids) = self.id_generator.take() {
            if self.store_ok {
                ids.close()?;
            }
            // A not-ok store drops the generator unclosed; the sticky id file
            // forces a rebuild on the next open.
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    /// Minimal codec for tests: in-use byte + i64 payload.
    struct TestCodec;

    struct TestRecord {
        id: u64,
        in_use: bool,
        value: i64,
    }

    impl StoreRecord for TestRecord {
        fn id(&self) -> u64 {
            self.id
        }
        fn set_id(&mut self, id: u64) {
            self.id = id;
        }
        fn in_use(&self) -> bool {
            self.in_use
        }
        fn set_in_use(&mut self, in_use: bool) {
            self.in_use = in_use;
        }
        fn clear(&mut self) {
            self.in_use = false;
            self.value = 0;
        }
    }

    impl RecordCodec for TestCodec {
        type Record = TestRecord;

        fn record_size(&self) -> usize {
            9
        }

        fn new_record(&self, id: u64) -> TestRecord {
            TestRecord {
                id,
                in_use: false,
                value: 0,
            }
        }

        fn read(
            &self,
            cursor: &mut PageCursor<'_>,
            record: &mut TestRecord,
            _mode: RecordLoad,
        ) -> Result<()> {
            record.in_use = cursor.get_u8()? == 1;
            record.value = cursor.get_i64()?;
            Ok(())
        }

        fn write(&self, cursor: &mut PageCursor<'_>, record: &TestRecord) -> Result<()> {
            cursor.put_u8(if record.in_use { 1 } else { 0 })?;
            cursor.put_i64(record.value)?;
            Ok(())
        }

        fn is_in_use(&self, cursor: &mut PageCursor<'_>) -> Result<bool> {
            Ok(cursor.get_u8()? == 1)
        }
    }

    fn open_store(dir: &TempDir) -> RecordStore<TestCodec> {
        RecordStore::open(dir.path().join("test.db"), TestCodec, StoreConfig::default()).unwrap()
    }

    fn put(store: &RecordStore<TestCodec>, id: u64, value: i64) {
        let record = TestRecord {
            id,
            in_use: true,
            value,
        };
        store.update_record(&record).unwrap();
    }

    #[test]
    fn test_missing_store_without_create() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            create_if_missing: false,
            ..Default::default()
        };
        let result = RecordStore::open(dir.path().join("absent.db"), TestCodec, config);
        assert!(matches!(result, Err(StoreError::StoreNotFound(_))));
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let id = store.next_id().unwrap();
        put(&store, id, 1234);

        let record = store.get_record(id, RecordLoad::Normal).unwrap();
        assert!(record.in_use());
        assert_eq!(record.value, 1234);
    }

    #[test]
    fn test_id_reuse_after_delete() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        assert_eq!(store.next_id().unwrap(), 0);
        assert_eq!(store.next_id().unwrap(), 1);
        assert_eq!(store.next_id().unwrap(), 2);
        for id in 0..3 {
            put(&store, id, id as i64);
        }

        // Deleting record 1 returns its id to the free-list.
        let deleted = TestRecord {
            id: 1,
            in_use: false,
            value: 0,
        };
        store.update_record(&deleted).unwrap();
        assert_eq!(store.next_id().unwrap(), 1);
    }

    #[test]
    fn test_load_modes() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let id = store.next_id().unwrap();
        put(&store, id, 7);
        let deleted = TestRecord {
            id,
            in_use: false,
            value: 7,
        };
        store.update_record(&deleted).unwrap();

        assert!(matches!(
            store.get_record(id, RecordLoad::Normal),
            Err(StoreError::InvalidRecord(_))
        ));
        let checked = store.get_record(id, RecordLoad::Check).unwrap();
        assert!(!checked.in_use());
        let forced = store.get_record(id, RecordLoad::Force).unwrap();
        assert!(!forced.in_use());
    }

    #[test]
    fn test_read_past_end_stamps_id() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let record = store.get_record(100_000, RecordLoad::Force).unwrap();
        assert_eq!(record.id(), 100_000);
        assert!(!record.in_use());
        assert!(matches!(
            store.get_record(100_000, RecordLoad::Normal),
            Err(StoreError::InvalidRecord(_))
        ));
    }

    #[test]
    fn test_scan_all_records() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        for _ in 0..10 {
            let id = store.next_id().unwrap();
            put(&store, id, id as i64 * 10);
        }
        let deleted = TestRecord {
            id: 4,
            in_use: false,
            value: 0,
        };
        store.update_record(&deleted).unwrap();

        let mut seen = Vec::new();
        store
            .scan_all_records(|record| {
                seen.push((record.id(), record.value));
                Ok(false)
            })
            .unwrap();
        assert_eq!(seen.len(), 9);
        assert!(!seen.iter().any(|(id, _)| *id == 4));

        // Early termination.
        let mut visits = 0;
        store
            .scan_all_records(|_| {
                visits += 1;
                Ok(visits == 3)
            })
            .unwrap();
        assert_eq!(visits, 3);
    }

    #[test]
    fn test_unclean_shutdown_refuses_allocation_until_rebuild() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir);
            for _ in 0..20 {
                let id = store.next_id().unwrap();
                put(&store, id, 1);
            }
            let deleted = TestRecord {
                id: 3,
                in_use: false,
                value: 0,
            };
            store.update_record(&deleted).unwrap();
            store.flush().unwrap();
            // Dropped without close: the id file stays sticky.
        }

        let mut store = open_store(&dir);
        assert!(!store.is_store_ok());
        assert!(matches!(store.next_id(), Err(StoreError::StoreNotOk(_))));

        store.make_store_ok().unwrap();
        assert!(store.is_store_ok());
        assert_eq!(store.high_id().unwrap(), 20);
        // The freed id from before the crash was reclaimed by the scan.
        assert_eq!(store.next_id().unwrap(), 3);
        assert_eq!(store.next_id().unwrap(), 20);
    }

    #[test]
    fn test_rebuild_high_id_matches_backward_scan() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir);
            for _ in 0..50 {
                store.next_id().unwrap();
            }
            // Only low ids actually written; high ids were never used.
            for id in 0..5 {
                put(&store, id, 1);
            }
            store.flush().unwrap();
        }

        let mut store = open_store(&dir);
        store.make_store_ok().unwrap();
        assert_eq!(store.high_id().unwrap(), 5);
    }

    #[test]
    fn test_fast_rebuild_skips_reclaim() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir);
            for _ in 0..10 {
                let id = store.next_id().unwrap();
                put(&store, id, 1);
            }
            let deleted = TestRecord {
                id: 2,
                in_use: false,
                value: 0,
            };
            store.update_record(&deleted).unwrap();
            store.flush().unwrap();
        }

        let config = StoreConfig {
            rebuild_id_generators_fast: true,
            ..Default::default()
        };
        let mut store =
            RecordStore::open(dir.path().join("test.db"), TestCodec, config).unwrap();
        store.make_store_ok().unwrap();
        // Freed id 2 is not reclaimed in fast mode; allocation continues at
        // the high id.
        assert_eq!(store.next_id().unwrap(), 10);
    }

    #[test]
    fn test_operations_after_close_fail() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        let id = store.next_id().unwrap();
        put(&store, id, 5);
        store.close().unwrap();

        assert!(matches!(
            store.get_record(id, RecordLoad::Normal),
            Err(StoreError::Closed)
        ));
        assert!(matches!(store.flush(), Err(StoreError::Closed)));
        assert!(matches!(store.close(), Err(StoreError::Closed)));
    }

    #[test]
    fn test_clean_close_and_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = open_store(&dir);
            for _ in 0..5 {
                let id = store.next_id().unwrap();
                put(&store, id, id as i64);
            }
            store.close().unwrap();
        }
        let store = open_store(&dir);
        assert!(store.is_store_ok());
        assert_eq!(store.high_id().unwrap(), 5);
        let record = store.get_record(3, RecordLoad::Normal).unwrap();
        assert_eq!(record.value, 3);
    }

    /// Codec exercising chaining, secondary units, and reserved markers:
    /// flags byte (in-use, reserved), i64 value, u64 next link, u64 secondary
    /// unit id. `u64::MAX` encodes "no link".
    struct ChainCodec;

    const FLAG_IN_USE: u8 = 0x01;
    const FLAG_RESERVED: u8 = 0x02;
    const NO_LINK: u64 = u64::MAX;

    struct ChainRecord {
        id: u64,
        in_use: bool,
        reserved: bool,
        value: i64,
        next: Option<u64>,
        secondary: Option<u64>,
        needs_secondary: bool,
    }

    impl StoreRecord for ChainRecord {
        fn id(&self) -> u64 {
            self.id
        }
        fn set_id(&mut self, id: u64) {
            self.id = id;
        }
        fn in_use(&self) -> bool {
            self.in_use
        }
        fn set_in_use(&mut self, in_use: bool) {
            self.in_use = in_use;
        }
        fn clear(&mut self) {
            self.in_use = false;
            self.reserved = false;
            self.value = 0;
            self.next = None;
            self.secondary = None;
            self.needs_secondary = false;
        }
        fn secondary_unit_id(&self) -> Option<u64> {
            self.secondary
        }
        fn requires_secondary_unit(&self) -> bool {
            self.needs_secondary
        }
    }

    impl RecordCodec for ChainCodec {
        type Record = ChainRecord;

        fn record_size(&self) -> usize {
            25
        }

        fn new_record(&self, id: u64) -> ChainRecord {
            ChainRecord {
                id,
                in_use: false,
                reserved: false,
                value: 0,
                next: None,
                secondary: None,
                needs_secondary: false,
            }
        }

        fn read(
            &self,
            cursor: &mut PageCursor<'_>,
            record: &mut ChainRecord,
            _mode: RecordLoad,
        ) -> Result<()> {
            let flags = cursor.get_u8()?;
            record.in_use = flags & FLAG_IN_USE != 0;
            record.reserved = flags & FLAG_RESERVED != 0;
            record.value = cursor.get_i64()?;
            record.next = match cursor.get_u64()? {
                NO_LINK => None,
                id => Some(id),
            };
            record.secondary = match cursor.get_u64()? {
                NO_LINK => None,
                id => Some(id),
            };
            Ok(())
        }

        fn write(&self, cursor: &mut PageCursor<'_>, record: &ChainRecord) -> Result<()> {
            let mut flags = 0;
            if record.in_use {
                flags |= FLAG_IN_USE;
            }
            if record.reserved {
                flags |= FLAG_RESERVED;
            }
            cursor.put_u8(flags)?;
            cursor.put_i64(record.value)?;
            cursor.put_u64(record.next.unwrap_or(NO_LINK))?;
            cursor.put_u64(record.secondary.unwrap_or(NO_LINK))
        }

        fn is_in_use(&self, cursor: &mut PageCursor<'_>) -> Result<bool> {
            Ok(cursor.get_u8()? & FLAG_IN_USE != 0)
        }

        fn is_reserved(&self, cursor: &mut PageCursor<'_>) -> Result<bool> {
            Ok(cursor.get_u8()? & FLAG_RESERVED != 0)
        }

        fn clear_reserved(&self, cursor: &mut PageCursor<'_>) -> Result<()> {
            cursor.put_u8(0)
        }

        fn next_reference(&self, record: &ChainRecord) -> Option<u64> {
            record.next
        }
    }

    fn open_chain_store(dir: &TempDir) -> RecordStore<ChainCodec> {
        RecordStore::open(dir.path().join("chain.db"), ChainCodec, StoreConfig::default())
            .unwrap()
    }

    fn chain_record(id: u64, value: i64) -> ChainRecord {
        ChainRecord {
            id,
            in_use: true,
            reserved: false,
            value,
            next: None,
            secondary: None,
            needs_secondary: false,
        }
    }

    #[test]
    fn test_get_records_follows_chain() {
        let dir = TempDir::new().unwrap();
        let store = open_chain_store(&dir);

        for id in 0..3u64 {
            assert_eq!(store.next_id().unwrap(), id);
        }
        store
            .update_record(&ChainRecord {
                next: Some(1),
                ..chain_record(0, 10)
            })
            .unwrap();
        store
            .update_record(&ChainRecord {
                next: Some(2),
                ..chain_record(1, 20)
            })
            .unwrap();
        store.update_record(&chain_record(2, 30)).unwrap();

        let chain = store.get_records(0, RecordLoad::Normal).unwrap();
        let values: Vec<i64> = chain.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![10, 20, 30]);
    }

    #[test]
    fn test_chain_ending_at_unused_link() {
        let dir = TempDir::new().unwrap();
        let store = open_chain_store(&dir);

        for _ in 0..3 {
            store.next_id().unwrap();
        }
        // The chain points at slot 2, which is never written.
        store
            .update_record(&ChainRecord {
                next: Some(1),
                ..chain_record(0, 10)
            })
            .unwrap();
        store
            .update_record(&ChainRecord {
                next: Some(2),
                ..chain_record(1, 20)
            })
            .unwrap();

        let chain = store.get_records(0, RecordLoad::Check).unwrap();
        assert_eq!(chain.len(), 2);
        assert!(matches!(
            store.get_records(0, RecordLoad::Normal),
            Err(StoreError::InvalidRecord(2))
        ));
    }

    #[test]
    fn test_secondary_unit_freed_with_primary() {
        let dir = TempDir::new().unwrap();
        let store = open_chain_store(&dir);

        assert_eq!(store.next_id().unwrap(), 0);
        assert_eq!(store.next_id().unwrap(), 1);
        store
            .update_record(&ChainRecord {
                secondary: Some(1),
                needs_secondary: true,
                ..chain_record(0, 5)
            })
            .unwrap();
        store.update_record(&chain_record(1, 0)).unwrap();

        // Deleting the primary returns both units to the free-list.
        store
            .update_record(&ChainRecord {
                in_use: false,
                secondary: Some(1),
                ..chain_record(0, 0)
            })
            .unwrap();
        let freed: HashSet<u64> = (0..2).map(|_| store.next_id().unwrap()).collect();
        assert_eq!(freed, HashSet::from([0, 1]));
    }

    #[test]
    fn test_secondary_unit_freed_when_no_longer_required() {
        let dir = TempDir::new().unwrap();
        let store = open_chain_store(&dir);

        assert_eq!(store.next_id().unwrap(), 0);
        assert_eq!(store.next_id().unwrap(), 1);
        store
            .update_record(&ChainRecord {
                secondary: Some(1),
                needs_secondary: true,
                ..chain_record(0, 5)
            })
            .unwrap();

        // The record shrank: still in use, secondary no longer needed.
        store
            .update_record(&ChainRecord {
                secondary: Some(1),
                needs_secondary: false,
                ..chain_record(0, 5)
            })
            .unwrap();
        assert_eq!(store.next_id().unwrap(), 1);
        assert_eq!(store.next_id().unwrap(), 2);
    }

    #[test]
    fn test_reserved_ids_reclaimed_on_rebuild() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_chain_store(&dir);
            for id in 0..10u64 {
                store.next_id().unwrap();
                store.update_record(&chain_record(id, 1)).unwrap();
            }
            store
                .update_record(&ChainRecord {
                    reserved: true,
                    ..chain_record(4, 0)
                })
                .unwrap();
            store.flush().unwrap();
            // Dropped without close: the id file stays sticky.
        }

        let mut store = open_chain_store(&dir);
        store.make_store_ok().unwrap();
        // The reserved slot was cleared and its id returned for reuse.
        assert!(!store.is_in_use(4).unwrap());
        assert_eq!(store.next_id().unwrap(), 4);
        assert_eq!(store.next_id().unwrap(), 10);
    }

    #[test]
    fn test_truncate_and_reopen_resets_ids() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        for _ in 0..5 {
            let id = store.next_id().unwrap();
            put(&store, id, 1);
        }
        store.truncate_and_reopen().unwrap();
        assert_eq!(store.high_id().unwrap(), 0);
        assert_eq!(store.next_id().unwrap(), 0);
        assert!(!store.is_in_use(1).unwrap());
    }
}
