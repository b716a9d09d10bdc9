//! Paged file built on a memory-mapped region.
//!
//! Concurrency protocol: each page carries a generation word (a seqlock).
//! An even value is a stable generation; an odd value means a writer is
//! inside the page. Readers never block: they copy bytes out speculatively
//! and then ask `should_retry()` whether the generation changed during the
//! copy, redoing the copy until a stable result is obtained. Writers hold
//! the page word odd for the duration of a single record update, so there
//! is at most one writer per page at a time.

use crate::error::{Result, StoreError};
use fs2::FileExt;
use memmap2::MmapRaw;
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cursor lock mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    /// Optimistic shared read. Never blocks; torn copies are detected by the
    /// generation check and must be redone by the caller.
    Read,
    /// Exclusive per-page write. Grows the file when moved past the end.
    Write,
}

/// Per-page seqlock word.
struct PageLatch {
    version: AtomicU64,
}

impl PageLatch {
    fn new() -> Self {
        Self {
            version: AtomicU64::new(0),
        }
    }

    /// Wait for a stable (even) generation and return it.
    fn enter_read(&self) -> u64 {
        loop {
            let v = self.version.load(Ordering::Acquire);
            if v & 1 == 0 {
                return v;
            }
            std::hint::spin_loop();
        }
    }

    /// Acquire the page for writing by flipping the generation odd.
    fn enter_write(&self) -> u64 {
        loop {
            let v = self.version.load(Ordering::Relaxed);
            if v & 1 == 0
                && self
                    .version
                    .compare_exchange_weak(v, v + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return v + 1;
            }
            std::hint::spin_loop();
        }
    }

    /// Publish a new stable generation.
    fn release_write(&self, entered: u64) {
        debug_assert!(entered & 1 == 1);
        self.version.store(entered + 1, Ordering::Release);
    }
}

struct MapState {
    /// None while the file is empty (zero-length files cannot be mapped).
    raw: Option<MmapRaw>,
    len: u64,
}

/// A file mapped as a sequence of fixed-size pages.
pub struct PagedFile {
    path: PathBuf,
    page_size: usize,
    file: File,
    map: RwLock<MapState>,
    latches: RwLock<Vec<Arc<PageLatch>>>,
    /// Serializes file growth and truncation.
    resize_lock: Mutex<()>,
}

impl PagedFile {
    /// Map a file as pages of `page_size` bytes, creating it if requested.
    ///
    /// Takes an exclusive process lock on the file for the lifetime of the
    /// mapping.
    pub fn map(path: impl AsRef<Path>, page_size: usize, create: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if page_size == 0 {
            return Err(StoreError::InvalidFormat("page size must be non-zero".into()));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&path)?;
        file.try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;

        let len = file.metadata()?.len();
        if len % page_size as u64 != 0 {
            return Err(StoreError::InvalidFormat(format!(
                "file length {} is not a whole number of {}-byte pages",
                len, page_size
            )));
        }

        let raw = if len > 0 {
            Some(MmapRaw::map_raw(&file)?)
        } else {
            None
        };

        let page_count = (len / page_size as u64) as usize;
        let latches = (0..page_count).map(|_| Arc::new(PageLatch::new())).collect();

        Ok(Self {
            path,
            page_size,
            file,
            map: RwLock::new(MapState { raw, len }),
            latches: RwLock::new(latches),
            resize_lock: Mutex::new(()),
        })
    }

    /// Page size of this file.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of pages currently backed by the file.
    pub fn page_count(&self) -> u64 {
        self.map.read().len / self.page_size as u64
    }

    /// Id of the last page, or `None` for an empty file.
    pub fn last_page_id(&self) -> Option<u64> {
        match self.page_count() {
            0 => None,
            n => Some(n - 1),
        }
    }

    /// Open a cursor positioned so that the first `next()` lands on `page_id`.
    pub fn io(&self, page_id: u64, mode: LockMode) -> PageCursor<'_> {
        PageCursor {
            file: self,
            mode,
            next_page: page_id,
            current: None,
            offset: 0,
        }
    }

    /// Force all written pages to stable storage.
    pub fn flush_and_force(&self) -> Result<()> {
        let state = self.map.read();
        if let Some(raw) = &state.raw {
            raw.flush()?;
        }
        self.file.sync_all()?;
        Ok(())
    }

    /// Drop all pages and reset the file to zero length.
    pub fn truncate(&self) -> Result<()> {
        let _resize = self.resize_lock.lock();
        let mut state = self.map.write();
        state.raw = None;
        self.file.set_len(0)?;
        state.len = 0;
        self.latches.write().clear();
        Ok(())
    }

    /// Grow the file to hold at least `min_pages` pages and remap.
    fn grow(&self, min_pages: u64) -> Result<()> {
        let _resize = self.resize_lock.lock();
        if self.page_count() >= min_pages {
            return Ok(());
        }
        let new_len = min_pages * self.page_size as u64;
        let mut state = self.map.write();
        state.raw = None; // unmap before extending
        self.file.set_len(new_len)?;
        state.raw = Some(MmapRaw::map_raw(&self.file)?);
        state.len = new_len;
        let mut latches = self.latches.write();
        while (latches.len() as u64) < min_pages {
            latches.push(Arc::new(PageLatch::new()));
        }
        Ok(())
    }

    fn latch(&self, page_id: u64) -> Option<Arc<PageLatch>> {
        self.latches.read().get(page_id as usize).cloned()
    }

    /// Copy bytes out of a page. The caller detects torn copies through the
    /// generation check, so a concurrent writer only forces a redo.
    fn read_bytes(&self, page_id: u64, offset: usize, buf: &mut [u8]) -> Result<()> {
        let abs = self.bounds_check(page_id, offset, buf.len())?;
        let state = self.map.read();
        let raw = state
            .raw
            .as_ref()
            .ok_or(StoreError::PageOutOfBounds(page_id))?;
        unsafe {
            std::ptr::copy_nonoverlapping(raw.as_mut_ptr().add(abs) as *const u8, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Copy bytes into a page. Only called with the page latch held odd.
    fn write_bytes(&self, page_id: u64, offset: usize, buf: &[u8]) -> Result<()> {
        let abs = self.bounds_check(page_id, offset, buf.len())?;
        let state = self.map.read();
        let raw = state
            .raw
            .as_ref()
            .ok_or(StoreError::PageOutOfBounds(page_id))?;
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), raw.as_mut_ptr().add(abs), buf.len());
        }
        Ok(())
    }

    fn bounds_check(&self, page_id: u64, offset: usize, len: usize) -> Result<usize> {
        if offset + len > self.page_size {
            return Err(StoreError::InvalidFormat(format!(
                "access at offset {} length {} exceeds page size {}",
                offset, len, self.page_size
            )));
        }
        if page_id >= self.page_count() {
            return Err(StoreError::PageOutOfBounds(page_id));
        }
        Ok(page_id as usize * self.page_size + offset)
    }
}

impl Drop for PagedFile {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

struct CurrentPage {
    page_id: u64,
    latch: Arc<PageLatch>,
    entered: u64,
}

/// Cursor over the pages of a [`PagedFile`].
///
/// Read cursors follow the optimistic protocol: copy, then check
/// `should_retry()` and redo the copy if a writer raced the read. Write
/// cursors hold the page exclusively, so `should_retry()` is always false
/// for them.
pub struct PageCursor<'a> {
    file: &'a PagedFile,
    mode: LockMode,
    next_page: u64,
    current: Option<CurrentPage>,
    offset: usize,
}

impl<'a> PageCursor<'a> {
    /// Advance to the next page. Returns false when a read cursor moves past
    /// the end of the file; a write cursor grows the file instead.
    pub fn next(&mut self) -> Result<bool> {
        let page_id = self.next_page;
        self.next_to(page_id)
    }

    /// Position the cursor on a specific page.
    pub fn next_to(&mut self, page_id: u64) -> Result<bool> {
        self.release_current();
        if !self.acquire(page_id)? {
            return Ok(false);
        }
        self.next_page = page_id + 1;
        Ok(true)
    }

    fn acquire(&mut self, page_id: u64) -> Result<bool> {
        match self.mode {
            LockMode::Read => {
                let latch = match self.file.latch(page_id) {
                    Some(latch) => latch,
                    None => return Ok(false),
                };
                let entered = latch.enter_read();
                self.current = Some(CurrentPage {
                    page_id,
                    latch,
                    entered,
                });
            }
            LockMode::Write => {
                if page_id >= self.file.page_count() {
                    self.file.grow(page_id + 1)?;
                }
                let latch = self
                    .file
                    .latch(page_id)
                    .ok_or(StoreError::PageOutOfBounds(page_id))?;
                let entered = latch.enter_write();
                self.current = Some(CurrentPage {
                    page_id,
                    latch,
                    entered,
                });
            }
        }
        self.offset = 0;
        Ok(true)
    }

    fn release_current(&mut self) {
        if let Some(current) = self.current.take() {
            if self.mode == LockMode::Write {
                current.latch.release_write(current.entered);
            }
        }
    }

    /// Page the cursor currently stands on.
    pub fn current_page_id(&self) -> Option<u64> {
        self.current.as_ref().map(|c| c.page_id)
    }

    /// Set the in-page offset for subsequent reads/writes.
    pub fn set_offset(&mut self, offset: usize) {
        self.offset = offset;
    }

    /// Current in-page offset.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Whether the just-completed reads must be redone because a writer
    /// modified the page during the copy. On true, the cursor has already
    /// re-entered a stable generation; the caller resets its offset and
    /// repeats the copy.
    pub fn should_retry(&mut self) -> Result<bool> {
        let current = self.current.as_mut().ok_or(StoreError::Closed)?;
        if self.mode == LockMode::Write {
            return Ok(false);
        }
        let v = current.latch.version.load(Ordering::Acquire);
        if v == current.entered {
            return Ok(false);
        }
        current.entered = current.latch.enter_read();
        Ok(true)
    }

    fn current_page(&self) -> Result<u64> {
        self.current
            .as_ref()
            .map(|c| c.page_id)
            .ok_or(StoreError::Closed)
    }

    /// Copy `buf.len()` bytes from the current offset, advancing it.
    pub fn get_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        let page_id = self.current_page()?;
        self.file.read_bytes(page_id, self.offset, buf)?;
        self.offset += buf.len();
        Ok(())
    }

    /// Copy `buf` to the current offset, advancing it.
    pub fn put_bytes(&mut self, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(self.mode, LockMode::Write);
        let page_id = self.current_page()?;
        self.file.write_bytes(page_id, self.offset, buf)?;
        self.offset += buf.len();
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.get_bytes(&mut buf)?;
        Ok(buf[0])
    }

    pub fn put_u8(&mut self, value: u8) -> Result<()> {
        self.put_bytes(&[value])
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.get_bytes(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    pub fn put_i32(&mut self, value: i32) -> Result<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.get_bytes(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    pub fn put_i64(&mut self, value: i64) -> Result<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.get_bytes(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn put_u64(&mut self, value: u64) -> Result<()> {
        self.put_bytes(&value.to_le_bytes())
    }
}

impl<'a> Drop for PageCursor<'a> {
    fn drop(&mut self) {
        self.release_current();
    }
}
