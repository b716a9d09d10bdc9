//! Free-list id generator.
//!
//! One generator per store file. Allocation prefers reclaimed ids from the
//! free-list and falls back to advancing the high id (the next never-used
//! id). The backing id file carries a sticky byte that is set while the
//! generator is open and cleared on clean close; finding it set on open
//! means the store shut down uncleanly and the generator cannot be trusted
//! until the owning store rebuilds it from a scan.

use crate::error::{Result, StoreError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for id files.
const ID_FILE_MAGIC: &[u8; 4] = b"IDG\0";

/// Current id file format version.
const ID_FILE_VERSION: u8 = 1;

/// Sticky byte values.
const CLEAN: u8 = 0;
const STICKY: u8 = 1;

struct IdState {
    high_id: u64,
    free: VecDeque<u64>,
}

/// Allocator and recycler of record ids with a free-list and a high-water
/// mark.
pub struct IdGenerator {
    path: PathBuf,
    state: Mutex<IdState>,
}

impl IdGenerator {
    /// Create a fresh id file with an empty free-list.
    pub fn create(path: impl AsRef<Path>, high_id: u64) -> Result<()> {
        write_id_file(path.as_ref(), CLEAN, high_id, &VecDeque::new())
    }

    /// Open an existing id file.
    ///
    /// A file that fails structural validation, or whose sticky byte is still
    /// set from an unclean shutdown, raises [`StoreError::InvalidIdGenerator`].
    /// The file is marked sticky on successful open and stays so until
    /// [`close`](Self::close).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (high_id, free) = read_id_file(&path)?;

        // Mark in use. If we crash from here on, the next open forces a
        // rebuild.
        write_id_file(&path, STICKY, high_id, &free)?;

        Ok(Self {
            path,
            state: Mutex::new(IdState { high_id, free }),
        })
    }

    /// Allocate an id: a reclaimed one when available, else the high id.
    pub fn next_id(&self) -> u64 {
        let mut state = self.state.lock();
        if let Some(id) = state.free.pop_front() {
            return id;
        }
        let id = state.high_id;
        state.high_id += 1;
        id
    }

    /// Return an id to the free-list for future reuse.
    pub fn free_id(&self, id: u64) {
        let mut state = self.state.lock();
        if id < state.high_id {
            state.free.push_back(id);
        }
    }

    /// Exclusive upper bound of ids ever allocated.
    pub fn high_id(&self) -> u64 {
        self.state.lock().high_id
    }

    /// Raise the high id. Lowering is a no-op.
    pub fn set_high_id(&self, high_id: u64) {
        let mut state = self.state.lock();
        if high_id > state.high_id {
            state.high_id = high_id;
        }
    }

    /// Highest id that could currently be in use.
    pub fn highest_possible_id_in_use(&self) -> u64 {
        self.state.lock().high_id.saturating_sub(1)
    }

    /// Number of ids allocated and not freed.
    pub fn ids_in_use(&self) -> u64 {
        let state = self.state.lock();
        state.high_id - state.free.len() as u64
    }

    /// Persist the current state and clear the sticky byte.
    pub fn close(self) -> Result<()> {
        let state = self.state.lock();
        write_id_file(&self.path, CLEAN, state.high_id, &state.free)
    }

    /// Discard the generator and its backing file.
    pub fn delete(self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn write_id_file(path: &Path, sticky: u8, high_id: u64, free: &VecDeque<u64>) -> Result<()> {
    let mut buf = Vec::with_capacity(4 + 1 + 1 + 8 + 4 + free.len() * 8 + 4);
    buf.extend_from_slice(ID_FILE_MAGIC);
    buf.push(ID_FILE_VERSION);
    buf.push(sticky);
    buf.extend_from_slice(&high_id.to_le_bytes());
    buf.extend_from_slice(&(free.len() as u32).to_le_bytes());
    let ids_start = buf.len();
    for id in free {
        buf.extend_from_slice(&id.to_le_bytes());
    }
    let checksum = crc32fast::hash(&buf[ids_start..]);
    buf.extend_from_slice(&checksum.to_le_bytes());

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(&buf)?;
    file.sync_all()?;
    Ok(())
}

fn read_id_file(path: &Path) -> Result<(u64, VecDeque<u64>)> {
    let mut file = File::open(path).map_err(|e| {
        StoreError::InvalidIdGenerator(format!("cannot open {}: {}", path.display(), e))
    })?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;

    if contents.len() < 4 + 1 + 1 + 8 + 4 + 4 {
        return Err(StoreError::InvalidIdGenerator(format!(
            "{} is truncated",
            path.display()
        )));
    }
    if &contents[0..4] != ID_FILE_MAGIC {
        return Err(StoreError::InvalidIdGenerator(format!(
            "{} has bad magic",
            path.display()
        )));
    }
    if contents[4] != ID_FILE_VERSION {
        return Err(StoreError::InvalidIdGenerator(format!(
            "{} has unsupported version {}",
            path.display(),
            contents[4]
        )));
    }
    if contents[5] != CLEAN {
        return Err(StoreError::InvalidIdGenerator(format!(
            "{} was not closed cleanly",
            path.display()
        )));
    }

    let high_id = u64::from_le_bytes(contents[6..14].try_into().unwrap());
    let count = u32::from_le_bytes(contents[14..18].try_into().unwrap()) as usize;

    let ids_start = 18;
    let ids_end = ids_start + count * 8;
    if contents.len() != ids_end + 4 {
        return Err(StoreError::InvalidIdGenerator(format!(
            "{} free-list length mismatch",
            path.display()
        )));
    }

    let expected = u32::from_le_bytes(contents[ids_end..ids_end + 4].try_into().unwrap());
    let got = crc32fast::hash(&contents[ids_start..ids_end]);
    if expected != got {
        return Err(StoreError::ChecksumMismatch { expected, got });
    }

    let mut free = VecDeque::with_capacity(count);
    for i in 0..count {
        let start = ids_start + i * 8;
        free.push_back(u64::from_le_bytes(contents[start..start + 8].try_into().unwrap()));
    }
    Ok((high_id, free))
}
