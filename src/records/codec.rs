//! Record and codec abstractions.
//!
//! A store is a generic container; everything format-specific lives in a
//! [`RecordCodec`] implementation composed into the store.

use crate::error::{Result, StoreError};
use crate::paging::PageCursor;

/// Fixed-size, id-addressed unit of persisted state.
pub trait StoreRecord {
    fn id(&self) -> u64;
    fn set_id(&mut self, id: u64);
    fn in_use(&self) -> bool;
    fn set_in_use(&mut self, in_use: bool);

    /// Reset everything but the id.
    fn clear(&mut self);

    /// Overflow record slot associated with this record, if any.
    fn secondary_unit_id(&self) -> Option<u64> {
        None
    }

    /// Whether the record still needs its secondary unit.
    fn requires_secondary_unit(&self) -> bool {
        false
    }
}

/// Load strictness applied after a record read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordLoad {
    /// Raise [`StoreError::InvalidRecord`] when the slot is not in use.
    Normal,
    /// Like `Normal` but not-in-use slots are cleared and skipped; used for
    /// full-store scans.
    Check,
    /// Return whatever is present regardless of in-use state.
    Force,
}

impl RecordLoad {
    /// Returns whether the loaded contents should be kept. `Normal` fails on
    /// a not-in-use slot instead.
    pub(crate) fn verify<R: StoreRecord>(self, record: &R) -> Result<bool> {
        match self {
            RecordLoad::Normal => {
                if record.in_use() {
                    Ok(true)
                } else {
                    Err(StoreError::InvalidRecord(record.id()))
                }
            }
            RecordLoad::Check => Ok(record.in_use()),
            RecordLoad::Force => Ok(true),
        }
    }
}

/// Encode/decode capability for one record format.
///
/// All cursor positions passed in are already at the record's in-page offset;
/// implementations read or write exactly [`record_size`](Self::record_size)
/// bytes from there.
pub trait RecordCodec {
    type Record: StoreRecord;

    /// Serialized size of one record, including the in-use byte.
    fn record_size(&self) -> usize;

    /// Low ids reserved for header storage; they are never allocated.
    fn reserved_low_ids(&self) -> u64 {
        0
    }

    /// A cleared record stamped with the given id.
    fn new_record(&self, id: u64) -> Self::Record;

    /// Decode the record at the cursor into `record`.
    fn read(&self, cursor: &mut PageCursor<'_>, record: &mut Self::Record, mode: RecordLoad)
        -> Result<()>;

    /// Encode `record` at the cursor.
    fn write(&self, cursor: &mut PageCursor<'_>, record: &Self::Record) -> Result<()>;

    /// Cheap in-use probe at the cursor, used by scans and rebuild.
    fn is_in_use(&self, cursor: &mut PageCursor<'_>) -> Result<bool>;

    /// Whether the slot at the cursor carries a reserved marker that rebuild
    /// must clear before freeing the id.
    fn is_reserved(&self, _cursor: &mut PageCursor<'_>) -> Result<bool> {
        Ok(false)
    }

    /// Clear the reserved marker at the cursor.
    fn clear_reserved(&self, _cursor: &mut PageCursor<'_>) -> Result<()> {
        Ok(())
    }

    /// Id of the next record in a linked chain, if this format chains records.
    fn next_reference(&self, _record: &Self::Record) -> Option<u64> {
        None
    }

    /// Write the header record(s) when the format reserves low ids.
    fn write_header(&self, _cursor: &mut PageCursor<'_>) -> Result<()> {
        Ok(())
    }
}
