//! Fixed-width record format for counter entries.
//!
//! Layout (little-endian), padded with zeroes to the largest variant:
//!
//! ```text
//! offset 0   in-use byte (1 = in use)
//! offset 1   tag byte (see keys module; 0 is the reserved empty tag)
//! offset 2   variant fields:
//!   node          label(i32)                       count(i64)
//!   relationship  start(i32) type(i32) end(i32)    count(i64)
//!   index stats   label(i32) property(i32)         updates(i64) size(i64)
//!   index sample  label(i32) property(i32)         unique(i64)  size(i64)
//! ```
//!
//! A corrupt tag would otherwise produce a type-confused value vector
//! downstream, so decoding an unrecognized or empty tag on an in-use slot is
//! a hard failure, never silently ignored.

use crate::counts::keys::{
    CountsKey, TAG_EMPTY, TAG_ENTITY_NODE, TAG_ENTITY_RELATIONSHIP, TAG_INDEX_SAMPLE,
    TAG_INDEX_STATISTICS,
};
use crate::error::{Result, StoreError};
use crate::paging::PageCursor;
use crate::records::{RecordCodec, RecordLoad, StoreRecord};

/// Serialized record size: in-use byte plus the largest variant
/// (tag + 2 ids + 2 values).
pub const STATISTICS_RECORD_SIZE: usize = 1 + 1 + 4 + 4 + 8 + 8;

const IN_USE: u8 = 1;
const NOT_IN_USE: u8 = 0;

/// One (key, values) counter pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatisticsEntry {
    pub key: CountsKey,
    pub values: Vec<i64>,
}

impl StatisticsEntry {
    pub fn new(key: CountsKey, values: Vec<i64>) -> Result<Self> {
        key.check_arity(&values)?;
        Ok(Self { key, values })
    }
}

/// On-disk/in-memory representation of one counter entry.
#[derive(Clone, Debug)]
pub struct StatisticsRecord {
    id: u64,
    in_use: bool,
    entry: Option<StatisticsEntry>,
}

impl StatisticsRecord {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            in_use: false,
            entry: None,
        }
    }

    /// An in-use record ready for [`update_record`].
    ///
    /// [`update_record`]: crate::records::RecordStore::update_record
    pub fn for_write(id: u64, key: CountsKey, values: Vec<i64>) -> Result<Self> {
        Ok(Self {
            id,
            in_use: true,
            entry: Some(StatisticsEntry::new(key, values)?),
        })
    }

    pub fn entry(&self) -> Option<&StatisticsEntry> {
        self.entry.as_ref()
    }
}

impl StoreRecord for StatisticsRecord {
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
        self.entry = None;
    }
}

/// Codec for [`StatisticsRecord`]s.
pub struct StatisticsCodec;

impl StatisticsCodec {
    fn decode(buf: &[u8; STATISTICS_RECORD_SIZE]) -> Result<Option<StatisticsEntry>> {
        let tag = buf[1];
        let entry = match tag {
            TAG_ENTITY_NODE => StatisticsEntry {
                key: CountsKey::node(read_i32(buf, 2)),
                values: vec![read_i64(buf, 6)],
            },
            TAG_ENTITY_RELATIONSHIP => StatisticsEntry {
                key: CountsKey::relationship(read_i32(buf, 2), read_i32(buf, 6), read_i32(buf, 10)),
                values: vec![read_i64(buf, 14)],
            },
            TAG_INDEX_STATISTICS => StatisticsEntry {
                key: CountsKey::index_statistics(read_i32(buf, 2), read_i32(buf, 6)),
                values: vec![read_i64(buf, 10), read_i64(buf, 18)],
            },
            TAG_INDEX_SAMPLE => StatisticsEntry {
                key: CountsKey::index_sample(read_i32(buf, 2), read_i32(buf, 6)),
                values: vec![read_i64(buf, 10), read_i64(buf, 18)],
            },
            TAG_EMPTY => {
                return Err(StoreError::Corruption(
                    "counter entry with empty tag cannot be deserialized".into(),
                ))
            }
            other => {
                return Err(StoreError::Corruption(format!(
                    "counter entry has unknown tag {}",
                    other
                )))
            }
        };
        Ok(Some(entry))
    }

    fn encode(record: &StatisticsRecord) -> Result<[u8; STATISTICS_RECORD_SIZE]> {
        let mut buf = [0u8; STATISTICS_RECORD_SIZE];
        buf[0] = if record.in_use { IN_USE } else { NOT_IN_USE };
        let entry = match &record.entry {
            Some(entry) => entry,
            None => return Ok(buf),
        };
        entry.key.check_arity(&entry.values)?;
        buf[1] = entry.key.tag();
        match entry.key {
            CountsKey::EntityNode { label_id } => {
                write_i32(&mut buf, 2, label_id);
                write_i64(&mut buf, 6, entry.values[0]);
            }
            CountsKey::EntityRelationship {
                start_label_id,
                type_id,
                end_label_id,
            } => {
                write_i32(&mut buf, 2, start_label_id);
                write_i32(&mut buf, 6, type_id);
                write_i32(&mut buf, 10, end_label_id);
                write_i64(&mut buf, 14, entry.values[0]);
            }
            CountsKey::IndexStatistics {
                label_id,
                property_key_id,
            }
            | CountsKey::IndexSample {
                label_id,
                property_key_id,
            } => {
                write_i32(&mut buf, 2, label_id);
                write_i32(&mut buf, 6, property_key_id);
                write_i64(&mut buf, 10, entry.values[0]);
                write_i64(&mut buf, 18, entry.values[1]);
            }
        }
        Ok(buf)
    }
}

impl RecordCodec for StatisticsCodec {
    type Record = StatisticsRecord;

    fn record_size(&self) -> usize {
        STATISTICS_RECORD_SIZE
    }

    fn new_record(&self, id: u64) -> StatisticsRecord {
        StatisticsRecord::new(id)
    }

    fn read(
        &self,
        cursor: &mut PageCursor<'_>,
        record: &mut StatisticsRecord,
        _mode: RecordLoad,
    ) -> Result<()> {
        let mut buf = [0u8; STATISTICS_RECORD_SIZE];
        cursor.get_bytes(&mut buf)?;
        record.in_use = buf[0] == IN_USE;
        // Not-in-use slots are zeroed; their empty tag is not corruption.
        record.entry = if record.in_use {
            Self::decode(&buf)?
        } else {
            None
        };
        Ok(())
    }

    fn write(&self, cursor: &mut PageCursor<'_>, record: &StatisticsRecord) -> Result<()> {
        let buf = Self::encode(record)?;
        cursor.put_bytes(&buf)
    }

    fn is_in_use(&self, cursor: &mut PageCursor<'_>) -> Result<bool> {
        Ok(cursor.get_u8()? == IN_USE)
    }
}

fn read_i32(buf: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn read_i64(buf: &[u8], offset: usize) -> i64 {
    i64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}

fn write_i32(buf: &mut [u8], offset: usize, value: i32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_i64(buf: &mut [u8], offset: usize, value: i64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}
