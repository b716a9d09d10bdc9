//! Counter keys.

use crate::error::{Result, StoreError};

/// Tag byte reserved for empty slots; never a valid serialized key.
pub(crate) const TAG_EMPTY: u8 = 0;
pub(crate) const TAG_ENTITY_NODE: u8 = 1;
pub(crate) const TAG_ENTITY_RELATIONSHIP: u8 = 2;
pub(crate) const TAG_INDEX_STATISTICS: u8 = 3;
pub(crate) const TAG_INDEX_SAMPLE: u8 = 4;

/// Key identifying one counter.
///
/// The variant determines the arity and semantics of the associated value
/// vector: one value for entity counts, an (updates, size) respectively
/// (unique, size) pair for index statistics and samples. Label, type and
/// property ids are signed so that wildcard (-1) and sentinel ids can be
/// represented.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CountsKey {
    EntityNode {
        label_id: i32,
    },
    EntityRelationship {
        start_label_id: i32,
        type_id: i32,
        end_label_id: i32,
    },
    IndexStatistics {
        label_id: i32,
        property_key_id: i32,
    },
    IndexSample {
        label_id: i32,
        property_key_id: i32,
    },
}

impl CountsKey {
    pub fn node(label_id: i32) -> Self {
        CountsKey::EntityNode { label_id }
    }

    pub fn relationship(start_label_id: i32, type_id: i32, end_label_id: i32) -> Self {
        CountsKey::EntityRelationship {
            start_label_id,
            type_id,
            end_label_id,
        }
    }

    pub fn index_statistics(label_id: i32, property_key_id: i32) -> Self {
        CountsKey::IndexStatistics {
            label_id,
            property_key_id,
        }
    }

    pub fn index_sample(label_id: i32, property_key_id: i32) -> Self {
        CountsKey::IndexSample {
            label_id,
            property_key_id,
        }
    }

    /// Number of values associated with this key.
    pub fn arity(&self) -> usize {
        match self {
            CountsKey::EntityNode { .. } | CountsKey::EntityRelationship { .. } => 1,
            CountsKey::IndexStatistics { .. } | CountsKey::IndexSample { .. } => 2,
        }
    }

    /// Serialized tag byte.
    pub(crate) fn tag(&self) -> u8 {
        match self {
            CountsKey::EntityNode { .. } => TAG_ENTITY_NODE,
            CountsKey::EntityRelationship { .. } => TAG_ENTITY_RELATIONSHIP,
            CountsKey::IndexStatistics { .. } => TAG_INDEX_STATISTICS,
            CountsKey::IndexSample { .. } => TAG_INDEX_SAMPLE,
        }
    }

    /// Validate a value vector against this key's arity.
    pub(crate) fn check_arity(&self, values: &[i64]) -> Result<()> {
        if values.len() != self.arity() {
            return Err(StoreError::Corruption(format!(
                "key {:?} expects {} value(s), got {}",
                self,
                self.arity(),
                values.len()
            )));
        }
        Ok(())
    }
}
