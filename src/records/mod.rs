//! Generic fixed-size, id-addressed record storage.

mod codec;
mod store;

pub use codec::{RecordCodec, RecordLoad, StoreRecord};
pub use store::RecordStore;
