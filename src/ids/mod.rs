//! Record id allocation and reuse.

mod generator;

pub use generator::IdGenerator;
