//! Memory-mapped paged file with optimistic-retry page cursors.

mod file;

pub use file::{LockMode, PageCursor, PagedFile};
