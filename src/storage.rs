//! Durable storage: the page file, cached pages, and the write-ahead log.
//!
//! - **PageFile**: whole-page reads and writes against the single `.db` file
//! - **Page**: an 8 KiB buffer with a dirty flag, shared behind an `Arc`
//! - **PageCache**: reference-counted pool of pages with flush-on-evict
//! - **Wal**: checksummed append-only log with torn-tail repair at open

pub mod disk;
pub mod page;
pub mod page_cache;
pub mod wal;

pub use disk::PageFile;
pub use page::{Page, PageNo, PAGE_SIZE};
pub use page_cache::{PageCache, MIN_CACHE_PAGES};
pub use wal::Wal;
