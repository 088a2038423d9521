//! In-memory pages and their on-disk formats.

pub mod first_page;
pub mod record_page;

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

/// Size of a disk page in bytes.
pub const PAGE_SIZE: usize = 8192;

/// A 1-based page number within the database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageNo(pub u32);

impl std::fmt::Display for PageNo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "page{}", self.0)
    }
}

/// A cached page: raw bytes behind a read/write lock plus a dirty flag.
///
/// Pages carry no back-reference to their cache; releasing a page is the
/// page cache's job, addressed by number.
pub struct Page {
    no: PageNo,
    buf: RwLock<Box<[u8; PAGE_SIZE]>>,
    dirty: AtomicBool,
}

impl Page {
    pub fn new(no: PageNo, data: Box<[u8; PAGE_SIZE]>) -> Page {
        Page {
            no,
            buf: RwLock::new(data),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn no(&self) -> PageNo {
        self.no
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::SeqCst);
    }

    /// Runs `f` with shared access to the page bytes.
    pub fn with<R>(&self, f: impl FnOnce(&[u8; PAGE_SIZE]) -> R) -> R {
        f(&self.buf.read())
    }

    /// Runs `f` with exclusive access to the page bytes and marks the page
    /// dirty.
    pub fn update<R>(&self, f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R) -> R {
        self.mark_dirty();
        f(&mut self.buf.write())
    }
}
