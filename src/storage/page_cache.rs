//! The page buffer pool.
//!
//! A [`RefCache`] of [`Page`]s keyed by page number, backed by a single
//! [`PageFile`]. Pages come back with one reference held; callers pair every
//! `get` with a `release`. Dirty pages are flushed when their last reference
//! is released and when the cache closes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::cache::{CacheSource, RefCache};
use crate::error::{Error, Result};
use crate::storage::disk::PageFile;
use crate::storage::page::{Page, PageNo, PAGE_SIZE};

/// Fewer pages than this is a configuration error.
pub const MIN_CACHE_PAGES: usize = 10;

pub(crate) struct PageSource {
    file: Arc<PageFile>,
}

impl CacheSource for PageSource {
    type Key = PageNo;
    type Item = Page;

    fn load(&self, no: PageNo) -> Result<Page> {
        let mut buf = Box::new([0u8; PAGE_SIZE]);
        self.file.read_page(no, &mut buf)?;
        Ok(Page::new(no, buf))
    }

    fn evict(&self, _no: PageNo, page: &Page) -> Result<()> {
        flush(&self.file, page)
    }
}

fn flush(file: &PageFile, page: &Page) -> Result<()> {
    if page.is_dirty() {
        page.with(|buf| file.write_page(page.no(), buf))?;
        page.clear_dirty();
    }
    Ok(())
}

/// Fixed-capacity page pool over the database file.
pub struct PageCache {
    cache: RefCache<PageSource>,
    file: Arc<PageFile>,
    page_count: AtomicU32,
}

impl PageCache {
    pub fn create(path: &std::path::Path, mem_bytes: usize) -> Result<PageCache> {
        let file = Arc::new(PageFile::create(path)?);
        Self::with_file(file, mem_bytes)
    }

    pub fn open(path: &std::path::Path, mem_bytes: usize) -> Result<PageCache> {
        let file = Arc::new(PageFile::open(path)?);
        Self::with_file(file, mem_bytes)
    }

    fn with_file(file: Arc<PageFile>, mem_bytes: usize) -> Result<PageCache> {
        let capacity = mem_bytes / PAGE_SIZE;
        if capacity < MIN_CACHE_PAGES {
            return Err(Error::CacheTooSmall {
                min: MIN_CACHE_PAGES,
                got: capacity,
            });
        }

        let page_count = file.page_count()?;
        Ok(PageCache {
            cache: RefCache::new(
                PageSource {
                    file: Arc::clone(&file),
                },
                capacity,
            ),
            file,
            page_count: AtomicU32::new(page_count),
        })
    }

    /// Allocates the next page number and writes `data` straight through to
    /// disk, uncached.
    pub fn new_page(&self, data: Box<[u8; PAGE_SIZE]>) -> Result<PageNo> {
        let no = PageNo(self.page_count.fetch_add(1, Ordering::SeqCst) + 1);
        self.file.write_page(no, &data)?;
        Ok(no)
    }

    /// Fetches a page, pinning it until released.
    pub fn get(&self, no: PageNo) -> Result<Arc<Page>> {
        self.cache.get(no)
    }

    /// Releases one pin; the last release flushes a dirty page.
    pub fn release(&self, no: PageNo) -> Result<()> {
        self.cache.release(no)
    }

    /// Synchronously writes a page back regardless of pins.
    pub fn flush_page(&self, page: &Page) -> Result<()> {
        flush(&self.file, page)
    }

    /// Recovery only: discards every page above `max` and resets the
    /// allocation counter.
    pub fn truncate_to(&self, max: PageNo) -> Result<()> {
        self.file.truncate(max.0)?;
        self.page_count.store(max.0, Ordering::SeqCst);
        Ok(())
    }

    /// Number of pages currently allocated.
    pub fn page_count(&self) -> u32 {
        self.page_count.load(Ordering::SeqCst)
    }

    /// Flushes and drops every resident page.
    pub fn close(&self) -> Result<()> {
        self.cache.close()
    }
}
