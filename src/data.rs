//! The data manager: durable record storage on top of the page cache, the
//! write-ahead log and the free-space index.
//!
//! Records are placed by the free-space index, logged before the page is
//! touched, and mutated only inside an [`ItemWriter`] bracket so every
//! change is either logged or rolled back in memory.

pub mod free_space;
pub mod item;
pub mod recover;

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::{CacheSource, RefCache};
use crate::error::{Error, Result};
use crate::storage::page::{first_page, record_page, Page, PageNo};
use crate::storage::{PageCache, Wal};
use crate::transaction::{Xid, XidLedger};

pub use free_space::FreeSpaceIndex;
pub use item::{DataItem, ItemWriter, RecordId};
pub use recover::LogRecord;

/// How many fresh pages an insert will allocate before giving up.
const ALLOC_ATTEMPTS: usize = 5;

pub(crate) struct ItemSource {
    pages: Arc<PageCache>,
}

impl CacheSource for ItemSource {
    type Key = RecordId;
    type Item = DataItem;

    fn load(&self, id: RecordId) -> Result<DataItem> {
        let no = id.page_no();
        if no.0 < 2 || no.0 > self.pages.page_count() {
            return Err(Error::NotFound);
        }

        let page = self.pages.get(no)?;
        match DataItem::parse(Arc::clone(&page), id) {
            Ok(item) => Ok(item),
            Err(e) => {
                self.pages.release(no)?;
                Err(e)
            }
        }
    }

    fn evict(&self, _id: RecordId, it: &DataItem) -> Result<()> {
        self.pages.release(it.page().no())
    }
}

/// Durable, WAL-protected record storage.
pub struct DataManager {
    pages: Arc<PageCache>,
    wal: Wal,
    free: FreeSpaceIndex,
    items: RefCache<ItemSource>,
    first_page: Mutex<Option<Arc<Page>>>,
}

impl DataManager {
    /// Creates the page file and log for a fresh database.
    pub fn create(path: &Path, mem_bytes: usize) -> Result<DataManager> {
        let pages = Arc::new(PageCache::create(path, mem_bytes)?);
        let wal = Wal::create(path)?;
        let dm = Self::assemble(pages, wal);

        let no = dm.pages.new_page(first_page::init_raw())?;
        debug_assert_eq!(no, PageNo(1));
        let page1 = dm.pages.get(no)?;
        dm.pages.flush_page(&page1)?;
        *dm.first_page.lock() = Some(page1);

        log::info!("created database at {}", path.display());
        Ok(dm)
    }

    /// Opens an existing database, running recovery if the previous run did
    /// not shut down cleanly.
    pub fn open(path: &Path, mem_bytes: usize, ledger: &XidLedger) -> Result<DataManager> {
        let pages = Arc::new(PageCache::open(path, mem_bytes)?);
        let wal = Wal::open(path)?;
        let dm = Self::assemble(pages, wal);

        let page1 = dm.pages.get(PageNo(1))?;
        if !first_page::is_clean(&page1) {
            recover::recover(ledger, &dm.wal, &dm.pages)?;
        }
        dm.fill_free_index()?;

        first_page::stamp_open(&page1);
        dm.pages.flush_page(&page1)?;
        *dm.first_page.lock() = Some(page1);

        log::info!("opened database at {}", path.display());
        Ok(dm)
    }

    fn assemble(pages: Arc<PageCache>, wal: Wal) -> DataManager {
        DataManager {
            items: RefCache::new(
                ItemSource {
                    pages: Arc::clone(&pages),
                },
                0,
            ),
            pages,
            wal,
            free: FreeSpaceIndex::new(),
            first_page: Mutex::new(None),
        }
    }

    /// Stores `data` on behalf of `xid`, returning the record's address.
    pub fn insert(&self, xid: Xid, data: &[u8]) -> Result<RecordId> {
        let raw = item::wrap_raw(data);
        if raw.len() > record_page::CAPACITY {
            return Err(Error::DataTooLarge {
                size: data.len(),
                max: item::max_payload(),
            });
        }

        let mut chosen = None;
        for _ in 0..ALLOC_ATTEMPTS {
            if let Some(ps) = self.free.take(raw.len()) {
                chosen = Some(ps);
                break;
            }
            let no = self.pages.new_page(record_page::init_raw())?;
            self.free.add(no, record_page::CAPACITY);
        }
        let Some(ps) = chosen else {
            return Err(Error::DatabaseBusy);
        };

        let page = match self.pages.get(ps.page_no) {
            Ok(page) => page,
            Err(e) => {
                // The page stays indexed so its capacity is not lost.
                self.free.add(ps.page_no, 0);
                return Err(e);
            }
        };

        let result = (|| {
            let offset = record_page::free_space_offset(&page);
            self.wal.append(
                &LogRecord::Insert {
                    xid,
                    page_no: ps.page_no,
                    offset,
                    raw: raw.clone(),
                }
                .encode(),
            )?;
            let offset = record_page::append(&page, &raw);
            Ok(RecordId::new(ps.page_no, offset))
        })();

        let free_now = record_page::free_space(&page);
        self.pages.release(ps.page_no)?;
        self.free.add(ps.page_no, free_now);
        result
    }

    /// Fetches the record at `id`, or `None` if it was deleted or never
    /// existed. A returned item must be handed back via [`release`].
    ///
    /// [`release`]: DataManager::release
    pub fn read(&self, id: RecordId) -> Result<Option<Arc<DataItem>>> {
        let it = match self.items.get(id) {
            Ok(it) => it,
            Err(Error::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };

        if !it.is_valid() {
            self.items.release(id)?;
            return Ok(None);
        }
        Ok(Some(it))
    }

    /// Drops one reference to the record at `id`.
    pub fn release(&self, id: RecordId) -> Result<()> {
        self.items.release(id)
    }

    /// Opens an exclusive mutation bracket over `item`.
    pub fn write_item<'a>(&'a self, it: &'a DataItem) -> ItemWriter<'a> {
        it.begin_write(self)
    }

    pub(crate) fn log_update(&self, xid: Xid, it: &DataItem, old: &[u8]) -> Result<()> {
        self.wal.append(
            &LogRecord::Update {
                xid,
                id: it.id(),
                old: old.to_vec(),
                new: it.raw(),
            }
            .encode(),
        )
    }

    /// Flushes everything and stamps the first page closed.
    pub fn close(&self) -> Result<()> {
        self.items.close()?;

        if let Some(page1) = self.first_page.lock().take() {
            first_page::stamp_close(&page1);
            self.pages.flush_page(&page1)?;
            self.pages.release(PageNo(1))?;
        }
        self.pages.close()?;
        log::info!("data manager closed");
        Ok(())
    }

    fn fill_free_index(&self) -> Result<()> {
        for no in 2..=self.pages.page_count() {
            let no = PageNo(no);
            let page = self.pages.get(no)?;
            self.free.add(no, record_page::free_space(&page));
            self.pages.release(no)?;
        }
        Ok(())
    }
}
