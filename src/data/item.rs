//! Stored records ("items") and the write bracket that keeps them
//! crash-consistent.
//!
//! Raw item layout inside a page: `[valid:1][size:2][payload]`. The valid
//! byte is 0 for a live record and 1 for a tombstone; items are never
//! physically removed or resized once written.

use std::sync::Arc;

use parking_lot::{RwLock, RwLockWriteGuard};

use crate::data::DataManager;
use crate::error::{Error, Result};
use crate::storage::page::{record_page, Page, PageNo, PAGE_SIZE};
use crate::transaction::Xid;

pub(crate) const HEADER_LEN: usize = 3;
const OFF_SIZE: usize = 1;

/// A 64-bit record address: page number in the high half, in-page byte
/// offset in the low half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(pub u64);

impl RecordId {
    pub fn new(no: PageNo, offset: u16) -> RecordId {
        RecordId((no.0 as u64) << 32 | offset as u64)
    }

    pub fn page_no(&self) -> PageNo {
        PageNo((self.0 >> 32) as u32)
    }

    pub fn offset(&self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.page_no(), self.offset())
    }
}

/// Wraps a payload in the on-page item format.
pub fn wrap_raw(payload: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(HEADER_LEN + payload.len());
    raw.push(0);
    raw.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    raw.extend_from_slice(payload);
    raw
}

/// Flips a raw item image to its tombstoned form (recovery undo).
pub fn set_raw_invalid(raw: &mut [u8]) {
    raw[0] = 1;
}

/// A record resident in the page cache.
///
/// The item pins its page for as long as it is cached; the data manager's
/// item cache releases the pin on eviction. Readers take the latch shared;
/// an [`ItemWriter`] holds it exclusively for the whole mutation bracket.
pub struct DataItem {
    id: RecordId,
    page: Arc<Page>,
    offset: usize,
    len: usize,
    latch: RwLock<()>,
}

impl DataItem {
    /// Parses the item at `id` out of its (already pinned) page. Addresses
    /// that do not point at a plausible record report `NotFound`.
    pub(crate) fn parse(page: Arc<Page>, id: RecordId) -> Result<DataItem> {
        let offset = id.offset() as usize;
        if offset < 2 || offset + HEADER_LEN > PAGE_SIZE {
            return Err(Error::NotFound);
        }

        let (size, fso) = page.with(|buf| {
            (
                u16::from_le_bytes([buf[offset + OFF_SIZE], buf[offset + OFF_SIZE + 1]]) as usize,
                u16::from_le_bytes([buf[0], buf[1]]) as usize,
            )
        });
        let len = HEADER_LEN + size;
        if offset + len > PAGE_SIZE || offset + len > fso {
            return Err(Error::NotFound);
        }

        Ok(DataItem {
            id,
            page,
            offset,
            len,
            latch: RwLock::new(()),
        })
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    pub(crate) fn page(&self) -> &Arc<Page> {
        &self.page
    }

    /// Whether the record is live (not tombstoned).
    pub fn is_valid(&self) -> bool {
        let _r = self.latch.read();
        self.page.with(|buf| buf[self.offset] == 0)
    }

    /// Runs `f` over the item payload under the shared latch.
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let _r = self.latch.read();
        self.page
            .with(|buf| f(&buf[self.offset + HEADER_LEN..self.offset + self.len]))
    }

    /// Copies the item payload.
    pub fn payload(&self) -> Vec<u8> {
        self.read(|data| data.to_vec())
    }

    /// Copies the full raw image including the item header.
    pub(crate) fn raw(&self) -> Vec<u8> {
        self.page
            .with(|buf| buf[self.offset..self.offset + self.len].to_vec())
    }

    pub(crate) fn begin_write<'a>(
        &'a self,
        dm: &'a DataManager,
    ) -> ItemWriter<'a> {
        let latch = self.latch.write();
        self.page.mark_dirty();
        let old = self.raw();
        ItemWriter {
            dm,
            item: self,
            old,
            done: false,
            _latch: latch,
        }
    }
}

/// An exclusive mutation bracket over one item.
///
/// The writer snapshots the item's raw image on creation. `commit` appends
/// the before/after images to the WAL; `rollback` (or dropping the writer)
/// restores the old image in memory. Either way the latch is released when
/// the writer goes away.
pub struct ItemWriter<'a> {
    dm: &'a DataManager,
    item: &'a DataItem,
    old: Vec<u8>,
    done: bool,
    _latch: RwLockWriteGuard<'a, ()>,
}

impl ItemWriter<'_> {
    /// Mutates the item payload in place.
    pub fn mutate<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let offset = self.item.offset;
        let len = self.item.len;
        self.item
            .page
            .update(|buf| f(&mut buf[offset + HEADER_LEN..offset + len]))
    }

    /// Reads the item payload within the bracket.
    pub fn inspect<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let offset = self.item.offset;
        let len = self.item.len;
        self.item
            .page
            .with(|buf| f(&buf[offset + HEADER_LEN..offset + len]))
    }

    /// Makes the mutation durable: appends the update record on behalf of
    /// `xid` and keeps the new image.
    pub fn commit(mut self, xid: Xid) -> Result<()> {
        self.done = true;
        self.dm.log_update(xid, self.item, &self.old)
    }

    /// Discards the mutation, restoring the old image in memory.
    pub fn rollback(mut self) {
        self.restore();
        self.done = true;
    }

    fn restore(&self) {
        let offset = self.item.offset;
        let old = &self.old;
        self.item
            .page
            .update(|buf| buf[offset..offset + old.len()].copy_from_slice(old));
    }
}

impl Drop for ItemWriter<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.restore();
        }
    }
}

/// Largest payload that fits a single page once wrapped.
pub fn max_payload() -> usize {
    record_page::CAPACITY - HEADER_LEN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_id_packing() {
        let id = RecordId::new(PageNo(7), 513);
        assert_eq!(id.page_no(), PageNo(7));
        assert_eq!(id.offset(), 513);
        assert_eq!(RecordId(id.value()), id);
        assert_eq!(format!("{}", id), "page7@513");
    }

    #[test]
    fn test_wrap_raw() {
        let raw = wrap_raw(b"abc");
        assert_eq!(raw, vec![0, 3, 0, b'a', b'b', b'c']);

        let mut dead = raw.clone();
        set_raw_invalid(&mut dead);
        assert_eq!(dead[0], 1);
    }

    #[test]
    fn test_parse_and_read() -> Result<()> {
        let page = Arc::new(Page::new(PageNo(2), record_page::init_raw()));
        let offset = record_page::append(&page, &wrap_raw(b"payload"));
        let id = RecordId::new(PageNo(2), offset);

        let item = DataItem::parse(Arc::clone(&page), id)?;
        assert!(item.is_valid());
        assert_eq!(item.payload(), b"payload");
        assert_eq!(item.raw(), wrap_raw(b"payload"));

        Ok(())
    }

    #[test]
    fn test_parse_rejects_bad_addresses() {
        let page = Arc::new(Page::new(PageNo(2), record_page::init_raw()));
        record_page::append(&page, &wrap_raw(b"x"));

        // Offset inside the page but past the used region.
        let past = RecordId::new(PageNo(2), 4000);
        assert!(matches!(
            DataItem::parse(Arc::clone(&page), past),
            Err(Error::NotFound)
        ));

        // Offset inside the fso header.
        let header = RecordId::new(PageNo(2), 0);
        assert!(matches!(
            DataItem::parse(Arc::clone(&page), header),
            Err(Error::NotFound)
        ));
    }
}
