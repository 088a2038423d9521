//! The ordinary data page format: `[fso:2][records...]`.
//!
//! The first two bytes hold the free space offset (FSO), the position where
//! the next record will be appended. Records are never moved or compacted;
//! deletion is a validity-byte tombstone inside the record itself.

use crate::storage::page::{Page, PAGE_SIZE};

const FSO_LEN: usize = 2;

/// Usable bytes per page.
pub const CAPACITY: usize = PAGE_SIZE - FSO_LEN;

/// Raw bytes for a fresh, empty data page.
pub fn init_raw() -> Box<[u8; PAGE_SIZE]> {
    let mut raw = Box::new([0u8; PAGE_SIZE]);
    set_fso_raw(&mut *raw, FSO_LEN as u16);
    raw
}

/// The page's current free space offset.
pub fn free_space_offset(page: &Page) -> u16 {
    page.with(|buf| fso_raw(buf))
}

/// Free bytes remaining on the page.
pub fn free_space(page: &Page) -> usize {
    PAGE_SIZE - free_space_offset(page) as usize
}

/// Appends `raw` at the free space offset, returning the offset it was
/// written at.
pub fn append(page: &Page, raw: &[u8]) -> u16 {
    page.update(|buf| {
        let offset = fso_raw(buf);
        buf[offset as usize..offset as usize + raw.len()].copy_from_slice(raw);
        set_fso_raw(buf, offset + raw.len() as u16);
        offset
    })
}

/// Recovery replay of an insert: writes `raw` at `offset` and advances the
/// FSO past it if the page had not caught up.
pub fn recover_append(page: &Page, raw: &[u8], offset: u16) {
    page.update(|buf| {
        buf[offset as usize..offset as usize + raw.len()].copy_from_slice(raw);
        let end = offset + raw.len() as u16;
        if fso_raw(buf) < end {
            set_fso_raw(buf, end);
        }
    });
}

/// Recovery replay of an update: overwrites bytes in place, FSO untouched.
pub fn recover_patch(page: &Page, raw: &[u8], offset: u16) {
    page.update(|buf| {
        buf[offset as usize..offset as usize + raw.len()].copy_from_slice(raw);
    });
}

fn fso_raw(buf: &[u8; PAGE_SIZE]) -> u16 {
    u16::from_le_bytes([buf[0], buf[1]])
}

fn set_fso_raw(buf: &mut [u8; PAGE_SIZE], fso: u16) {
    buf[0..FSO_LEN].copy_from_slice(&fso.to_le_bytes());
}
