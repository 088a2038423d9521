//! The reserved first page and its liveness stamp.
//!
//! On create/open an 8-byte random stamp is written at offset 100; on clean
//! close it is copied to offset 108. If the two fields differ at open time
//! the previous run did not shut down cleanly and recovery must run.

use rand::RngCore;

use crate::storage::page::{Page, PAGE_SIZE};

const STAMP_OFFSET: usize = 100;
const STAMP_LEN: usize = 8;

/// Raw bytes for a freshly created first page, already stamped open.
pub fn init_raw() -> Box<[u8; PAGE_SIZE]> {
    let mut raw = Box::new([0u8; PAGE_SIZE]);
    write_open_stamp(&mut *raw);
    raw
}

/// Stamps the page as open with a fresh random value.
pub fn stamp_open(page: &Page) {
    page.update(|buf| write_open_stamp(buf));
}

/// Copies the open stamp into the close field, marking a clean shutdown.
pub fn stamp_close(page: &Page) {
    page.update(|buf| {
        buf.copy_within(
            STAMP_OFFSET..STAMP_OFFSET + STAMP_LEN,
            STAMP_OFFSET + STAMP_LEN,
        );
    });
}

/// Whether the previous run closed cleanly.
pub fn is_clean(page: &Page) -> bool {
    page.with(|buf| {
        buf[STAMP_OFFSET..STAMP_OFFSET + STAMP_LEN]
            == buf[STAMP_OFFSET + STAMP_LEN..STAMP_OFFSET + 2 * STAMP_LEN]
    })
}

fn write_open_stamp(buf: &mut [u8; PAGE_SIZE]) {
    rand::thread_rng().fill_bytes(&mut buf[STAMP_OFFSET..STAMP_OFFSET + STAMP_LEN]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageNo;

    #[test]
    fn test_open_then_close_is_clean() {
        let page = Page::new(PageNo(1), init_raw());
        assert!(!is_clean(&page));

        stamp_close(&page);
        assert!(is_clean(&page));
    }

    #[test]
    fn test_reopen_breaks_cleanliness() {
        let page = Page::new(PageNo(1), init_raw());
        stamp_close(&page);
        assert!(is_clean(&page));

        stamp_open(&page);
        assert!(!is_clean(&page));
    }
}
