//! Free-space index over data pages.
//!
//! Pages are bucketed by free bytes in units of 1/32 of the page size. A
//! page is removed from the index while an insert holds it and re-added with
//! its updated free space afterwards, so a page is never handed to two
//! inserters at once.

use parking_lot::Mutex;

use crate::storage::page::{PageNo, PAGE_SIZE};

const BUCKETS: usize = 32;
const BUCKET_SIZE: usize = PAGE_SIZE / BUCKETS;

/// A page together with its known free byte count.
#[derive(Debug, Clone, Copy)]
pub struct PageSpace {
    pub page_no: PageNo,
    pub free: usize,
}

pub struct FreeSpaceIndex {
    buckets: Mutex<[Vec<PageSpace>; BUCKETS + 1]>,
}

impl FreeSpaceIndex {
    pub fn new() -> FreeSpaceIndex {
        FreeSpaceIndex {
            buckets: Mutex::new(std::array::from_fn(|_| Vec::new())),
        }
    }

    /// Registers `page_no` as having `free` bytes available.
    pub fn add(&self, page_no: PageNo, free: usize) {
        let mut buckets = self.buckets.lock();
        buckets[free / BUCKET_SIZE].push(PageSpace { page_no, free });
    }

    /// Removes and returns a page with at least `size` free bytes.
    pub fn take(&self, size: usize) -> Option<PageSpace> {
        let mut buckets = self.buckets.lock();
        let first = size / BUCKET_SIZE;

        // The request's own bucket may hold pages on either side of `size`;
        // every higher bucket is sufficient by construction.
        if let Some(i) = buckets[first].iter().position(|ps| ps.free >= size) {
            return Some(buckets[first].swap_remove(i));
        }
        for bucket in first + 1..=BUCKETS {
            if let Some(ps) = buckets[bucket].pop() {
                return Some(ps);
            }
        }
        None
    }
}

impl Default for FreeSpaceIndex {
    fn default() -> Self {
        Self::new()
    }
}
