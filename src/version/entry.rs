//! MVCC entries: versioned views over stored records.
//!
//! Entry payload layout inside an item: `[xmin:8][xmax:8][data]`. `xmin` is
//! the creating transaction and never changes; `xmax` is the deleting
//! transaction, 0 while the version is undeleted.

use std::sync::Arc;

use crate::data::{DataItem, DataManager, RecordId};
use crate::error::Result;
use crate::transaction::Xid;

const OFF_XMIN: usize = 0;
const OFF_XMAX: usize = 8;
const OFF_DATA: usize = 16;

/// Builds the entry image for a fresh insert by `xid`.
pub fn wrap(data: &[u8], xid: Xid) -> Vec<u8> {
    let mut raw = Vec::with_capacity(OFF_DATA + data.len());
    raw.extend_from_slice(&xid.0.to_le_bytes());
    raw.extend_from_slice(&0u64.to_le_bytes());
    raw.extend_from_slice(data);
    raw
}

/// A versioned record, pinned in the data manager's item cache while held.
pub struct Entry {
    id: RecordId,
    item: Arc<DataItem>,
}

impl Entry {
    pub fn new(id: RecordId, item: Arc<DataItem>) -> Entry {
        Entry { id, item }
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn xmin(&self) -> Xid {
        Xid(self
            .item
            .read(|p| u64::from_le_bytes(p[OFF_XMIN..OFF_XMAX].try_into().unwrap())))
    }

    pub fn xmax(&self) -> Xid {
        Xid(self
            .item
            .read(|p| u64::from_le_bytes(p[OFF_XMAX..OFF_DATA].try_into().unwrap())))
    }

    /// Copies the user data carried by this version.
    pub fn data(&self) -> Vec<u8> {
        self.item.read(|p| p[OFF_DATA..].to_vec())
    }

    /// Stamps `xid` as the deleting transaction, through the WAL-backed
    /// mutation bracket.
    pub fn set_xmax(&self, xid: Xid, dm: &DataManager) -> Result<()> {
        let mut w = dm.write_item(&self.item);
        w.mutate(|p| p[OFF_XMAX..OFF_DATA].copy_from_slice(&xid.0.to_le_bytes()));
        w.commit(xid)
    }
}
