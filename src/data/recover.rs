//! Crash recovery: log record encoding and the redo/undo replay passes.

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};

use crate::data::item;
use crate::error::{Error, Result};
use crate::storage::page::{record_page, PageNo};
use crate::storage::{PageCache, Wal};
use crate::transaction::{Xid, XidLedger};

const TYPE_INSERT: u8 = 0;
const TYPE_UPDATE: u8 = 1;

/// A decoded WAL record.
///
/// Insert records carry the full item image so redo can rebuild a page that
/// never reached disk; update records carry equal-length before and after
/// images of the item's raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Insert {
        xid: Xid,
        page_no: PageNo,
        offset: u16,
        raw: Vec<u8>,
    },
    Update {
        xid: Xid,
        id: crate::data::RecordId,
        old: Vec<u8>,
        new: Vec<u8>,
    },
}

impl LogRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        match self {
            LogRecord::Insert {
                xid,
                page_no,
                offset,
                raw,
            } => {
                buf.put_u8(TYPE_INSERT);
                buf.put_u64_le(xid.0);
                buf.put_u32_le(page_no.0);
                buf.put_u16_le(*offset);
                buf.put_slice(raw);
            }
            LogRecord::Update { xid, id, old, new } => {
                debug_assert_eq!(old.len(), new.len());
                buf.put_u8(TYPE_UPDATE);
                buf.put_u64_le(xid.0);
                buf.put_u64_le(id.0);
                buf.put_slice(old);
                buf.put_slice(new);
            }
        }
        buf.to_vec()
    }

    pub fn decode(payload: &[u8]) -> Result<LogRecord> {
        let mut buf = payload;
        if buf.remaining() < 9 {
            return Err(Error::CorruptLog);
        }
        let kind = buf.get_u8();
        let xid = Xid(buf.get_u64_le());
        match kind {
            TYPE_INSERT => {
                if buf.remaining() < 6 {
                    return Err(Error::CorruptLog);
                }
                let page_no = PageNo(buf.get_u32_le());
                let offset = buf.get_u16_le();
                Ok(LogRecord::Insert {
                    xid,
                    page_no,
                    offset,
                    raw: buf.to_vec(),
                })
            }
            TYPE_UPDATE => {
                if buf.remaining() < 8 || (buf.remaining() - 8) % 2 != 0 {
                    return Err(Error::CorruptLog);
                }
                let id = crate::data::RecordId(buf.get_u64_le());
                let half = buf.remaining() / 2;
                Ok(LogRecord::Update {
                    xid,
                    id,
                    old: buf[..half].to_vec(),
                    new: buf[half..].to_vec(),
                })
            }
            _ => Err(Error::CorruptLog),
        }
    }

    fn xid(&self) -> Xid {
        match self {
            LogRecord::Insert { xid, .. } => *xid,
            LogRecord::Update { xid, .. } => *xid,
        }
    }

    fn page_no(&self) -> PageNo {
        match self {
            LogRecord::Insert { page_no, .. } => *page_no,
            LogRecord::Update { id, .. } => id.page_no(),
        }
    }
}

/// Replays the log after an unclean shutdown: committed and aborted work is
/// re-applied, in-flight work is unwound and its transactions marked
/// aborted.
pub fn recover(ledger: &XidLedger, wal: &Wal, pages: &PageCache) -> Result<()> {
    log::info!("unclean shutdown detected, recovering");

    wal.rewind();
    let mut records = Vec::new();
    let mut max_page = PageNo(1);
    while let Some(payload) = wal.next()? {
        let record = LogRecord::decode(&payload)?;
        max_page = max_page.max(record.page_no());
        records.push(record);
    }

    // Pages allocated but never durably logged are discarded.
    pages.truncate_to(max_page)?;
    log::info!("page file truncated to {}", max_page);

    redo(ledger, pages, &records)?;
    undo(ledger, pages, &records)?;

    log::info!("recovery complete ({} log records)", records.len());
    Ok(())
}

fn redo(ledger: &XidLedger, pages: &PageCache, records: &[LogRecord]) -> Result<()> {
    for record in records {
        if ledger.is_active(record.xid())? {
            continue;
        }
        match record {
            LogRecord::Insert {
                page_no,
                offset,
                raw,
                ..
            } => with_page(pages, *page_no, |page| {
                record_page::recover_append(page, raw, *offset);
            })?,
            LogRecord::Update { id, new, .. } => with_page(pages, id.page_no(), |page| {
                record_page::recover_patch(page, new, id.offset());
            })?,
        }
    }
    Ok(())
}

fn undo(ledger: &XidLedger, pages: &PageCache, records: &[LogRecord]) -> Result<()> {
    let mut in_flight: HashMap<Xid, Vec<&LogRecord>> = HashMap::new();
    for record in records {
        if ledger.is_active(record.xid())? {
            in_flight.entry(record.xid()).or_default().push(record);
        }
    }

    for (xid, records) in &in_flight {
        for record in records.iter().rev() {
            match record {
                LogRecord::Insert {
                    page_no,
                    offset,
                    raw,
                    ..
                } => {
                    let mut dead = raw.clone();
                    item::set_raw_invalid(&mut dead);
                    with_page(pages, *page_no, |page| {
                        record_page::recover_append(page, &dead, *offset);
                    })?;
                }
                LogRecord::Update { id, old, .. } => {
                    with_page(pages, id.page_no(), |page| {
                        record_page::recover_patch(page, old, id.offset());
                    })?;
                }
            }
        }
        ledger.abort(*xid)?;
        log::info!("rolled back in-flight transaction {}", xid);
    }
    Ok(())
}

fn with_page(
    pages: &PageCache,
    no: PageNo,
    f: impl FnOnce(&crate::storage::Page),
) -> Result<()> {
    let page = pages.get(no)?;
    f(&page);
    pages.release(no)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::RecordId;

    #[test]
    fn test_insert_record_round_trip() -> Result<()> {
        let record = LogRecord::Insert {
            xid: Xid(7),
            page_no: PageNo(3),
            offset: 130,
            raw: vec![0, 2, 0, 0xaa, 0xbb],
        };
        assert_eq!(LogRecord::decode(&record.encode())?, record);
        Ok(())
    }

    #[test]
    fn test_update_record_round_trip() -> Result<()> {
        let record = LogRecord::Update {
            xid: Xid(9),
            id: RecordId::new(PageNo(4), 258),
            old: vec![1, 2, 3],
            new: vec![4, 5, 6],
        };
        assert_eq!(LogRecord::decode(&record.encode())?, record);
        Ok(())
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(LogRecord::decode(&[]).is_err());
        assert!(LogRecord::decode(&[9, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
        // Update with odd image bytes.
        let mut bad = LogRecord::Update {
            xid: Xid(1),
            id: RecordId(0),
            old: vec![1],
            new: vec![2],
        }
        .encode();
        bad.push(0xff);
        assert!(LogRecord::decode(&bad).is_err());
    }
}
