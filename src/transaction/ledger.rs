//! The on-disk transaction ledger.
//!
//! One file per database (`<path>.xid`) records the state of every
//! transaction ever begun: an 8-byte counter header followed by one status
//! byte per xid. Status transitions are one-way (active -> committed or
//! aborted); the ledger trusts its callers not to transition twice.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::transaction::id::{Xid, SUPER_XID};

/// File name suffix for ledger files.
pub const LEDGER_SUFFIX: &str = ".xid";

const HEADER_LEN: u64 = 8;

/// Per-xid state as stored in the ledger file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Active = 0,
    Committed = 1,
    Aborted = 2,
}

impl TxStatus {
    fn from_byte(b: u8) -> TxStatus {
        match b {
            0 => TxStatus::Active,
            1 => TxStatus::Committed,
            _ => TxStatus::Aborted,
        }
    }
}

struct LedgerFile {
    file: File,
    counter: u64,
}

/// File-backed transaction ledger.
pub struct XidLedger {
    inner: Mutex<LedgerFile>,
}

impl XidLedger {
    /// Creates a fresh ledger at `<path>.xid` with a zeroed counter.
    pub fn create(path: &Path) -> Result<XidLedger> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(ledger_path(path))?;

        file.write_u64::<LittleEndian>(0)?;
        file.sync_all()?;

        Ok(XidLedger {
            inner: Mutex::new(LedgerFile { file, counter: 0 }),
        })
    }

    /// Opens an existing ledger, validating that the header counter agrees
    /// with the file length. A mismatch means the file was tampered with or
    /// torn below the durability guarantees and is fatal.
    pub fn open(path: &Path) -> Result<XidLedger> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(ledger_path(path))?;

        let len = file.metadata()?.len();
        if len < HEADER_LEN {
            return Err(Error::CorruptLedger);
        }

        file.seek(SeekFrom::Start(0))?;
        let counter = file.read_u64::<LittleEndian>()?;
        if HEADER_LEN + counter != len {
            return Err(Error::CorruptLedger);
        }

        Ok(XidLedger {
            inner: Mutex::new(LedgerFile { file, counter }),
        })
    }

    /// Begins a new transaction: the active byte and the bumped counter are
    /// durable before the xid is handed out.
    pub fn begin(&self) -> Result<Xid> {
        let mut inner = self.inner.lock();
        let xid = Xid(inner.counter + 1);

        write_status(&mut inner.file, xid, TxStatus::Active)?;
        inner.counter += 1;
        let counter = inner.counter;
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_u64::<LittleEndian>(counter)?;
        inner.file.sync_data()?;

        Ok(xid)
    }

    /// Marks a transaction committed.
    pub fn commit(&self, xid: Xid) -> Result<()> {
        let mut inner = self.inner.lock();
        write_status(&mut inner.file, xid, TxStatus::Committed)?;
        inner.file.sync_data()?;
        Ok(())
    }

    /// Marks a transaction aborted.
    pub fn abort(&self, xid: Xid) -> Result<()> {
        let mut inner = self.inner.lock();
        write_status(&mut inner.file, xid, TxStatus::Aborted)?;
        inner.file.sync_data()?;
        Ok(())
    }

    pub fn is_active(&self, xid: Xid) -> Result<bool> {
        if xid == SUPER_XID {
            return Ok(false);
        }
        Ok(self.status(xid)? == TxStatus::Active)
    }

    pub fn is_committed(&self, xid: Xid) -> Result<bool> {
        if xid == SUPER_XID {
            return Ok(true);
        }
        Ok(self.status(xid)? == TxStatus::Committed)
    }

    pub fn is_aborted(&self, xid: Xid) -> Result<bool> {
        if xid == SUPER_XID {
            return Ok(false);
        }
        Ok(self.status(xid)? == TxStatus::Aborted)
    }

    fn status(&self, xid: Xid) -> Result<TxStatus> {
        let mut inner = self.inner.lock();
        inner.file.seek(SeekFrom::Start(status_pos(xid)))?;
        let mut buf = [0u8; 1];
        inner.file.read_exact(&mut buf)?;
        Ok(TxStatus::from_byte(buf[0]))
    }
}

fn ledger_path(path: &Path) -> std::path::PathBuf {
    let mut p = path.as_os_str().to_os_string();
    p.push(LEDGER_SUFFIX);
    p.into()
}

fn status_pos(xid: Xid) -> u64 {
    HEADER_LEN + (xid.0 - 1)
}

fn write_status(file: &mut File, xid: Xid, status: TxStatus) -> Result<()> {
    file.seek(SeekFrom::Start(status_pos(xid)))?;
    file.write_all(&[status as u8])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_begin_commit_abort() -> Result<()> {
        let dir = tempdir()?;
        let base = dir.path().join("test");
        let ledger = XidLedger::create(&base)?;

        let x1 = ledger.begin()?;
        let x2 = ledger.begin()?;
        assert_eq!(x1, Xid(1));
        assert_eq!(x2, Xid(2));
        assert!(ledger.is_active(x1)?);
        assert!(ledger.is_active(x2)?);

        ledger.commit(x1)?;
        assert!(ledger.is_committed(x1)?);
        assert!(!ledger.is_active(x1)?);

        ledger.abort(x2)?;
        assert!(ledger.is_aborted(x2)?);
        assert!(!ledger.is_committed(x2)?);

        Ok(())
    }

    #[test]
    fn test_super_xid_statuses() -> Result<()> {
        let dir = tempdir()?;
        let ledger = XidLedger::create(&dir.path().join("test"))?;

        assert!(ledger.is_committed(SUPER_XID)?);
        assert!(!ledger.is_active(SUPER_XID)?);
        assert!(!ledger.is_aborted(SUPER_XID)?);

        Ok(())
    }

    #[test]
    fn test_state_survives_reopen() -> Result<()> {
        let dir = tempdir()?;
        let base = dir.path().join("test");

        let (x1, x2, x3) = {
            let ledger = XidLedger::create(&base)?;
            let x1 = ledger.begin()?;
            let x2 = ledger.begin()?;
            let x3 = ledger.begin()?;
            ledger.commit(x1)?;
            ledger.abort(x2)?;
            (x1, x2, x3)
        };

        let ledger = XidLedger::open(&base)?;
        assert!(ledger.is_committed(x1)?);
        assert!(ledger.is_aborted(x2)?);
        assert!(ledger.is_active(x3)?);
        assert_eq!(ledger.begin()?, Xid(4));

        Ok(())
    }

    #[test]
    fn test_corrupt_header_is_fatal() -> Result<()> {
        let dir = tempdir()?;
        let base = dir.path().join("test");
        {
            let ledger = XidLedger::create(&base)?;
            ledger.begin()?;
        }

        // Grow the file without touching the counter.
        let mut file = OpenOptions::new()
            .append(true)
            .open(ledger_path(&base))?;
        file.write_all(&[0u8; 4])?;
        drop(file);

        assert!(matches!(
            XidLedger::open(&base),
            Err(Error::CorruptLedger)
        ));

        Ok(())
    }

    #[test]
    fn test_truncated_header_is_fatal() -> Result<()> {
        let dir = tempdir()?;
        let base = dir.path().join("test");
        std::fs::write(ledger_path(&base), [0u8; 3])?;

        assert!(matches!(
            XidLedger::open(&base),
            Err(Error::CorruptLedger)
        ));

        Ok(())
    }

    #[test]
    fn test_concurrent_begin_unique_xids() -> Result<()> {
        use std::sync::Arc;
        use std::thread;

        let dir = tempdir()?;
        let ledger = Arc::new(XidLedger::create(&dir.path().join("test"))?);

        let mut handles = vec![];
        for _ in 0..8 {
            let ledger = Arc::clone(&ledger);
            handles.push(thread::spawn(move || {
                let mut xids = vec![];
                for _ in 0..25 {
                    xids.push(ledger.begin().unwrap());
                }
                xids
            }));
        }

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .map(|x| x.value())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 200);

        Ok(())
    }
}
