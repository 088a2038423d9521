//! The database facade: the boundary consumed by schema and query layers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::data::{DataManager, RecordId};
use crate::error::Result;
use crate::transaction::{Xid, XidLedger};
use crate::version::{IsolationLevel, VersionManager};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Options {
    /// Page cache budget in bytes; converted to pages, minimum 10.
    pub cache_bytes: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            cache_bytes: 64 << 20,
        }
    }
}

/// A single-file transactional record store.
///
/// All state lives under one path prefix: `<path>.xid` (ledger),
/// `<path>.log` (WAL) and `<path>.db` (pages).
pub struct Database {
    path: PathBuf,
    ledger: Arc<XidLedger>,
    dm: Arc<DataManager>,
    vm: VersionManager,
}

impl Database {
    /// Creates a new database at the path prefix.
    pub fn create(path: &Path, options: Options) -> Result<Database> {
        let ledger = Arc::new(XidLedger::create(path)?);
        let dm = Arc::new(DataManager::create(path, options.cache_bytes)?);
        Ok(Self::assemble(path, ledger, dm))
    }

    /// Opens an existing database, recovering from an unclean shutdown if
    /// necessary.
    pub fn open(path: &Path, options: Options) -> Result<Database> {
        let ledger = Arc::new(XidLedger::open(path)?);
        let dm = Arc::new(DataManager::open(path, options.cache_bytes, &ledger)?);
        Ok(Self::assemble(path, ledger, dm))
    }

    fn assemble(path: &Path, ledger: Arc<XidLedger>, dm: Arc<DataManager>) -> Database {
        Database {
            path: path.to_path_buf(),
            vm: VersionManager::new(Arc::clone(&ledger), Arc::clone(&dm)),
            ledger,
            dm,
        }
    }

    /// Starts a transaction.
    pub fn begin(&self, level: IsolationLevel) -> Result<Xid> {
        self.vm.begin(level)
    }

    /// Commits a transaction.
    pub fn commit(&self, xid: Xid) -> Result<()> {
        self.vm.commit(xid)
    }

    /// Aborts a transaction.
    pub fn abort(&self, xid: Xid) -> Result<()> {
        self.vm.abort(xid)
    }

    /// Reads the record at `id` as seen by `xid`.
    pub fn read(&self, xid: Xid, id: RecordId) -> Result<Option<Vec<u8>>> {
        self.vm.read(xid, id)
    }

    /// Stores `data`, returning the new record's address.
    pub fn insert(&self, xid: Xid, data: &[u8]) -> Result<RecordId> {
        self.vm.insert(xid, data)
    }

    /// Logically deletes the record at `id`; false if nothing visible.
    pub fn delete(&self, xid: Xid, id: RecordId) -> Result<bool> {
        self.vm.delete(xid, id)
    }

    /// The underlying data manager, for layers (like the index) that store
    /// their own records.
    pub fn data(&self) -> &Arc<DataManager> {
        &self.dm
    }

    /// The transaction ledger.
    pub fn ledger(&self) -> &Arc<XidLedger> {
        &self.ledger
    }

    /// Flushes everything and marks the shutdown clean.
    pub fn close(&self) -> Result<()> {
        self.vm.close()?;
        self.dm.close()?;
        log::info!("database {} closed", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tempfile::tempdir;

    fn small() -> Options {
        Options {
            cache_bytes: 1 << 20,
        }
    }

    #[test]
    fn test_facade_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let db = Database::create(&dir.path().join("test"), small())?;

        let xid = db.begin(IsolationLevel::ReadCommitted)?;
        let id = db.insert(xid, b"row one")?;
        assert_eq!(db.read(xid, id)?.as_deref(), Some(&b"row one"[..]));
        db.commit(xid)?;

        let xid = db.begin(IsolationLevel::ReadCommitted)?;
        assert_eq!(db.read(xid, id)?.as_deref(), Some(&b"row one"[..]));
        assert!(db.delete(xid, id)?);
        assert_eq!(db.read(xid, id)?, None);
        db.commit(xid)?;

        db.close()?;
        Ok(())
    }

    #[test]
    fn test_abort_hides_insert() -> Result<()> {
        let dir = tempdir()?;
        let db = Database::create(&dir.path().join("test"), small())?;

        let xid = db.begin(IsolationLevel::ReadCommitted)?;
        let id = db.insert(xid, b"ghost")?;
        db.abort(xid)?;

        let xid = db.begin(IsolationLevel::ReadCommitted)?;
        assert_eq!(db.read(xid, id)?, None);
        db.commit(xid)?;

        db.close()?;
        Ok(())
    }

    #[test]
    fn test_cache_budget_too_small() -> Result<()> {
        let dir = tempdir()?;
        let result = Database::create(
            &dir.path().join("test"),
            Options { cache_bytes: 1024 },
        );
        assert!(matches!(result, Err(Error::CacheTooSmall { .. })));
        Ok(())
    }

    #[test]
    fn test_unknown_transaction() -> Result<()> {
        let dir = tempdir()?;
        let db = Database::create(&dir.path().join("test"), small())?;

        assert!(matches!(
            db.commit(Xid(99)),
            Err(Error::NoSuchTransaction(99))
        ));

        db.close()?;
        Ok(())
    }
}
