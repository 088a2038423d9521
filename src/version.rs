//! Multi-version concurrency control.
//!
//! The version manager wraps data-manager records in `[xmin][xmax][data]`
//! entries, enforces per-isolation-level visibility, and serializes
//! conflicting writers through the [`LockTable`]. A transaction whose lock
//! request deadlocks (or that would skip a committed version under
//! repeatable read) is poisoned and auto-aborted; the caller sees
//! [`Error::ConcurrentUpdate`].

pub mod entry;
pub mod lock_table;
pub mod visibility;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::cache::{CacheSource, RefCache};
use crate::data::{DataManager, RecordId};
use crate::error::{Error, Result};
use crate::transaction::{Xid, XidLedger, SUPER_XID};

pub use entry::Entry;
pub use lock_table::LockTable;

/// Supported isolation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Each read sees data committed at the time of the read.
    ReadCommitted,
    /// All reads see the snapshot taken when the transaction began.
    RepeatableRead,
}

impl IsolationLevel {
    /// Decodes the wire value used at the external boundary (0/1).
    pub fn from_code(code: u8) -> IsolationLevel {
        match code {
            0 => IsolationLevel::ReadCommitted,
            _ => IsolationLevel::RepeatableRead,
        }
    }

    pub fn uses_snapshot(&self) -> bool {
        matches!(self, IsolationLevel::RepeatableRead)
    }
}

/// Book-keeping for one in-progress transaction.
pub struct ActiveTransaction {
    pub xid: Xid,
    pub level: IsolationLevel,
    snapshot: Option<HashSet<Xid>>,
    poisoned: AtomicBool,
    auto_aborted: AtomicBool,
}

impl ActiveTransaction {
    fn new(xid: Xid, level: IsolationLevel, active: &[Xid]) -> ActiveTransaction {
        let snapshot = level.uses_snapshot().then(|| {
            active
                .iter()
                .copied()
                .filter(|x| *x != SUPER_XID)
                .collect()
        });
        ActiveTransaction {
            xid,
            level,
            snapshot,
            poisoned: AtomicBool::new(false),
            auto_aborted: AtomicBool::new(false),
        }
    }

    /// Whether `xid` was active when this transaction began.
    pub fn in_snapshot(&self, xid: Xid) -> bool {
        if xid == SUPER_XID {
            return false;
        }
        self.snapshot.as_ref().is_some_and(|s| s.contains(&xid))
    }

    fn poison(&self) {
        self.poisoned.store(true, Ordering::SeqCst);
    }

    fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }
}

struct EntrySource {
    dm: Arc<DataManager>,
}

impl CacheSource for EntrySource {
    type Key = RecordId;
    type Item = Entry;

    fn load(&self, id: RecordId) -> Result<Entry> {
        match self.dm.read(id)? {
            Some(item) => Ok(Entry::new(id, item)),
            None => Err(Error::NotFound),
        }
    }

    fn evict(&self, id: RecordId, _entry: &Entry) -> Result<()> {
        self.dm.release(id)
    }
}

/// The MVCC layer over the data manager.
pub struct VersionManager {
    ledger: Arc<XidLedger>,
    dm: Arc<DataManager>,
    active: DashMap<Xid, Arc<ActiveTransaction>>,
    entries: RefCache<EntrySource>,
    locks: LockTable,
    begin_lock: Mutex<()>,
}

impl VersionManager {
    pub fn new(ledger: Arc<XidLedger>, dm: Arc<DataManager>) -> VersionManager {
        let active = DashMap::new();
        active.insert(
            SUPER_XID,
            Arc::new(ActiveTransaction::new(
                SUPER_XID,
                IsolationLevel::ReadCommitted,
                &[],
            )),
        );

        VersionManager {
            ledger,
            entries: RefCache::new(EntrySource { dm: Arc::clone(&dm) }, 0),
            dm,
            active,
            locks: LockTable::new(),
            begin_lock: Mutex::new(()),
        }
    }

    /// Starts a transaction at the given isolation level.
    pub fn begin(&self, level: IsolationLevel) -> Result<Xid> {
        let _serialize = self.begin_lock.lock();

        let xid = self.ledger.begin()?;
        let active: Vec<Xid> = self.active.iter().map(|e| *e.key()).collect();
        self.active
            .insert(xid, Arc::new(ActiveTransaction::new(xid, level, &active)));
        Ok(xid)
    }

    /// Reads the record at `id` as seen by `xid`; `None` when invisible or
    /// absent.
    pub fn read(&self, xid: Xid, id: RecordId) -> Result<Option<Vec<u8>>> {
        let tx = self.tx(xid)?;
        if tx.is_poisoned() {
            return Err(Error::ConcurrentUpdate);
        }

        let entry = match self.entries.get(id) {
            Ok(entry) => entry,
            Err(Error::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };

        let result = (|| {
            if visibility::is_visible(&self.ledger, &tx, &entry)? {
                Ok(Some(entry.data()))
            } else {
                Ok(None)
            }
        })();
        self.entries.release(id)?;
        result
    }

    /// Stores `data` as a new version owned by `xid`.
    pub fn insert(&self, xid: Xid, data: &[u8]) -> Result<RecordId> {
        let tx = self.tx(xid)?;
        if tx.is_poisoned() {
            return Err(Error::ConcurrentUpdate);
        }

        self.dm.insert(xid, &entry::wrap(data, xid))
    }

    /// Logically deletes the record at `id`. Returns false if there was
    /// nothing visible to delete; fails with `ConcurrentUpdate` (after
    /// auto-aborting `xid`) on deadlock or a repeatable-read version skip.
    pub fn delete(&self, xid: Xid, id: RecordId) -> Result<bool> {
        let tx = self.tx(xid)?;
        if tx.is_poisoned() {
            return Err(Error::ConcurrentUpdate);
        }

        let entry = match self.entries.get(id) {
            Ok(entry) => entry,
            Err(Error::NotFound) => return Ok(false),
            Err(e) => return Err(e),
        };

        let result = (|| {
            if !visibility::is_visible(&self.ledger, &tx, &entry)? {
                return Ok(false);
            }

            match self.locks.acquire(xid, id) {
                Ok(()) => {}
                Err(Error::Deadlock) => {
                    log::warn!("deadlock detected, aborting {}", xid);
                    tx.poison();
                    self.intern_abort(xid, true)?;
                    return Err(Error::ConcurrentUpdate);
                }
                Err(e) => return Err(e),
            }

            // The world may have changed while we waited for the lock.
            if entry.xmax() == xid {
                return Ok(false);
            }
            if visibility::is_version_skip(&self.ledger, &tx, &entry)? {
                log::warn!("version skip, aborting {}", xid);
                tx.poison();
                self.intern_abort(xid, true)?;
                return Err(Error::ConcurrentUpdate);
            }
            if !visibility::is_visible(&self.ledger, &tx, &entry)? {
                return Ok(false);
            }

            entry.set_xmax(xid, &self.dm)?;
            Ok(true)
        })();

        self.entries.release(id)?;
        result
    }

    /// Commits `xid`. Fails (leaving the transaction to be `abort`ed) if it
    /// was poisoned by an earlier conflict.
    pub fn commit(&self, xid: Xid) -> Result<()> {
        let tx = self.tx(xid)?;
        if tx.is_poisoned() {
            return Err(Error::ConcurrentUpdate);
        }

        self.active.remove(&xid);
        self.locks.release_all(xid);
        self.ledger.commit(xid)
    }

    /// Rolls back `xid`.
    pub fn abort(&self, xid: Xid) -> Result<()> {
        self.intern_abort(xid, false)
    }

    fn intern_abort(&self, xid: Xid, auto: bool) -> Result<()> {
        let tx = self.tx(xid)?;
        if !auto {
            self.active.remove(&xid);
        }

        // An auto-aborted transaction already released its locks and wrote
        // the ledger; the manual abort that follows only deregisters it.
        if tx.auto_aborted.swap(auto, Ordering::SeqCst) {
            return Ok(());
        }

        self.locks.release_all(xid);
        self.ledger.abort(xid)
    }

    fn tx(&self, xid: Xid) -> Result<Arc<ActiveTransaction>> {
        self.active
            .get(&xid)
            .map(|e| Arc::clone(e.value()))
            .ok_or(Error::NoSuchTransaction(xid.0))
    }

    /// Drops every cached entry reference. Called on database close.
    pub fn close(&self) -> Result<()> {
        self.entries.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    fn setup(dir: &std::path::Path) -> Result<(Arc<XidLedger>, Arc<VersionManager>)> {
        let base = dir.join("test");
        let ledger = Arc::new(XidLedger::create(&base)?);
        let dm = Arc::new(DataManager::create(&base, 1 << 20)?);
        let vm = Arc::new(VersionManager::new(Arc::clone(&ledger), dm));
        Ok((ledger, vm))
    }

    #[test]
    fn test_own_insert_visible_before_commit() -> Result<()> {
        let dir = tempdir()?;
        let (_ledger, vm) = setup(dir.path())?;

        let xid = vm.begin(IsolationLevel::ReadCommitted)?;
        let id = vm.insert(xid, b"mine")?;
        assert_eq!(vm.read(xid, id)?.as_deref(), Some(&b"mine"[..]));
        vm.commit(xid)?;

        Ok(())
    }

    #[test]
    fn test_read_committed_hides_uncommitted() -> Result<()> {
        let dir = tempdir()?;
        let (_ledger, vm) = setup(dir.path())?;

        let writer = vm.begin(IsolationLevel::ReadCommitted)?;
        let id = vm.insert(writer, b"pending")?;

        let reader = vm.begin(IsolationLevel::ReadCommitted)?;
        assert_eq!(vm.read(reader, id)?, None);

        vm.commit(writer)?;
        assert_eq!(vm.read(reader, id)?.as_deref(), Some(&b"pending"[..]));
        vm.commit(reader)?;

        Ok(())
    }

    #[test]
    fn test_repeatable_read_ignores_later_commits() -> Result<()> {
        let dir = tempdir()?;
        let (_ledger, vm) = setup(dir.path())?;

        let reader = vm.begin(IsolationLevel::RepeatableRead)?;

        let writer = vm.begin(IsolationLevel::ReadCommitted)?;
        let id = vm.insert(writer, b"late arrival")?;
        vm.commit(writer)?;

        // Committed after the reader began: still invisible to it.
        assert_eq!(vm.read(reader, id)?, None);
        vm.commit(reader)?;

        // A fresh transaction sees it.
        let fresh = vm.begin(IsolationLevel::RepeatableRead)?;
        assert_eq!(vm.read(fresh, id)?.as_deref(), Some(&b"late arrival"[..]));
        vm.commit(fresh)?;

        Ok(())
    }

    #[test]
    fn test_repeatable_read_stable_across_concurrent_delete() -> Result<()> {
        let dir = tempdir()?;
        let (_ledger, vm) = setup(dir.path())?;

        let setup_tx = vm.begin(IsolationLevel::ReadCommitted)?;
        let id = vm.insert(setup_tx, b"steady")?;
        vm.commit(setup_tx)?;

        let reader = vm.begin(IsolationLevel::RepeatableRead)?;
        assert_eq!(vm.read(reader, id)?.as_deref(), Some(&b"steady"[..]));

        let deleter = vm.begin(IsolationLevel::ReadCommitted)?;
        assert!(vm.delete(deleter, id)?);
        vm.commit(deleter)?;

        // The committed delete does not change the reader's view.
        assert_eq!(vm.read(reader, id)?.as_deref(), Some(&b"steady"[..]));
        vm.commit(reader)?;

        let after = vm.begin(IsolationLevel::ReadCommitted)?;
        assert_eq!(vm.read(after, id)?, None);
        vm.commit(after)?;

        Ok(())
    }

    #[test]
    fn test_delete_of_absent_record() -> Result<()> {
        let dir = tempdir()?;
        let (_ledger, vm) = setup(dir.path())?;

        let xid = vm.begin(IsolationLevel::ReadCommitted)?;
        assert!(!vm.delete(xid, RecordId::new(crate::storage::page::PageNo(50), 2))?);
        vm.commit(xid)?;

        Ok(())
    }

    #[test]
    fn test_version_skip_forces_abort() -> Result<()> {
        let dir = tempdir()?;
        let (ledger, vm) = setup(dir.path())?;

        let setup_tx = vm.begin(IsolationLevel::ReadCommitted)?;
        let id = vm.insert(setup_tx, b"contested")?;
        vm.commit(setup_tx)?;

        let slow = vm.begin(IsolationLevel::RepeatableRead)?;

        let fast = vm.begin(IsolationLevel::ReadCommitted)?;
        assert!(vm.delete(fast, id)?);
        vm.commit(fast)?;

        // The version slow would delete was removed by a transaction that is
        // invisible to it.
        assert!(matches!(
            vm.delete(slow, id),
            Err(Error::ConcurrentUpdate)
        ));
        assert!(matches!(vm.commit(slow), Err(Error::ConcurrentUpdate)));
        vm.abort(slow)?;
        assert!(ledger.is_aborted(slow)?);

        Ok(())
    }

    #[test]
    fn test_cross_delete_deadlock() -> Result<()> {
        let dir = tempdir()?;
        let (ledger, vm) = setup(dir.path())?;

        let setup_tx = vm.begin(IsolationLevel::ReadCommitted)?;
        let x = vm.insert(setup_tx, b"row x")?;
        let y = vm.insert(setup_tx, b"row y")?;
        vm.commit(setup_tx)?;

        let a = vm.begin(IsolationLevel::ReadCommitted)?;
        let b = vm.begin(IsolationLevel::ReadCommitted)?;
        assert!(vm.delete(a, x)?);
        assert!(vm.delete(b, y)?);

        // a blocks on y; b then closes the cycle on x.
        let handle = {
            let vm = Arc::clone(&vm);
            thread::spawn(move || vm.delete(a, y))
        };
        thread::sleep(Duration::from_millis(50));
        let b_result = vm.delete(b, x);
        let a_result = handle.join().unwrap();

        let a_deadlocked = matches!(a_result, Err(Error::ConcurrentUpdate));
        let b_deadlocked = matches!(b_result, Err(Error::ConcurrentUpdate));
        assert!(
            a_deadlocked ^ b_deadlocked,
            "exactly one of the transactions must deadlock"
        );

        if b_deadlocked {
            vm.abort(b)?;
            vm.commit(a)?;
            assert!(ledger.is_aborted(b)?);
        } else {
            vm.abort(a)?;
            vm.commit(b)?;
            assert!(ledger.is_aborted(a)?);
        }

        // The survivor's deletes stuck.
        let check = vm.begin(IsolationLevel::ReadCommitted)?;
        assert_eq!(vm.read(check, x)?, None);
        assert_eq!(vm.read(check, y)?, None);
        vm.commit(check)?;

        Ok(())
    }

    #[test]
    fn test_delete_waits_for_lock_release() -> Result<()> {
        let dir = tempdir()?;
        let (_ledger, vm) = setup(dir.path())?;

        let setup_tx = vm.begin(IsolationLevel::ReadCommitted)?;
        let id = vm.insert(setup_tx, b"locked row")?;
        vm.commit(setup_tx)?;

        let holder = vm.begin(IsolationLevel::ReadCommitted)?;
        assert!(vm.delete(holder, id)?);

        let waiter = vm.begin(IsolationLevel::ReadCommitted)?;
        let handle = {
            let vm = Arc::clone(&vm);
            thread::spawn(move || vm.delete(waiter, id))
        };

        thread::sleep(Duration::from_millis(50));
        vm.abort(holder)?;

        // The aborted delete is undone in version terms, so the waiter's
        // delete succeeds against the still-visible row.
        assert!(handle.join().unwrap()?);
        vm.commit(waiter)?;

        Ok(())
    }
}
