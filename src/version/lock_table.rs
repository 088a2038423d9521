//! Per-record exclusive locks with deadlock detection.
//!
//! The table tracks which transaction holds each record, who is queued
//! behind it, and which record each blocked transaction is waiting on. A
//! lock request that would close a cycle in the wait-for graph is rejected
//! immediately; the requester is expected to abort. Waiters are granted the
//! lock in FIFO order as holders release.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::data::RecordId;
use crate::error::{Error, Result};
use crate::transaction::Xid;

#[derive(Default)]
struct WaitSlot {
    granted: Mutex<bool>,
    cv: Condvar,
}

#[derive(Default)]
struct TableState {
    /// Records held by each transaction.
    held: HashMap<Xid, Vec<RecordId>>,
    /// Current holder of each locked record.
    owner: HashMap<RecordId, Xid>,
    /// FIFO queue of transactions blocked on each record.
    queue: HashMap<RecordId, VecDeque<Xid>>,
    /// The record each blocked transaction is waiting on.
    waits_on: HashMap<Xid, RecordId>,
    /// Wake-up slot for each blocked transaction.
    slots: HashMap<Xid, Arc<WaitSlot>>,
}

impl TableState {
    /// Stamped DFS over the wait-for graph: a stamp seen again within the
    /// same traversal closes a cycle.
    fn has_deadlock(&self) -> bool {
        let mut stamps: HashMap<Xid, u64> = HashMap::new();
        let mut stamp = 0u64;

        for &xid in self.held.keys() {
            if stamps.get(&xid).copied().unwrap_or(0) > 0 {
                continue;
            }
            stamp += 1;
            if self.dfs(xid, stamp, &mut stamps) {
                return true;
            }
        }
        false
    }

    fn dfs(&self, xid: Xid, stamp: u64, stamps: &mut HashMap<Xid, u64>) -> bool {
        match stamps.get(&xid) {
            Some(&s) if s == stamp => return true,
            Some(&s) if s < stamp => return false,
            _ => {}
        }
        stamps.insert(xid, stamp);

        let Some(&id) = self.waits_on.get(&xid) else {
            return false;
        };
        let Some(&holder) = self.owner.get(&id) else {
            return false;
        };
        self.dfs(holder, stamp, stamps)
    }

    /// Passes ownership of `id` to the first still-blocked waiter, if any.
    fn grant_next(&mut self, id: RecordId) {
        self.owner.remove(&id);

        if let Some(queue) = self.queue.get_mut(&id) {
            while let Some(next) = queue.pop_front() {
                if let Some(slot) = self.slots.remove(&next) {
                    self.owner.insert(id, next);
                    self.held.entry(next).or_default().push(id);
                    self.waits_on.remove(&next);
                    *slot.granted.lock() = true;
                    slot.cv.notify_one();
                    break;
                }
            }
        }
        if self.queue.get(&id).is_some_and(|q| q.is_empty()) {
            self.queue.remove(&id);
        }
    }
}

/// Exclusive lock table over record ids.
pub struct LockTable {
    state: Mutex<TableState>,
}

impl LockTable {
    pub fn new() -> LockTable {
        LockTable {
            state: Mutex::new(TableState::default()),
        }
    }

    /// Acquires the exclusive lock on `id` for `xid`, blocking behind the
    /// current holder. Re-acquiring a held lock is a no-op. Fails with
    /// [`Error::Deadlock`] if waiting would close a cycle.
    pub fn acquire(&self, xid: Xid, id: RecordId) -> Result<()> {
        let slot = {
            let mut state = self.state.lock();

            if state.held.get(&xid).is_some_and(|v| v.contains(&id)) {
                return Ok(());
            }
            if !state.owner.contains_key(&id) {
                state.owner.insert(id, xid);
                state.held.entry(xid).or_default().push(id);
                return Ok(());
            }

            state.waits_on.insert(xid, id);
            state.queue.entry(id).or_default().push_back(xid);

            if state.has_deadlock() {
                state.waits_on.remove(&xid);
                if let Some(queue) = state.queue.get_mut(&id) {
                    queue.retain(|&waiter| waiter != xid);
                    if queue.is_empty() {
                        state.queue.remove(&id);
                    }
                }
                return Err(Error::Deadlock);
            }

            let slot = Arc::new(WaitSlot::default());
            state.slots.insert(xid, Arc::clone(&slot));
            slot
        };

        let mut granted = slot.granted.lock();
        while !*granted {
            slot.cv.wait(&mut granted);
        }
        Ok(())
    }

    /// Releases every lock `xid` holds, handing each record to its next
    /// waiter.
    pub fn release_all(&self, xid: Xid) {
        let mut state = self.state.lock();

        if let Some(ids) = state.held.remove(&xid) {
            for id in ids {
                state.grant_next(id);
            }
        }
        state.waits_on.remove(&xid);
        state.slots.remove(&xid);
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}
