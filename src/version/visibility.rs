//! Version visibility rules.

use crate::error::Result;
use crate::transaction::{XidLedger, SUPER_XID};
use crate::version::entry::Entry;
use crate::version::{ActiveTransaction, IsolationLevel};

/// Whether `entry` is visible to `tx` under its isolation level.
pub fn is_visible(ledger: &XidLedger, tx: &ActiveTransaction, entry: &Entry) -> Result<bool> {
    match tx.level {
        IsolationLevel::ReadCommitted => read_committed(ledger, tx, entry),
        IsolationLevel::RepeatableRead => repeatable_read(ledger, tx, entry),
    }
}

/// Whether a delete by `tx` would skip over a newer committed version: the
/// entry's deleter committed but started after `tx` or was concurrent with
/// it. Such a delete must abort instead of silently losing the overlap.
pub fn is_version_skip(ledger: &XidLedger, tx: &ActiveTransaction, entry: &Entry) -> Result<bool> {
    if tx.level == IsolationLevel::ReadCommitted {
        return Ok(false);
    }
    let xmax = entry.xmax();
    Ok(ledger.is_committed(xmax)? && (xmax > tx.xid || tx.in_snapshot(xmax)))
}

fn read_committed(ledger: &XidLedger, tx: &ActiveTransaction, entry: &Entry) -> Result<bool> {
    let xmin = entry.xmin();
    let xmax = entry.xmax();

    // Our own in-progress insert.
    if xmin == tx.xid && xmax == SUPER_XID {
        return Ok(true);
    }

    Ok(ledger.is_committed(xmin)?
        && (xmax == SUPER_XID || (xmax != tx.xid && !ledger.is_committed(xmax)?)))
}

fn repeatable_read(ledger: &XidLedger, tx: &ActiveTransaction, entry: &Entry) -> Result<bool> {
    let xmin = entry.xmin();
    let xmax = entry.xmax();

    if xmin == tx.xid && xmax == SUPER_XID {
        return Ok(true);
    }

    // The creator must be visible to our snapshot: committed, started
    // earlier, and not concurrent with us.
    if !(ledger.is_committed(xmin)? && xmin < tx.xid && !tx.in_snapshot(xmin)) {
        return Ok(false);
    }

    if xmax == SUPER_XID {
        return Ok(true);
    }
    if xmax == tx.xid {
        return Ok(false);
    }

    // A deleter hides the version only if the delete is itself visible to
    // our snapshot; uncommitted, later-started or concurrent deleters do
    // not.
    Ok(!ledger.is_committed(xmax)? || xmax > tx.xid || tx.in_snapshot(xmax))
}
