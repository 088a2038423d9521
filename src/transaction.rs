//! Transaction identity and the durable xid ledger.

pub mod id;
pub mod ledger;

pub use id::{Xid, SUPER_XID};
pub use ledger::{TxStatus, XidLedger};
