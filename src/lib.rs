pub mod cache;
pub mod data;
pub mod db;
pub mod error;
pub mod index;
pub mod storage;
pub mod transaction;
pub mod version;

pub use data::RecordId;
pub use db::{Database, Options};
pub use error::{Error, Result};
pub use index::BPlusTree;
pub use transaction::{Xid, SUPER_XID};
pub use version::IsolationLevel;
