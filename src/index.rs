//! A persistent B+Tree mapping u64 keys to record addresses.
//!
//! Nodes are ordinary data-manager records mutated under the WAL bracket,
//! so index structure survives crashes the same way table data does. The
//! root pointer lives in its own boot record and is swapped atomically when
//! the root splits. `u64::MAX` is reserved as the internal boundary
//! sentinel and cannot be indexed.

pub mod node;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::data::{DataItem, DataManager, RecordId};
use crate::error::{Error, Result};
use crate::transaction::SUPER_XID;

use node::{Descent, InsertOutcome, Node};

/// A persistent ordered index.
pub struct BPlusTree {
    dm: Arc<DataManager>,
    boot_id: RecordId,
    boot_item: Arc<DataItem>,
    boot_lock: Mutex<()>,
}

impl BPlusTree {
    /// Creates an empty tree, returning the boot record that addresses it.
    pub fn create(dm: &DataManager) -> Result<RecordId> {
        let root = dm.insert(SUPER_XID, &node::empty_leaf_raw())?;
        dm.insert(SUPER_XID, &root.value().to_le_bytes())
    }

    /// Loads the tree addressed by `boot_id`.
    pub fn load(dm: Arc<DataManager>, boot_id: RecordId) -> Result<BPlusTree> {
        let boot_item = dm.read(boot_id)?.ok_or(Error::NotFound)?;
        Ok(BPlusTree {
            dm,
            boot_id,
            boot_item,
            boot_lock: Mutex::new(()),
        })
    }

    /// Values stored under exactly `key`.
    pub fn search(&self, key: u64) -> Result<Vec<RecordId>> {
        self.search_range(key, key)
    }

    /// Values for keys in `[lo, hi]`, in ascending key order.
    pub fn search_range(&self, lo: u64, hi: u64) -> Result<Vec<RecordId>> {
        let mut leaf_id = self.find_leaf(self.root_id(), lo)?;
        let mut out = Vec::new();

        loop {
            let leaf = Node::load(&self.dm, leaf_id)?;
            let (values, next) = leaf.leaf_range(lo, hi);
            leaf.release(&self.dm)?;
            out.extend(values);

            match next {
                Some(next) => leaf_id = next,
                None => break,
            }
        }
        Ok(out)
    }

    /// Inserts a `(key, value)` pair.
    pub fn insert(&self, key: u64, value: RecordId) -> Result<()> {
        let root = self.root_id();
        if let Some((boundary, right)) = self.insert_into(root, value, key)? {
            self.swap_root(root, right, boundary)?;
        }
        Ok(())
    }

    /// Releases the boot record.
    pub fn close(&self) -> Result<()> {
        self.dm.release(self.boot_id)
    }

    fn root_id(&self) -> RecordId {
        let _g = self.boot_lock.lock();
        RecordId(
            self.boot_item
                .read(|p| u64::from_le_bytes(p[..8].try_into().unwrap())),
        )
    }

    /// Installs a fresh root over the split halves of the old one.
    fn swap_root(&self, left: RecordId, right: RecordId, boundary: u64) -> Result<()> {
        let _g = self.boot_lock.lock();
        let new_root = self
            .dm
            .insert(SUPER_XID, &node::root_raw(left, right, boundary))?;

        let mut w = self.dm.write_item(&self.boot_item);
        w.mutate(|p| p[..8].copy_from_slice(&new_root.value().to_le_bytes()));
        w.commit(SUPER_XID)
    }

    fn find_leaf(&self, mut node_id: RecordId, key: u64) -> Result<RecordId> {
        loop {
            let node = Node::load(&self.dm, node_id)?;
            let leaf = node.is_leaf();
            node.release(&self.dm)?;

            if leaf {
                return Ok(node_id);
            }
            node_id = self.step_down(node_id, key)?;
        }
    }

    /// One level of descent, following siblings past concurrent splits.
    fn step_down(&self, mut node_id: RecordId, key: u64) -> Result<RecordId> {
        loop {
            let node = Node::load(&self.dm, node_id)?;
            let descent = node.descend(key);
            node.release(&self.dm)?;

            match descent {
                Descent::Child(child) => return Ok(child),
                Descent::Sibling(sibling) => node_id = sibling,
            }
        }
    }

    /// Recursive insert; returns the `(boundary, node)` pair to thread into
    /// the parent when this level split.
    fn insert_into(
        &self,
        node_id: RecordId,
        value: RecordId,
        key: u64,
    ) -> Result<Option<(u64, RecordId)>> {
        let node = Node::load(&self.dm, node_id)?;
        let leaf = node.is_leaf();
        node.release(&self.dm)?;

        if leaf {
            self.insert_at_level(node_id, value, key)
        } else {
            let child = self.step_down(node_id, key)?;
            match self.insert_into(child, value, key)? {
                Some((boundary, split)) => self.insert_at_level(node_id, split, boundary),
                None => Ok(None),
            }
        }
    }

    /// Inserts into the chain of nodes at one level, retrying right past
    /// concurrent splits.
    fn insert_at_level(
        &self,
        mut node_id: RecordId,
        value: RecordId,
        key: u64,
    ) -> Result<Option<(u64, RecordId)>> {
        loop {
            let node = Node::load(&self.dm, node_id)?;
            let outcome = node.insert_and_split(&self.dm, value, key);
            node.release(&self.dm)?;

            match outcome? {
                InsertOutcome::Retry(sibling) => node_id = sibling,
                InsertOutcome::Done => return Ok(None),
                InsertOutcome::Split { boundary, node } => {
                    return Ok(Some((boundary, node)))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageNo;
    use crate::transaction::XidLedger;
    use tempfile::tempdir;

    fn tree(dir: &std::path::Path) -> Result<(Arc<DataManager>, BPlusTree)> {
        let base = dir.join("test");
        let _ledger = XidLedger::create(&base)?;
        let dm = Arc::new(DataManager::create(&base, 1 << 22)?);
        let boot = BPlusTree::create(&dm)?;
        let tree = BPlusTree::load(Arc::clone(&dm), boot)?;
        Ok((dm, tree))
    }

    fn value(n: u64) -> RecordId {
        RecordId::new(PageNo(100), n as u16)
    }

    #[test]
    fn test_insert_and_point_search() -> Result<()> {
        let dir = tempdir()?;
        let (_dm, tree) = tree(dir.path())?;

        tree.insert(5, value(5))?;
        tree.insert(1, value(1))?;
        tree.insert(9, value(9))?;

        assert_eq!(tree.search(5)?, vec![value(5)]);
        assert_eq!(tree.search(1)?, vec![value(1)]);
        assert!(tree.search(7)?.is_empty());

        Ok(())
    }

    #[test]
    fn test_range_search_is_ordered() -> Result<()> {
        let dir = tempdir()?;
        let (_dm, tree) = tree(dir.path())?;

        for key in [8u64, 3, 11, 1, 6] {
            tree.insert(key, value(key))?;
        }

        let hits = tree.search_range(2, 9)?;
        assert_eq!(hits, vec![value(3), value(6), value(8)]);

        Ok(())
    }

    #[test]
    fn test_split_and_range_across_nodes() -> Result<()> {
        let dir = tempdir()?;
        let (_dm, tree) = tree(dir.path())?;

        // Enough keys to force leaf and root splits, inserted out of order.
        let mut keys: Vec<u64> = (1..=200).collect();
        keys.reverse();
        for key in &keys {
            tree.insert(*key, value(*key))?;
        }

        let hits = tree.search_range(1, 200)?;
        let expect: Vec<RecordId> = (1..=200).map(value).collect();
        assert_eq!(hits, expect);

        let hits = tree.search_range(77, 93)?;
        let expect: Vec<RecordId> = (77..=93).map(value).collect();
        assert_eq!(hits, expect);

        assert_eq!(tree.search(200)?, vec![value(200)]);
        assert!(tree.search(201)?.is_empty());

        Ok(())
    }

    #[test]
    fn test_tree_survives_reopen() -> Result<()> {
        let dir = tempdir()?;
        let base = dir.path().join("test");

        let boot = {
            let _ledger = XidLedger::create(&base)?;
            let dm = Arc::new(DataManager::create(&base, 1 << 22)?);
            let boot = BPlusTree::create(&dm)?;
            let tree = BPlusTree::load(Arc::clone(&dm), boot)?;
            for key in 1..=100u64 {
                tree.insert(key, value(key))?;
            }
            tree.close()?;
            dm.close()?;
            boot
        };

        let ledger = XidLedger::open(&base)?;
        let dm = Arc::new(DataManager::open(&base, 1 << 22, &ledger)?);
        let tree = BPlusTree::load(Arc::clone(&dm), boot)?;
        let hits = tree.search_range(40, 60)?;
        let expect: Vec<RecordId> = (40..=60).map(value).collect();
        assert_eq!(hits, expect);

        Ok(())
    }
}
