//! Mutation engine
//!
//! Inserts and removes records in a tree that fits in its root node. Both
//! operations take the query that located the position: an insert goes
//! right after the record the query found, a remove drops the record the
//! query matched exactly. Nodes are never split or merged.

use crate::block::{BlockStore, Transaction};
use crate::query::Query;
use crate::volume::Volume;
use crate::{BtreeError, Result};
use tracing::debug;

impl<S: BlockStore> Volume<S> {
    /// Insert a record right after the one found by `query`
    ///
    /// `key` and `value` are in on-disk form; a `None` value stores a ghost
    /// record. On success the query references the new record.
    ///
    /// # Errors
    ///
    /// Returns [`BtreeError::NoSpace`] if the node cannot hold the record
    /// and [`BtreeError::InvalidArgument`] if the record does not have the
    /// tree's fixed key or value size.
    ///
    /// # Panics
    ///
    /// Panics if the query's node is not a root leaf or was not written by
    /// `txn`.
    pub fn btree_insert(
        &self,
        query: &mut Query,
        txn: &Transaction,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<()> {
        let frame = query.top_mut();
        let node = &frame.node;
        let number = node.block_number();
        assert!(
            node.is_root() && node.is_leaf(),
            "node {number:#x} must be a root leaf to take an insert"
        );
        assert_eq!(
            node.xid(),
            txn.xid(),
            "node {number:#x} is not part of transaction {}",
            txn.xid()
        );

        let val_len = value.map_or(0, <[u8]>::len);
        let mut edit = node.modify()?;

        if let Some((key_size, val_size)) = edit.fixed_sizes() {
            if key.len() != key_size || value.is_some_and(|value| value.len() != val_size) {
                return Err(BtreeError::InvalidArgument(format!(
                    "record of {}/{val_len} bytes in a tree of {key_size}/{val_size} byte records",
                    key.len()
                )));
            }
        }
        if key.len() + val_len > edit.free_space() {
            return Err(BtreeError::NoSpace(number));
        }

        let slot = frame.loc.map_or(0, |loc| loc.index + 1);
        edit.insert_record(slot, key, value)?;

        if let Some(mut info) = edit.tree_info() {
            info.key_count += 1;
            info.longest_key = info.longest_key.max(u32::try_from(key.len()).unwrap_or(u32::MAX));
            info.longest_val = info.longest_val.max(u32::try_from(val_len).unwrap_or(u32::MAX));
            edit.set_tree_info(&info)?;
        }

        let loc = edit.record_at(slot)?;
        edit.commit(self.store())?;

        debug!("inserted record {} into node {:#x}", slot, number);
        frame.index = Some(slot);
        frame.loc = Some(loc);
        frame.exact = true;
        Ok(())
    }

    /// Remove the record matched by `query`
    ///
    /// The freed bytes are accounted in the node's free lists but not
    /// reclaimed.
    ///
    /// # Errors
    ///
    /// Returns [`BtreeError::InvalidArgument`] if the query does not hold
    /// an exact match.
    ///
    /// # Panics
    ///
    /// Panics if the query's node is not a root leaf or was not written by
    /// `txn`.
    pub fn btree_remove(&self, query: &mut Query, txn: &Transaction) -> Result<()> {
        let frame = query.top_mut();
        let node = &frame.node;
        let number = node.block_number();
        assert!(
            node.is_root() && node.is_leaf(),
            "node {number:#x} must be a root leaf to take a remove"
        );
        assert_eq!(
            node.xid(),
            txn.xid(),
            "node {number:#x} is not part of transaction {}",
            txn.xid()
        );

        let loc = match frame.loc {
            Some(loc) if frame.exact => loc,
            _ => {
                return Err(BtreeError::InvalidArgument(
                    "query holds no exact match to remove".to_string(),
                ));
            }
        };

        let mut edit = node.modify()?;
        edit.remove_record(loc.index)?;
        if let Some(mut info) = edit.tree_info() {
            info.key_count = info.key_count.saturating_sub(1);
            edit.set_tree_info(&info)?;
        }
        edit.commit(self.store())?;

        debug!("removed record {} from node {:#x}", loc.index, number);
        frame.loc = None;
        frame.exact = false;
        Ok(())
    }
}
