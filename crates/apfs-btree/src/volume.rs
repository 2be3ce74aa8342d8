//! Shared engine state

use crate::block::BlockStore;
use crate::config::BtreeConfig;
use crate::node::Node;
use crate::object::OBJECT_TYPE_OMAP;
use crate::omap::ObjectMapPhys;
use crate::{BtreeError, Result};
use tracing::info;

/// A mounted volume as seen by the B-tree engine
///
/// Holds the block store, the root of the volume's object map, the
/// transaction id used as the ceiling for virtual lookups, and the engine
/// configuration. Every tree operation is a method on this type.
#[derive(Debug)]
pub struct Volume<S> {
    store: S,
    omap_root: Node,
    xid: u64,
    config: BtreeConfig,
}

impl<S: BlockStore> Volume<S> {
    /// Assemble a volume from an already opened object map root
    pub const fn new(store: S, omap_root: Node, xid: u64, config: BtreeConfig) -> Self {
        Self {
            store,
            omap_root,
            xid,
            config,
        }
    }

    /// Open a volume through its object map object at `omap_paddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the object map or its root node cannot be read
    /// or is not what it claims to be.
    pub fn open(store: S, omap_paddr: u64, xid: u64, config: BtreeConfig) -> Result<Self> {
        let block = store.read_block(omap_paddr)?;
        let omap = ObjectMapPhys::parse(omap_paddr, &block.read(), config.verify_checksums)?;
        drop(block);

        let root = Node::open(store.read_block(omap.tree_oid)?, &config)?;
        if !root.is_root() || root.subtype() != OBJECT_TYPE_OMAP {
            return Err(BtreeError::Corrupted(format!(
                "object map tree at {:#x} is not an object map root",
                omap.tree_oid
            )));
        }

        info!(
            "opened object map {:#x} with root {:#x} at transaction {}",
            omap_paddr, omap.tree_oid, xid
        );
        Ok(Self::new(store, root, xid, config))
    }

    /// Block store backing the volume
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Root node of the object map
    pub const fn omap_root(&self) -> &Node {
        &self.omap_root
    }

    /// Replace the object map root, after it has been relocated
    pub fn set_omap_root(&mut self, root: Node) {
        self.omap_root = root;
    }

    /// Transaction id used as the object map ceiling
    pub const fn xid(&self) -> u64 {
        self.xid
    }

    /// Move to a new transaction
    pub fn set_xid(&mut self, xid: u64) {
        self.xid = xid;
    }

    /// Engine configuration
    pub const fn config(&self) -> &BtreeConfig {
        &self.config
    }

    /// Read and validate the node stored in physical block `block`
    ///
    /// # Errors
    ///
    /// Returns an I/O error from the store or a corruption error if the
    /// block is not a valid node.
    pub fn read_node(&self, block: u64) -> Result<Node> {
        Node::open(self.store.read_block(block)?, &self.config)
    }
}
