//! Query engine
//!
//! A [`Query`] is a search from a root node down to the leaf that holds a
//! record. Nodes are searched backward from the end of their record range,
//! so a query finds the *last* record that orders at or below its key.
//!
//! In single-record mode the query keeps one frame and reuses it on every
//! descent. In multi-record mode ([`QueryFlags::MULTIPLE`]) every descent
//! pushes a frame, so that repeated calls to [`Volume::btree_query`] can
//! step backward through the leaf and climb back into the parents when a
//! leaf runs out. Successive records come back in descending order and the
//! iteration ends with [`BtreeError::NotFound`].
//!
//! Descents are bounded by [`BtreeConfig::max_depth`](crate::BtreeConfig)
//! so that a cyclic or damaged tree is reported instead of walked forever.

use crate::block::BlockStore;
use crate::key::{self, Key, KeyFormat, NameComparison};
use crate::node::{Node, RecordLoc, CHILD_ID_SIZE};
use crate::omap::Access;
use crate::volume::Volume;
use crate::{BtreeError, Result};
use std::cmp::Ordering;
use std::ops::BitOr;
use tracing::{error, trace, warn};

/// Query flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct QueryFlags {
    /// Raw flag value
    pub value: u32,
}

impl QueryFlags {
    /// No flags: a single-record catalog query
    pub const NONE: Self = Self::new(0);
    /// Search an object map: child ids are physical block numbers
    pub const OMAP: Self = Self::new(0x0001);
    /// Search a free queue: child ids are physical block numbers
    pub const FREE_QUEUE: Self = Self::new(0x0002);
    /// Return every matching record, one per call
    pub const MULTIPLE: Self = Self::new(0x0004);
    /// Fail unless the leaf record equals the key
    pub const EXACT: Self = Self::new(0x0008);
    /// Match any name
    pub const ANY_NAME: Self = Self::new(0x0010);
    /// Match any number, and therefore any name
    pub const ANY_NUMBER: Self = Self::new(0x0020);

    /// Create query flags from raw value
    pub const fn new(value: u32) -> Self {
        Self { value }
    }

    /// Check if every flag in `flags` is set
    pub const fn contains(&self, flags: Self) -> bool {
        (self.value & flags.value) == flags.value
    }

    /// Key encoding of the searched tree
    pub const fn key_format(&self) -> KeyFormat {
        if self.contains(Self::OMAP) {
            KeyFormat::ObjectMap
        } else if self.contains(Self::FREE_QUEUE) {
            KeyFormat::FreeQueue
        } else {
            KeyFormat::Catalog
        }
    }

    /// Whether child ids in the searched tree are physical
    pub const fn has_physical_children(&self) -> bool {
        self.contains(Self::OMAP) || self.contains(Self::FREE_QUEUE)
    }
}

impl BitOr for QueryFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self::new(self.value | rhs.value)
    }
}

/// One record read out of a tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Decoded key
    pub key: Key,
    /// Value bytes, `None` for a ghost record
    pub value: Option<Vec<u8>>,
    /// Block of the leaf holding the record
    pub block: u64,
    /// Position of the record in its leaf
    pub index: usize,
}

/// Search state for one node on the path
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub(crate) node: Node,
    /// Current record; also the exclusive upper bound of the next search
    pub(crate) index: Option<usize>,
    pub(crate) depth: usize,
    /// Continue by stepping back instead of searching again
    next: bool,
    /// No earlier record in this node can match
    done: bool,
    /// Record located by the last step
    pub(crate) loc: Option<RecordLoc>,
    /// The located record equals the key
    pub(crate) exact: bool,
}

impl Frame {
    const fn new(node: Node, depth: usize) -> Self {
        Self {
            node,
            index: None,
            depth,
            next: false,
            done: false,
            loc: None,
            exact: false,
        }
    }
}

enum Step {
    Found,
    NoCandidate,
}

/// A search through one tree
#[derive(Debug, Clone)]
pub struct Query {
    key: Key,
    flags: QueryFlags,
    names: Option<NameComparison>,
    current: Frame,
    /// Ancestors of the current frame, kept only by multi-record queries
    parents: Vec<Frame>,
}

impl Query {
    /// Start a search for `key` from `root`
    pub fn new(root: Node, key: Key, flags: QueryFlags) -> Self {
        Self {
            key,
            flags,
            names: None,
            current: Frame::new(root, 0),
            parents: Vec::new(),
        }
    }

    /// Compare names with `names` instead of byte-wise
    ///
    /// Without this, [`Volume::btree_query`] applies the volume's mode.
    #[must_use]
    pub const fn with_names(mut self, names: NameComparison) -> Self {
        self.names = Some(names);
        self
    }

    /// Key being searched for
    pub const fn key(&self) -> &Key {
        &self.key
    }

    /// Query flags
    pub const fn flags(&self) -> QueryFlags {
        self.flags
    }

    /// Node currently searched, the leaf after a successful query
    pub fn node(&self) -> &Node {
        &self.top().node
    }

    /// Depth of the current node below the root
    pub fn depth(&self) -> usize {
        self.top().depth
    }

    /// Location of the current record
    ///
    /// After a failed exact query on a leaf this is the record that orders
    /// right before the key, or `None` if the key orders first.
    pub fn location(&self) -> Option<RecordLoc> {
        self.top().loc
    }

    /// Whether the current record equals the key
    pub fn is_exact(&self) -> bool {
        self.top().exact
    }

    /// Copy the current record out of its node
    ///
    /// # Errors
    ///
    /// Returns [`BtreeError::NotFound`] if the query holds no record.
    pub fn record(&self) -> Result<Record> {
        let frame = self.top();
        let loc = frame.loc.ok_or(BtreeError::NotFound)?;
        let view = frame.node.view()?;
        let key = Key::decode(view.key_bytes(&loc), self.flags.key_format())?;
        let value = (!loc.ghost).then(|| view.value_bytes(&loc).to_vec());
        Ok(Record {
            key,
            value,
            block: frame.node.block_number(),
            index: loc.index,
        })
    }

    /// Copy the value of the current record, empty for a ghost
    ///
    /// # Errors
    ///
    /// Returns [`BtreeError::NotFound`] if the query holds no record.
    pub fn value(&self) -> Result<Vec<u8>> {
        let frame = self.top();
        let loc = frame.loc.ok_or(BtreeError::NotFound)?;
        Ok(frame.node.view()?.value_bytes(&loc).to_vec())
    }

    /// Decode the key of the current record
    ///
    /// # Errors
    ///
    /// Returns [`BtreeError::NotFound`] if the query holds no record.
    pub fn record_key(&self) -> Result<Key> {
        let frame = self.top();
        let loc = frame.loc.ok_or(BtreeError::NotFound)?;
        Key::decode(
            frame.node.view()?.key_bytes(&loc),
            self.flags.key_format(),
        )
    }

    pub(crate) const fn top(&self) -> &Frame {
        &self.current
    }

    pub(crate) fn top_mut(&mut self) -> &mut Frame {
        &mut self.current
    }

    /// Resume the parent frame, if any
    fn pop(&mut self) -> bool {
        match self.parents.pop() {
            Some(parent) => {
                self.current = parent;
                true
            }
            None => false,
        }
    }

    /// Descend into `child`, keeping the current frame only when iterating
    fn descend(&mut self, child: Node) {
        let frame = Frame::new(child, self.current.depth + 1);
        let parent = std::mem::replace(&mut self.current, frame);
        if self.flags.contains(QueryFlags::MULTIPLE) {
            self.parents.push(parent);
        }
    }

    fn compare(&self, candidate: &Key) -> Ordering {
        if self.flags.contains(QueryFlags::ANY_NUMBER) {
            return candidate
                .id
                .cmp(&self.key.id)
                .then(candidate.kind.cmp(&self.key.kind));
        }
        if self.flags.contains(QueryFlags::ANY_NAME) {
            return candidate
                .id
                .cmp(&self.key.id)
                .then(candidate.kind.cmp(&self.key.kind))
                .then(candidate.number.cmp(&self.key.number));
        }
        key::compare(candidate, &self.key, self.names.unwrap_or_default())
    }

    /// Search the top frame's node
    fn node_query(&mut self) -> Result<Step> {
        if self.top().next {
            return self.node_next();
        }

        let format = self.flags.key_format();
        let multiple = self.flags.contains(QueryFlags::MULTIPLE);
        let exact = self.flags.contains(QueryFlags::EXACT);

        let frame = self.top();
        let view = frame.node.view()?;
        let bound = frame.index.unwrap_or_else(|| view.records());
        let found = view.search(bound, format, |candidate| self.compare(candidate))?;
        let Some((index, ordering)) = found else {
            drop(view);
            let frame = self.top_mut();
            frame.loc = None;
            frame.exact = false;
            return Ok(Step::NoCandidate);
        };
        let loc = view.record_at(index)?;
        let leaf = frame.node.is_leaf();
        drop(view);

        let frame = self.top_mut();
        frame.index = Some(index);
        frame.loc = Some(loc);
        frame.exact = ordering == Ordering::Equal;

        if leaf && exact && ordering != Ordering::Equal {
            return Err(BtreeError::NotFound);
        }
        if multiple {
            frame.next = true;
            if ordering != Ordering::Equal {
                frame.done = true;
            }
        }
        Ok(Step::Found)
    }

    /// Step a multi-record query back to the previous record
    fn node_next(&mut self) -> Result<Step> {
        let format = self.flags.key_format();
        let exact = self.flags.contains(QueryFlags::EXACT);

        let frame = self.top();
        if frame.done {
            return Err(BtreeError::NotFound);
        }
        let index = match frame.index {
            Some(index) if index > 0 => index - 1,
            _ => return Ok(Step::NoCandidate),
        };

        let view = frame.node.view()?;
        let loc = view.record_at(index)?;
        let ordering = self.compare(&Key::decode(view.key_bytes(&loc), format)?);
        let block = frame.node.block_number();
        let leaf = frame.node.is_leaf();
        drop(view);

        if ordering == Ordering::Greater {
            error!("records are out of order in node {:#x}", block);
            return Err(BtreeError::Corrupted(format!(
                "records are out of order in node {block:#x}"
            )));
        }

        let frame = self.top_mut();
        frame.index = Some(index);
        frame.loc = Some(loc);
        frame.exact = ordering == Ordering::Equal;

        if leaf && exact && ordering != Ordering::Equal {
            return Err(BtreeError::NotFound);
        }
        if ordering != Ordering::Equal {
            frame.done = true;
        }
        Ok(Step::Found)
    }
}

impl<S: BlockStore> Volume<S> {
    /// Run `query` until it reaches the leaf record for its key
    ///
    /// On success the query references the record. A multi-record query
    /// can be run again to fetch the previous matching record.
    ///
    /// # Errors
    ///
    /// Returns [`BtreeError::NotFound`] when no record matches (or a multi
    /// query is exhausted), and [`BtreeError::Corrupted`] when the descent
    /// exceeds the depth ceiling, an index record is malformed, or records
    /// are out of order.
    pub fn btree_query(&self, query: &mut Query) -> Result<()> {
        if query.names.is_none() {
            query.names = Some(self.config().names());
        }

        loop {
            let frame = query.top();
            if frame.depth >= self.config().max_depth {
                error!(
                    "b-tree is too deep at node {:#x}",
                    frame.node.block_number()
                );
                return Err(BtreeError::Corrupted("b-tree is too deep".to_string()));
            }

            match query.node_query()? {
                Step::Found => {}
                Step::NoCandidate => {
                    if !query.pop() {
                        return Err(BtreeError::NotFound);
                    }
                    continue;
                }
            }

            let frame = query.top();
            if frame.node.is_leaf() {
                return Ok(());
            }

            let child_id = child_from_frame(frame)?;
            let child_block = if query.flags.has_physical_children() {
                child_id
            } else {
                self.omap_lookup_block(self.omap_root(), child_id, self.xid(), Access::Read)?
            };

            let child = self.read_node(child_block)?;
            if child.oid() != child_id {
                warn!(
                    "child {:#x} in block {:#x} claims object id {:#x}",
                    child_id,
                    child_block,
                    child.oid()
                );
            }
            trace!("descending into node {:#x}", child_block);
            query.descend(child);
        }
    }

    /// Read every leaf record under `root`, in key order
    ///
    /// # Errors
    ///
    /// Returns the same corruption errors as [`Volume::btree_query`].
    pub fn scan(&self, root: &Node, flags: QueryFlags) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        self.scan_node(root, flags, 0, &mut records)?;
        Ok(records)
    }

    fn scan_node(
        &self,
        node: &Node,
        flags: QueryFlags,
        depth: usize,
        records: &mut Vec<Record>,
    ) -> Result<()> {
        if depth >= self.config().max_depth {
            error!("b-tree is too deep at node {:#x}", node.block_number());
            return Err(BtreeError::Corrupted("b-tree is too deep".to_string()));
        }

        let format = flags.key_format();
        let view = node.view()?;

        if node.is_leaf() {
            for index in 0..view.records() {
                let loc = view.record_at(index)?;
                records.push(Record {
                    key: Key::decode(view.key_bytes(&loc), format)?,
                    value: (!loc.ghost).then(|| view.value_bytes(&loc).to_vec()),
                    block: node.block_number(),
                    index,
                });
            }
            return Ok(());
        }

        let mut children = Vec::with_capacity(view.records());
        for index in 0..view.records() {
            let loc = view.record_at(index)?;
            children.push(child_id(node, view.value_bytes(&loc))?);
        }
        drop(view);

        for child_id in children {
            let child_block = if flags.has_physical_children() {
                child_id
            } else {
                self.omap_lookup_block(self.omap_root(), child_id, self.xid(), Access::Read)?
            };
            let child = self.read_node(child_block)?;
            if child.oid() != child_id {
                warn!(
                    "child {:#x} in block {:#x} claims object id {:#x}",
                    child_id,
                    child_block,
                    child.oid()
                );
            }
            self.scan_node(&child, flags, depth + 1, records)?;
        }
        Ok(())
    }
}

fn child_from_frame(frame: &Frame) -> Result<u64> {
    let loc = frame.loc.ok_or(BtreeError::NotFound)?;
    let view = frame.node.view()?;
    child_id(&frame.node, view.value_bytes(&loc))
}

fn child_id(node: &Node, value: &[u8]) -> Result<u64> {
    let bytes: [u8; CHILD_ID_SIZE] = value.try_into().map_err(|_| {
        error!("bad index block: {:#x}", node.block_number());
        BtreeError::Corrupted(format!(
            "index record of {} bytes in node {:#x}",
            value.len(),
            node.block_number()
        ))
    })?;
    Ok(u64::from_le_bytes(bytes))
}
