//! Integration tests for the B-tree engine on synthetic volumes
//!
//! Every volume is laid out in a `MemoryBlockStore`: an object map object at
//! block 0x1, its single-node tree at block 0x10, and catalog nodes wherever
//! a test puts them.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use apfs_btree::key::compare;
use apfs_btree::node::NodeBuilder;
use apfs_btree::object::{OBJECT_TYPE_FSTREE, OBJECT_TYPE_OMAP, OBJ_PHYSICAL, OBJ_VIRTUAL};
use apfs_btree::{
    Access, BlockStore, BtreeConfig, BtreeError, Key, KeyFormat, MemoryBlockStore,
    NameComparison, Node, ObjectMapPhys, OmapVal, Query, QueryFlags, SequentialSpaceman,
    Transaction, Volume,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::cmp::Ordering;
use std::collections::BTreeMap;

const BLOCK_SIZE: usize = 4096;
const OMAP_OBJECT: u64 = 0x1;
const OMAP_TREE: u64 = 0x10;
const CATALOG_BLOCK: u64 = 0x20;
const CATALOG_OID: u64 = 0x402;

fn omap_builder(xid: u64) -> NodeBuilder {
    NodeBuilder::new(BLOCK_SIZE)
        .with_oid(OMAP_TREE)
        .with_xid(xid)
        .with_subtype(OBJECT_TYPE_OMAP)
        .with_storage_flags(OBJ_PHYSICAL)
        .with_fixed_kv_size(true)
}

fn omap_entry(builder: NodeBuilder, oid: u64, xid: u64, paddr: u64) -> NodeBuilder {
    builder.with_record(
        Key::omap(oid, xid).encode(KeyFormat::ObjectMap).unwrap(),
        OmapVal::new(BLOCK_SIZE as u32, paddr).to_bytes().unwrap(),
    )
}

/// Open a volume whose object map maps the catalog root to `CATALOG_BLOCK`
fn volume_with(store: MemoryBlockStore, omap: NodeBuilder, xid: u64) -> Volume<MemoryBlockStore> {
    store.insert(OMAP_TREE, omap.build().unwrap()).unwrap();
    store
        .insert(
            OMAP_OBJECT,
            ObjectMapPhys::new(OMAP_OBJECT, xid, OMAP_TREE)
                .to_block(BLOCK_SIZE)
                .unwrap(),
        )
        .unwrap();
    Volume::open(store, OMAP_OBJECT, xid, BtreeConfig::default()).unwrap()
}

fn empty_catalog(xid: u64) -> Volume<MemoryBlockStore> {
    let store = MemoryBlockStore::new(BLOCK_SIZE).unwrap();
    let catalog = NodeBuilder::new(BLOCK_SIZE)
        .with_oid(CATALOG_OID)
        .with_xid(xid)
        .with_storage_flags(OBJ_VIRTUAL)
        .with_subtype(OBJECT_TYPE_FSTREE)
        .build()
        .unwrap();
    store.insert(CATALOG_BLOCK, catalog).unwrap();
    volume_with(
        store,
        omap_entry(omap_builder(xid), CATALOG_OID, xid, CATALOG_BLOCK),
        xid,
    )
}

fn insert(volume: &Volume<MemoryBlockStore>, root: &Node, txn: &Transaction, key: &Key, value: &[u8]) {
    let mut query = Query::new(root.clone(), key.clone(), QueryFlags::EXACT);
    match volume.btree_query(&mut query) {
        Err(BtreeError::NotFound) => {}
        other => panic!("key {key:?} should be new, got {other:?}"),
    }
    let raw = key.encode(KeyFormat::Catalog).unwrap();
    volume.btree_insert(&mut query, txn, &raw, Some(value)).unwrap();
}

fn lookup(volume: &Volume<MemoryBlockStore>, root: &Node, key: &Key) -> apfs_btree::Result<Vec<u8>> {
    let mut query = Query::new(root.clone(), key.clone(), QueryFlags::EXACT);
    volume.btree_query(&mut query)?;
    query.value()
}

/// Object map keys in scan order, checked to be strictly ascending
fn omap_keys(volume: &Volume<MemoryBlockStore>) -> Vec<(u64, u64)> {
    let keys: Vec<(u64, u64)> = volume
        .scan(volume.omap_root(), QueryFlags::OMAP)
        .unwrap()
        .iter()
        .map(|record| (record.key.id, record.key.number))
        .collect();
    assert!(
        keys.windows(2).all(|pair| pair[0] < pair[1]),
        "object map out of order: {keys:?}"
    );
    keys
}

// --- Single-node catalog ---

#[test]
fn insert_out_of_order_then_scan() {
    let volume = empty_catalog(2);
    let txn = Transaction::new(2, 0x500);
    let root = volume.omap_read_node(CATALOG_OID).unwrap();

    insert(&volume, &root, &txn, &Key::inode(5), b"A");
    insert(&volume, &root, &txn, &Key::inode(1), b"B");
    insert(&volume, &root, &txn, &Key::inode(9), b"C");

    let scanned: Vec<(u64, Vec<u8>)> = volume
        .scan(&root, QueryFlags::NONE)
        .unwrap()
        .into_iter()
        .map(|record| (record.key.id, record.value.unwrap()))
        .collect();
    assert_eq!(
        scanned,
        vec![
            (1, b"B".to_vec()),
            (5, b"A".to_vec()),
            (9, b"C".to_vec()),
        ]
    );
}

#[test]
fn insert_then_query_returns_value() {
    let volume = empty_catalog(2);
    let txn = Transaction::new(2, 0x500);
    let root = volume.omap_read_node(CATALOG_OID).unwrap();

    let entry = Key::dir_rec(2, "Documents", false);
    let extent = Key::file_extent(0x30, 8192);
    insert(&volume, &root, &txn, &entry, &0x30u64.to_le_bytes());
    insert(&volume, &root, &txn, &extent, &[0xee; 24]);

    assert_eq!(lookup(&volume, &root, &entry).unwrap(), 0x30u64.to_le_bytes().to_vec());
    assert_eq!(lookup(&volume, &root, &extent).unwrap(), vec![0xee; 24]);
    assert!(lookup(&volume, &root, &Key::file_extent(0x30, 0))
        .unwrap_err()
        .is_not_found());
}

#[test]
fn remove_then_query_is_not_found() {
    let volume = empty_catalog(2);
    let txn = Transaction::new(2, 0x500);
    let root = volume.omap_read_node(CATALOG_OID).unwrap();
    for id in [3, 4, 5] {
        insert(&volume, &root, &txn, &Key::inode(id), &[id as u8; 16]);
    }
    let before = root.records().unwrap();

    let mut query = Query::new(root.clone(), Key::inode(4), QueryFlags::EXACT);
    volume.btree_query(&mut query).unwrap();
    volume.btree_remove(&mut query, &txn).unwrap();

    assert_eq!(root.records().unwrap(), before - 1);
    assert!(lookup(&volume, &root, &Key::inode(4)).unwrap_err().is_not_found());
    assert_eq!(lookup(&volume, &root, &Key::inode(5)).unwrap(), vec![5; 16]);
}

#[test]
fn exact_fill_then_no_space() {
    let store = MemoryBlockStore::new(BLOCK_SIZE).unwrap();
    let catalog = NodeBuilder::new(BLOCK_SIZE)
        .with_oid(CATALOG_OID)
        .with_xid(2)
        .with_subtype(OBJECT_TYPE_FSTREE)
        .with_toc_capacity(8)
        .build()
        .unwrap();
    store.insert(CATALOG_BLOCK, catalog).unwrap();
    let volume = volume_with(
        store,
        omap_entry(omap_builder(2), CATALOG_OID, 2, CATALOG_BLOCK),
        2,
    );
    let txn = Transaction::new(2, 0x500);
    let root = volume.omap_read_node(CATALOG_OID).unwrap();

    let free = root.view().unwrap().free_space();
    let key = Key::inode(1).encode(KeyFormat::Catalog).unwrap();
    let value = vec![0x5a; free - key.len()];

    let mut query = Query::new(root.clone(), Key::inode(1), QueryFlags::EXACT);
    let _ = volume.btree_query(&mut query);
    volume.btree_insert(&mut query, &txn, &key, Some(value.as_slice())).unwrap();
    assert_eq!(root.view().unwrap().free_space(), 0);

    let mut query = Query::new(root.clone(), Key::inode(2), QueryFlags::EXACT);
    let _ = volume.btree_query(&mut query);
    let key = Key::inode(2).encode(KeyFormat::Catalog).unwrap();
    let err = volume
        .btree_insert(&mut query, &txn, &key, Some(b"x".as_slice()))
        .unwrap_err();
    assert!(matches!(err, BtreeError::NoSpace(CATALOG_BLOCK)));
    assert_eq!(lookup(&volume, &root, &Key::inode(1)).unwrap(), value);
}

#[test]
fn case_insensitive_volume_finds_folded_names() {
    let store = MemoryBlockStore::new(BLOCK_SIZE).unwrap();
    let entry = Key::dir_rec(2, "Read Me.txt", true);
    let catalog = NodeBuilder::new(BLOCK_SIZE)
        .with_oid(CATALOG_OID)
        .with_xid(2)
        .with_record(entry.encode(KeyFormat::Catalog).unwrap(), 0x77u64.to_le_bytes().to_vec())
        .build()
        .unwrap();
    store.insert(CATALOG_BLOCK, catalog).unwrap();
    store
        .insert(OMAP_TREE, omap_entry(omap_builder(2), CATALOG_OID, 2, CATALOG_BLOCK).build().unwrap())
        .unwrap();
    store
        .insert(OMAP_OBJECT, ObjectMapPhys::new(OMAP_OBJECT, 2, OMAP_TREE).to_block(BLOCK_SIZE).unwrap())
        .unwrap();
    let config = BtreeConfig::from_incompat_features(0x1);
    let volume = Volume::open(store, OMAP_OBJECT, 2, config).unwrap();
    let root = volume.omap_read_node(CATALOG_OID).unwrap();

    let probe = Key::dir_rec(2, "READ ME.TXT", true);
    assert_eq!(lookup(&volume, &root, &probe).unwrap(), 0x77u64.to_le_bytes().to_vec());

    let mut sensitive = Query::new(root.clone(), probe, QueryFlags::EXACT)
        .with_names(NameComparison::CASE_SENSITIVE);
    assert!(volume.btree_query(&mut sensitive).unwrap_err().is_not_found());
}

#[test]
fn multiple_query_lists_xattrs() {
    let volume = empty_catalog(2);
    let txn = Transaction::new(2, 0x500);
    let root = volume.omap_read_node(CATALOG_OID).unwrap();
    insert(&volume, &root, &txn, &Key::inode(16), b"inode");
    for name in ["com.apple.FinderInfo", "user.a", "user.b"] {
        insert(&volume, &root, &txn, &Key::xattr(16, name), name.as_bytes());
    }
    insert(&volume, &root, &txn, &Key::xattr(17, "user.a"), b"other");

    let mut query = Query::new(
        root.clone(),
        Key::xattr(16, ""),
        QueryFlags::MULTIPLE | QueryFlags::EXACT | QueryFlags::ANY_NAME,
    );
    let mut names = Vec::new();
    loop {
        match volume.btree_query(&mut query) {
            Ok(()) => names.push(query.record_key().unwrap().name.unwrap()),
            Err(BtreeError::NotFound) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(names, vec!["user.b", "user.a", "com.apple.FinderInfo"]);
}

// --- Object map ---

#[test]
fn omap_ceiling_scenario() {
    let store = MemoryBlockStore::new(BLOCK_SIZE).unwrap();
    let omap = omap_entry(omap_entry(omap_builder(30), 7, 10, 100), 7, 20, 200);
    let volume = volume_with(store, omap, 30);
    let root = volume.omap_root().clone();

    assert_eq!(volume.omap_lookup_block(&root, 7, 15, Access::Read).unwrap(), 100);
    assert_eq!(volume.omap_lookup_block(&root, 7, 25, Access::Read).unwrap(), 200);
    assert!(volume
        .omap_lookup_block(&root, 7, 5, Access::Read)
        .unwrap_err()
        .is_not_found());
}

#[test]
fn catalog_children_resolve_through_omap() {
    let store = MemoryBlockStore::new(BLOCK_SIZE).unwrap();
    let leaf = |oid: u64, ids: &[u64]| {
        let mut builder = NodeBuilder::new(BLOCK_SIZE)
            .with_oid(oid)
            .with_xid(3)
            .with_root(false);
        for id in ids {
            builder = builder.with_record(
                Key::inode(*id).encode(KeyFormat::Catalog).unwrap(),
                id.to_le_bytes().to_vec(),
            );
        }
        builder.build().unwrap()
    };
    store.insert(0x31, leaf(0x501, &[1, 2, 3])).unwrap();
    store.insert(0x32, leaf(0x502, &[10, 11])).unwrap();
    // stale version of 0x502 that a newer mapping supersedes
    store.insert(0x33, leaf(0x502, &[99])).unwrap();

    let root = NodeBuilder::new(BLOCK_SIZE)
        .with_oid(CATALOG_OID)
        .with_xid(3)
        .with_level(1)
        .with_record(Key::inode(1).encode(KeyFormat::Catalog).unwrap(), 0x501u64.to_le_bytes().to_vec())
        .with_record(Key::inode(10).encode(KeyFormat::Catalog).unwrap(), 0x502u64.to_le_bytes().to_vec());
    store.insert(CATALOG_BLOCK, root.build().unwrap()).unwrap();

    let omap = omap_builder(3);
    let omap = omap_entry(omap, CATALOG_OID, 3, CATALOG_BLOCK);
    let omap = omap_entry(omap, 0x501, 3, 0x31);
    let omap = omap_entry(omap, 0x502, 1, 0x33);
    let omap = omap_entry(omap, 0x502, 2, 0x32);
    let volume = volume_with(store, omap, 3);
    let root = volume.omap_read_node(CATALOG_OID).unwrap();

    assert_eq!(lookup(&volume, &root, &Key::inode(11)).unwrap(), 11u64.to_le_bytes().to_vec());
    let ids: Vec<u64> = volume
        .scan(&root, QueryFlags::NONE)
        .unwrap()
        .iter()
        .map(|record| record.key.id)
        .collect();
    assert_eq!(ids, vec![1, 2, 3, 10, 11]);
}

#[test]
fn copy_on_write_publishes_new_block() {
    let mut volume = empty_catalog(2);
    let spaceman = SequentialSpaceman::new(0x100, 0x110);

    // transaction 3 starts from a copy of the object map root
    let copied = omap_entry(omap_builder(3), CATALOG_OID, 2, CATALOG_BLOCK)
        .build()
        .unwrap();
    volume.store().insert(0x11, copied).unwrap();
    let map_root = volume.read_node(0x11).unwrap();
    volume.set_omap_root(map_root.clone());
    volume.set_xid(3);
    let txn = Transaction::new(3, 0x500);

    let block = volume
        .omap_lookup_block(
            &map_root,
            CATALOG_OID,
            3,
            Access::Write {
                txn: &txn,
                spaceman: &spaceman,
            },
        )
        .unwrap();
    assert_eq!(block, 0x100);
    assert_eq!(spaceman.freed(), vec![CATALOG_BLOCK]);

    let catalog = volume.omap_read_node(CATALOG_OID).unwrap();
    assert_eq!(catalog.block_number(), 0x100);
    assert_eq!(catalog.xid(), 3);
    insert(&volume, &catalog, &txn, &Key::inode(2), b"root dir");
    assert_eq!(volume.store().dirty_blocks(), vec![0x11, 0x100]);
    assert_eq!(omap_keys(&volume), vec![(CATALOG_OID, 3)]);
}

#[test]
fn copy_on_write_beside_older_version() {
    let store = MemoryBlockStore::new(BLOCK_SIZE).unwrap();
    let catalog = |xid: u64| {
        NodeBuilder::new(BLOCK_SIZE)
            .with_oid(CATALOG_OID)
            .with_xid(xid)
            .with_subtype(OBJECT_TYPE_FSTREE)
            .build()
            .unwrap()
    };
    store.insert(0x21, catalog(1)).unwrap();
    store.insert(CATALOG_BLOCK, catalog(2)).unwrap();
    let omap = omap_entry(omap_builder(3), CATALOG_OID, 1, 0x21);
    let omap = omap_entry(omap, CATALOG_OID, 2, CATALOG_BLOCK);
    let volume = volume_with(store, omap, 3);
    let spaceman = SequentialSpaceman::new(0x100, 0x110);
    let txn = Transaction::new(3, 0x500);
    let root = volume.omap_root().clone();

    // a writer asking below the newest version still rewrites the newest
    let block = volume
        .omap_lookup_block(
            &root,
            CATALOG_OID,
            1,
            Access::Write {
                txn: &txn,
                spaceman: &spaceman,
            },
        )
        .unwrap();
    assert_eq!(block, 0x100);
    assert_eq!(spaceman.freed(), vec![CATALOG_BLOCK]);
    assert_eq!(omap_keys(&volume), vec![(CATALOG_OID, 1), (CATALOG_OID, 3)]);

    assert_eq!(volume.omap_read_node(CATALOG_OID).unwrap().block_number(), 0x100);
    assert_eq!(
        volume.omap_lookup_block(&root, CATALOG_OID, 2, Access::Read).unwrap(),
        0x21
    );
}

// --- Damaged trees ---

#[test]
fn self_cycle_fails_after_twelve_descents() {
    let store = MemoryBlockStore::new(BLOCK_SIZE).unwrap();
    let cycle = omap_builder(1)
        .with_oid(0x30)
        .with_level(1)
        .with_record(
            Key::omap(1, 1).encode(KeyFormat::ObjectMap).unwrap(),
            0x30u64.to_le_bytes().to_vec(),
        );
    store.insert(0x30, cycle.build().unwrap()).unwrap();
    let volume = volume_with(store, omap_builder(1), 1);
    let node = volume.read_node(0x30).unwrap();

    for flags in [QueryFlags::OMAP, QueryFlags::OMAP | QueryFlags::MULTIPLE] {
        let before = volume.store().read_count();
        let mut query = Query::new(node.clone(), Key::omap(5, 5), flags);
        let err = volume.btree_query(&mut query).unwrap_err();
        assert!(matches!(err, BtreeError::Corrupted(ref m) if m.contains("too deep")));
        assert_eq!(volume.store().read_count() - before, 12);
        assert_eq!(query.depth(), 12);
    }

    let err = volume.scan(&node, QueryFlags::OMAP).unwrap_err();
    assert!(err.is_corruption());
}

#[test]
fn missing_child_block_is_io_error() {
    let store = MemoryBlockStore::new(BLOCK_SIZE).unwrap();
    let root = omap_builder(1).with_oid(0x30).with_level(1).with_record(
        Key::omap(1, 1).encode(KeyFormat::ObjectMap).unwrap(),
        0x999u64.to_le_bytes().to_vec(),
    );
    store.insert(0x30, root.build().unwrap()).unwrap();
    let volume = volume_with(store, omap_builder(1), 1);
    let node = volume.read_node(0x30).unwrap();
    let mut query = Query::new(node, Key::omap(1, 1), QueryFlags::OMAP);
    assert!(matches!(
        volume.btree_query(&mut query),
        Err(BtreeError::Io(_))
    ));
}

#[test]
fn corrupt_child_checksum_is_reported() {
    let volume = empty_catalog(2);
    let mut data = volume.store().read_block(CATALOG_BLOCK).unwrap().to_vec();
    data[200] ^= 1;
    volume.store().insert(CATALOG_BLOCK, data).unwrap();
    let err = volume.omap_read_node(CATALOG_OID).unwrap_err();
    assert!(matches!(err, BtreeError::Checksum { block: CATALOG_BLOCK, .. }));
}

// --- Properties ---

fn catalog_node_with(ids: &[u64]) -> Node {
    let mut builder = NodeBuilder::new(BLOCK_SIZE).with_oid(CATALOG_OID);
    for id in ids {
        builder = builder.with_record(
            Key::inode(*id).encode(KeyFormat::Catalog).unwrap(),
            vec![0; 4],
        );
    }
    let store = MemoryBlockStore::new(BLOCK_SIZE).unwrap();
    store.insert(CATALOG_BLOCK, builder.build().unwrap()).unwrap();
    Node::open(store.read_block(CATALOG_BLOCK).unwrap(), &BtreeConfig::default()).unwrap()
}

proptest! {
    #[test]
    fn records_are_strictly_ascending(ids in prop::collection::btree_set(0u64..1 << 40, 0..150)) {
        let ids: Vec<u64> = ids.into_iter().collect();
        let node = catalog_node_with(&ids);
        let view = node.view().unwrap();
        prop_assert_eq!(view.records(), ids.len());
        for index in 1..view.records() {
            let previous = view.key_at(index - 1, KeyFormat::Catalog).unwrap();
            let current = view.key_at(index, KeyFormat::Catalog).unwrap();
            prop_assert_eq!(
                compare(&previous, &current, NameComparison::default()),
                Ordering::Less
            );
        }
    }

    #[test]
    fn inserts_in_any_order_are_all_found(
        entries in prop::collection::btree_map(1u64..10_000, prop::collection::vec(any::<u8>(), 0..24), 1..40),
        seed in any::<u64>(),
    ) {
        let volume = empty_catalog(2);
        let txn = Transaction::new(2, 0x500);
        let root = volume.omap_read_node(CATALOG_OID).unwrap();

        let mut order: Vec<(&u64, &Vec<u8>)> = entries.iter().collect();
        let len = order.len();
        order.rotate_left((seed as usize) % len);
        if seed & 1 == 1 {
            order.reverse();
        }
        for (id, value) in &order {
            insert(&volume, &root, &txn, &Key::inode(**id), value);
        }

        for (id, value) in &entries {
            prop_assert_eq!(&lookup(&volume, &root, &Key::inode(*id)).unwrap(), value);
        }
        let scanned: BTreeMap<u64, Vec<u8>> = volume
            .scan(&root, QueryFlags::NONE)
            .unwrap()
            .into_iter()
            .map(|record| (record.key.id, record.value.unwrap()))
            .collect();
        prop_assert_eq!(scanned, entries);
    }

    #[test]
    fn omap_returns_newest_at_or_below_ceiling(
        versions in prop::collection::btree_set(1u64..1000, 1..30),
        ceiling in 0u64..1100,
    ) {
        let mut omap = omap_builder(2000);
        omap = omap_entry(omap, 6, 500, 0x6);
        for xid in &versions {
            omap = omap_entry(omap, 7, *xid, 0x1000 + xid);
        }
        omap = omap_entry(omap, 8, 1, 0x8);
        let volume = volume_with(MemoryBlockStore::new(BLOCK_SIZE).unwrap(), omap, 2000);

        let expected = versions.range(..=ceiling).next_back().map(|xid| 0x1000 + xid);
        let found = volume.omap_lookup_block(volume.omap_root(), 7, ceiling, Access::Read);
        match expected {
            Some(block) => prop_assert_eq!(found.unwrap(), block),
            None => prop_assert!(found.unwrap_err().is_not_found()),
        }
    }
}
