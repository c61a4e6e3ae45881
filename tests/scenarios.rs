//! End-to-end index scenarios on small pages: point lookups, duplicate
//! handling, iterator invalidation and the exact shape of the first
//! root split.

use burrowdb::btree::page::deserialize_node;
use burrowdb::btree::LeafEntryIterator;
use burrowdb::{BTree, FileChannel, IndexError, StorageChannel, TreeConfig};
use tempfile::tempdir;

fn create_tree(page_size: usize, unique: bool) -> (tempfile::TempDir, BTree<FileChannel>) {
    let dir = tempdir().unwrap();
    let cfg = TreeConfig::new(page_size, unique, 8).unwrap();
    let channel = FileChannel::create(dir.path().join("index.pag"), page_size).unwrap();
    (dir, BTree::create(channel, cfg).unwrap())
}

fn drain(iter: &mut LeafEntryIterator, tree: &mut BTree<FileChannel>) -> Vec<(i64, i64)> {
    let mut entries = Vec::new();
    while let Some(entry) = iter.next(tree).unwrap() {
        entries.push((entry.key, entry.value));
    }
    entries
}

#[test]
fn unsorted_inserts_come_back_sorted() {
    let (_dir, mut tree) = create_tree(128, true);

    for key in [5, 2, 8, 1, 9, 3] {
        tree.insert(key, key * 10).unwrap();
    }

    let mut iter = tree.iterator().unwrap();
    let entries = drain(&mut iter, &mut tree);
    assert_eq!(
        entries,
        vec![(1, 10), (2, 20), (3, 30), (5, 50), (8, 80), (9, 90)]
    );

    assert_eq!(tree.search(5).unwrap(), Some(50));
    assert_eq!(tree.search(6).unwrap(), None);
}

#[test]
fn hundred_sequential_inserts_build_a_multi_level_tree() {
    let (_dir, mut tree) = create_tree(128, true);

    for key in 1..=100 {
        tree.insert(key, key * 10).unwrap();
    }

    assert!(tree.height().unwrap() >= 2);

    assert_eq!(tree.remove(50, 500).unwrap(), 500);
    assert_eq!(tree.search(50).unwrap(), None);
    tree.validate().unwrap();

    let mut iter = tree.iterator().unwrap();
    let entries = drain(&mut iter, &mut tree);
    assert_eq!(entries.len(), 99);
    assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
}

#[test]
fn duplicate_keys_in_non_unique_mode() {
    let (_dir, mut tree) = create_tree(128, false);

    for (key, value) in [(10, 1), (10, 2), (10, 3), (20, 1)] {
        tree.insert(key, value).unwrap();
    }

    assert_eq!(tree.remove(10, 2).unwrap(), 2);

    let mut iter = tree.iterator().unwrap();
    assert_eq!(drain(&mut iter, &mut tree), vec![(10, 1), (10, 3), (20, 1)]);
}

#[test]
fn stepping_iterator_fails_after_an_insert() {
    let (_dir, mut tree) = create_tree(128, true);
    for key in 1..=20 {
        tree.insert(key, key).unwrap();
    }

    let mut iter = tree.iterator().unwrap();
    assert!(iter.next(&mut tree).unwrap().is_some());

    tree.insert(999, 999).unwrap();

    assert!(matches!(
        iter.has_next(&tree).unwrap_err().downcast_ref::<IndexError>(),
        Some(IndexError::ConcurrentModification { .. })
    ));
    assert!(matches!(
        iter.next(&mut tree).unwrap_err().downcast_ref::<IndexError>(),
        Some(IndexError::ConcurrentModification { .. })
    ));
}

#[test]
fn first_root_split_promotes_the_computed_separator() {
    // an 88-byte page holds exactly seven small keys in the root leaf
    let (_dir, mut tree) = create_tree(88, true);

    for key in 1..=7 {
        tree.insert(key, key * 10).unwrap();
        assert_eq!(tree.height().unwrap(), 1);
    }

    tree.insert(8, 80).unwrap();
    assert_eq!(tree.height().unwrap(), 2);
    tree.validate().unwrap();

    // the balanced split point of [1..7] keeps four keys on the left;
    // the separator duplicates the right sibling's first entry
    let (root_keys, left_keys, right_keys) = committed_root_shape(&mut tree);
    assert_eq!(root_keys, vec![5]);
    assert_eq!(left_keys, vec![1, 2, 3, 4]);
    assert_eq!(right_keys, vec![5, 6, 7, 8]);

    let mut iter = tree.iterator().unwrap();
    let entries = drain(&mut iter, &mut tree);
    assert_eq!(entries.len(), 8);
    for (i, &(key, value)) in entries.iter().enumerate() {
        assert_eq!(key, i as i64 + 1);
        assert_eq!(value, key * 10);
    }
}

/// Commits and decodes the root page and its first two children
/// straight from the storage channel.
fn committed_root_shape(tree: &mut BTree<FileChannel>) -> (Vec<i64>, Vec<i64>, Vec<i64>) {
    tree.commit().unwrap();
    let cfg = tree.config();
    let root_id = tree.root_page_id();

    let read = |tree: &BTree<FileChannel>, id: i32| -> Vec<u8> {
        tree.buffer_manager()
            .channel()
            .read_page(id as u32)
            .unwrap()
            .to_vec()
    };

    let root = deserialize_node(&read(tree, root_id), cfg, root_id).unwrap();
    assert!(!root.is_leaf());

    let left_id = root.child_id(0);
    let right_id = root.child_id(1);
    let left = deserialize_node(&read(tree, left_id), cfg, left_id).unwrap();
    let right = deserialize_node(&read(tree, right_id), cfg, right_id).unwrap();

    (root.keys().to_vec(), left.keys().to_vec(), right.keys().to_vec())
}
