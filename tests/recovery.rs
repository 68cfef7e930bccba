use std::collections::BTreeMap;
use std::sync::Arc;

use latchtree::primitives::journal::{JournalOp, NodeOp};
use latchtree::storage::btree::{
    Btree, BtreeConfig, ExtentKey, KeyRange, MemNodeStore, NodeStore, ReplayOutcome, SplitKeyFn,
};
use latchtree::Result;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

type Store = MemNodeStore<u64, u64>;

fn small_cfg() -> BtreeConfig {
    let mut cfg = BtreeConfig::new(96, 8, 8);
    cfg.name = "recovery".to_string();
    cfg.ideal_fill_pct = 84;
    cfg.merge_pct = 40;
    cfg
}

fn as_dyn(store: &Arc<Store>) -> Arc<dyn NodeStore<u64, u64>> {
    store.clone()
}

/// Tree holding `keys`, checkpointed so the journal starts empty.
fn seeded_tree(keys: &[u64]) -> Result<(Btree<u64, u64>, Arc<Store>)> {
    let store = Arc::new(Store::new());
    let tree = Btree::create(small_cfg(), as_dyn(&store))?;
    for &key in keys {
        tree.insert(key, key * 10)?;
    }
    tree.checkpoint()?;
    Ok((tree, store))
}

fn assert_keys_present(tree: &Btree<u64, u64>, keys: &[u64]) -> Result<()> {
    for &key in keys {
        assert_eq!(tree.get(&key)?, Some(key * 10), "lost key {key}");
    }
    Ok(())
}

/// Runs `op` once to learn how many durable writes it issues, then replays it with every
/// shorter write budget, crashing and recovering after each.
fn crash_at_every_write<F, C>(keys: &[u64], mut op: F, check: C) -> Result<()>
where
    F: FnMut(&Btree<u64, u64>) -> Result<()>,
    C: Fn(&Btree<u64, u64>) -> Result<()>,
{
    let (tree, store) = seeded_tree(keys)?;
    let writes_before = tree.stats_snapshot().node_writes;
    let journal_before = store.journal_len();
    op(&tree)?;
    let node_writes = tree.stats_snapshot().node_writes - writes_before;
    let frames = (store.journal_len() - journal_before) as u64;
    assert!(frames > 0, "operation must journal a structural change");
    drop(tree);

    for budget in 0..=(node_writes + frames) {
        let (tree, store) = seeded_tree(keys)?;
        store.set_write_budget(Some(budget));
        op(&tree)?;
        drop(tree);
        store.crash();
        let recovered = Btree::recover(small_cfg(), as_dyn(&store))?;
        recovered.verify()?;
        check(&recovered)?;
        assert_eq!(store.journal_len(), 0, "recovery must checkpoint");
    }
    Ok(())
}

#[test]
fn leaf_split_survives_crash_at_every_write() -> Result<()> {
    let keys: Vec<u64> = (0..12).collect();
    crash_at_every_write(
        &keys,
        |tree| {
            // Keys land in the rightmost leaf until it splits.
            for key in 100..104 {
                tree.insert(key, key * 10)?;
            }
            Ok(())
        },
        |tree| assert_keys_present(tree, &keys),
    )
}

#[test]
fn root_split_survives_crash_at_every_write() -> Result<()> {
    let keys: Vec<u64> = (1..=6).collect();
    crash_at_every_write(
        &keys,
        |tree| tree.insert(7, 70).map(|_| ()),
        |tree| {
            assert_keys_present(tree, &keys)?;
            assert!(tree.depth()? <= 2);
            Ok(())
        },
    )
}

#[test]
fn merges_survive_crash_at_every_write() -> Result<()> {
    let keys: Vec<u64> = (0..24).collect();
    let doomed: Vec<u64> = (4..20).collect();
    let survivors: Vec<u64> = keys.iter().copied().filter(|k| !doomed.contains(k)).collect();
    crash_at_every_write(
        &keys,
        |tree| {
            for key in &doomed {
                tree.remove(key)?;
            }
            Ok(())
        },
        |tree| assert_keys_present(tree, &survivors),
    )
}

#[test]
fn collapse_survives_crash_at_every_write() -> Result<()> {
    // Leaves {10,20,30} and {40,50,60,70}; the second removal folds the right one in.
    let keys: Vec<u64> = (10..=70).step_by(10).collect();
    crash_at_every_write(
        &keys,
        |tree| {
            tree.remove(&40)?;
            tree.remove(&50)?;
            Ok(())
        },
        |tree| assert_keys_present(tree, &[10, 20, 30, 60, 70]),
    )
}

#[test]
fn collapse_leaves_a_single_leaf_root() -> Result<()> {
    let (tree, store) = seeded_tree(&(10..=70).step_by(10).collect::<Vec<_>>())?;
    assert_eq!(tree.depth()?, 2);
    tree.remove(&40)?;
    tree.remove(&50)?;
    assert_eq!(tree.depth()?, 1);
    let entries = store.journal_entries()?;
    assert!(entries.iter().any(|e| e.op == JournalOp::Merge && e.is_root));
    tree.verify()?;
    Ok(())
}

#[test]
fn recovery_after_random_workload_and_crash() -> Result<()> {
    let mut keys: Vec<u64> = (0..300).collect();
    keys.shuffle(&mut ChaCha8Rng::seed_from_u64(42));
    let (tree, store) = seeded_tree(&keys[..100])?;
    store.set_write_budget(Some(250));
    for &key in &keys[100..] {
        tree.insert(key, key * 10)?;
    }
    for &key in &keys[..50] {
        tree.remove(&key)?;
    }
    drop(tree);
    store.crash();

    let pending = store.journal_entries()?;
    let recovered = Btree::recover(small_cfg(), as_dyn(&store))?;
    recovered.verify()?;
    assert!(recovered.stats().obj_count() > 0);
    assert_eq!(
        recovered.query(KeyRange::all(), None)?.len() as i64,
        recovered.stats().obj_count()
    );
    assert!(!pending.is_empty());
    Ok(())
}

#[test]
fn replaying_applied_splits_is_a_no_op() -> Result<()> {
    let (tree, store) = seeded_tree(&[])?;
    for key in 0..40u64 {
        tree.insert(key, key * 10)?;
    }
    let entries = store.journal_entries()?;
    assert!(entries.iter().all(|e| e.op == JournalOp::Split));
    let before = tree.dump()?;
    for entry in &entries {
        assert_eq!(tree.replay(entry)?, ReplayOutcome::NotNeeded);
    }
    assert_eq!(tree.dump()?, before);
    tree.verify()?;
    Ok(())
}

#[test]
fn recovered_journal_replays_as_no_op() -> Result<()> {
    let (tree, store) = seeded_tree(&(0..20).collect::<Vec<_>>())?;
    store.set_write_budget(Some(3));
    for key in 20..40u64 {
        tree.insert(key, key * 10)?;
    }
    drop(tree);
    store.crash();
    let pending = store.journal_entries()?;
    assert!(!pending.is_empty());

    let recovered = Btree::recover(small_cfg(), as_dyn(&store))?;
    let before = recovered.dump()?;
    for entry in &pending {
        assert_eq!(recovered.replay(entry)?, ReplayOutcome::NotNeeded);
    }
    assert_eq!(recovered.dump()?, before);
    recovered.verify()?;
    Ok(())
}

#[test]
fn merge_and_collapse_entries_replay_only_once() -> Result<()> {
    let keys: Vec<u64> = (0..30).collect();
    let remove_all = |tree: &Btree<u64, u64>| -> Result<()> {
        for key in &keys {
            tree.remove(key)?;
        }
        Ok(())
    };
    let (tree, store) = seeded_tree(&keys)?;
    let writes_before = tree.stats_snapshot().node_writes;
    remove_all(&tree)?;
    let cut_points = tree.stats_snapshot().node_writes - writes_before + store.journal_len() as u64;
    drop(tree);

    let (mut with_merge, mut with_collapse) = (0, 0);
    for budget in (0..=cut_points).map(Some).chain([None]) {
        let (tree, store) = seeded_tree(&keys)?;
        store.set_write_budget(budget);
        remove_all(&tree)?;
        drop(tree);
        store.crash();
        let pending = store.journal_entries()?;
        if !pending.iter().any(|e| e.op == JournalOp::Merge) {
            continue;
        }
        with_merge += 1;
        if pending.iter().any(|e| e.op == JournalOp::Merge && e.is_root) {
            with_collapse += 1;
        }

        let opened = Btree::open(small_cfg(), as_dyn(&store))?;
        for entry in &pending {
            opened.replay(entry)?;
        }
        let replayed = opened.dump()?;
        for entry in &pending {
            assert_eq!(
                opened.replay(entry)?,
                ReplayOutcome::NotNeeded,
                "second replay of {entry} at budget {budget:?}"
            );
        }
        assert_eq!(opened.dump()?, replayed);
    }
    assert!(with_merge > 0);
    assert!(with_collapse > 0);
    Ok(())
}

#[test]
fn destroy_survives_crash_at_every_write() -> Result<()> {
    let keys: Vec<u64> = (0..40).collect();
    let (tree, store) = seeded_tree(&keys)?;
    let nodes = tree.node_count()?;
    let doomed = nodes.leaves + nodes.interiors - 1;
    tree.destroy()?;
    assert_eq!(store.durable_node_count(), 1);
    drop(tree);

    // One journal entry, the root write, one free per doomed node and the journal clear.
    for budget in 0..=(doomed + 3) {
        let (tree, store) = seeded_tree(&keys)?;
        store.set_write_budget(Some(budget));
        tree.destroy()?;
        drop(tree);
        store.crash();
        let recovered = Btree::recover(small_cfg(), as_dyn(&store))?;
        recovered.verify()?;
        let count = recovered.node_count()?;
        match recovered.stats().obj_count() {
            0 => assert_eq!((count.leaves, count.interiors), (1, 0)),
            40 => assert_keys_present(&recovered, &keys)?,
            other => panic!("destroy left {other} objects at budget {budget}"),
        }
        assert_eq!(
            store.durable_node_count() as u64,
            count.leaves + count.interiors,
            "orphaned nodes at budget {budget}"
        );
    }
    Ok(())
}

#[test]
fn merge_journal_names_leftmost_removals_and_replacements() -> Result<()> {
    let (tree, store) = seeded_tree(&(0..30).collect::<Vec<_>>())?;
    for key in 0..10u64 {
        tree.remove(&key)?;
    }
    let entries = store.journal_entries()?;
    let merge = entries
        .iter()
        .find(|e| e.op == JournalOp::Merge && !e.is_root)
        .expect("a merge was journaled");
    assert_eq!(merge.nodes[0].op, NodeOp::InplaceWrite);
    assert!(merge.nodes_with(NodeOp::Removal).count() >= 1);
    assert!(tree.stats().merges() > 0);
    tree.verify()?;
    Ok(())
}

#[test]
fn saved_image_reloads_into_an_equal_tree() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("tree.img");
    let mut reference = BTreeMap::new();
    let (tree, store) = seeded_tree(&[])?;
    for key in (0..200u64).rev() {
        tree.insert(key, key * 10)?;
        reference.insert(key, key * 10);
    }
    for key in (0..200u64).step_by(3) {
        tree.remove(&key)?;
        reference.remove(&key);
    }
    store.save_image(&path)?;
    drop(tree);

    let loaded = Arc::new(Store::load_image(&path)?);
    let tree = Btree::recover(small_cfg(), as_dyn(&loaded))?;
    tree.verify()?;
    let all: BTreeMap<u64, u64> = tree.query(KeyRange::all(), None)?.into_iter().collect();
    assert_eq!(all, reference);
    Ok(())
}

#[test]
fn open_without_replay_sees_checkpointed_state() -> Result<()> {
    let keys: Vec<u64> = (0..50).collect();
    let (tree, store) = seeded_tree(&keys)?;
    drop(tree);
    store.crash();
    let tree = Btree::open(small_cfg(), as_dyn(&store))?;
    tree.verify()?;
    assert_keys_present(&tree, &keys)?;
    assert_eq!(tree.stats().obj_count(), 50);
    Ok(())
}

/// Cuts `key` after the last unit of `at`; the value is the first unit's payload offset.
fn divide_extent(
    key: &ExtentKey,
    value: &u64,
    at: &ExtentKey,
) -> Result<((ExtentKey, u64), (ExtentKey, u64))> {
    let head = (at.last() - key.start + 1) as u32;
    Ok((
        (ExtentKey::new(key.start, head), *value),
        (ExtentKey::new(at.last() + 1, key.len - head), *value + u64::from(head)),
    ))
}

#[test]
fn extent_tree_recovers_with_divider() -> Result<()> {
    let store = Arc::new(MemNodeStore::<ExtentKey, u64>::new());
    let dyn_store: Arc<dyn NodeStore<ExtentKey, u64>> = store.clone();
    let mut cfg = BtreeConfig::new(80, 12, 8);
    cfg.name = "extents".to_string();
    cfg.ideal_fill_pct = 75;
    let divide: SplitKeyFn<ExtentKey, u64> = Arc::new(divide_extent);
    let tree = Btree::create(cfg.clone(), dyn_store.clone())?.with_split_key_fn(divide.clone());
    for idx in 0..40u64 {
        tree.insert(ExtentKey::new(idx * 10, 5), idx * 1000)?;
    }
    store.set_write_budget(Some(5));
    for idx in 40..60u64 {
        tree.insert(ExtentKey::new(idx * 10, 5), idx * 1000)?;
    }
    drop(tree);
    store.crash();

    let tree = Btree::recover_with(cfg, dyn_store, Some(divide))?;
    tree.verify()?;
    for idx in 0..40u64 {
        assert_eq!(tree.get(&ExtentKey::new(idx * 10, 5))?, Some(idx * 1000));
    }
    Ok(())
}
