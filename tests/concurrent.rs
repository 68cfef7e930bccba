use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use latchtree::storage::btree::{Btree, BtreeConfig, Flips, KeyRange, MemNodeStore, NodeStore};
use latchtree::Result;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const NUM_THREADS: usize = 8;
const KEYS_PER_THREAD: u64 = 400;

fn small_tree() -> Result<Arc<Btree<u64, u64>>> {
    let mut cfg = BtreeConfig::new(96, 8, 8);
    cfg.name = "concurrent".to_string();
    cfg.ideal_fill_pct = 84;
    cfg.merge_pct = 40;
    let store: Arc<dyn NodeStore<u64, u64>> = Arc::new(MemNodeStore::new());
    Ok(Arc::new(Btree::create(cfg, store)?))
}

fn thread_keys(thread_id: usize) -> impl Iterator<Item = u64> {
    let base = thread_id as u64 * KEYS_PER_THREAD;
    base..base + KEYS_PER_THREAD
}

#[test]
fn disjoint_concurrent_inserts_are_all_visible() -> Result<()> {
    let tree = small_tree()?;
    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let mut handles = vec![];

    for thread_id in 0..NUM_THREADS {
        let tree = Arc::clone(&tree);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || -> Result<()> {
            let mut keys: Vec<u64> = thread_keys(thread_id).collect();
            keys.shuffle(&mut ChaCha8Rng::seed_from_u64(thread_id as u64));
            barrier.wait();
            for key in keys {
                tree.insert(key, key * 3)?;
            }
            Ok(())
        }));
    }
    for handle in handles {
        handle.join().expect("writer thread panicked")?;
    }

    tree.verify()?;
    let total = NUM_THREADS as u64 * KEYS_PER_THREAD;
    assert_eq!(tree.stats().obj_count(), total as i64);
    for key in 0..total {
        assert_eq!(tree.get(&key)?, Some(key * 3));
    }
    Ok(())
}

#[test]
fn concurrent_inserts_and_removes_keep_counts_exact() -> Result<()> {
    let tree = small_tree()?;
    for key in 0..NUM_THREADS as u64 * KEYS_PER_THREAD {
        tree.insert(key, key)?;
    }
    tree.set_flips(Flips {
        upgrade_fail_count: 0,
        upgrade_delay: Some(Duration::from_micros(20)),
    });
    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let mut handles = vec![];

    for thread_id in 0..NUM_THREADS {
        let tree = Arc::clone(&tree);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || -> Result<Vec<u64>> {
            let mut rng = ChaCha8Rng::seed_from_u64(0xC0FFEE + thread_id as u64);
            let mut removed = Vec::new();
            barrier.wait();
            for key in thread_keys(thread_id) {
                if rng.gen_bool(0.5) {
                    assert_eq!(tree.remove(&key)?, Some(key));
                    removed.push(key);
                } else {
                    assert_eq!(tree.get(&key)?, Some(key));
                }
            }
            Ok(removed)
        }));
    }
    let mut removed = Vec::new();
    for handle in handles {
        removed.extend(handle.join().expect("worker thread panicked")?);
    }

    tree.verify()?;
    let total = NUM_THREADS as u64 * KEYS_PER_THREAD;
    assert_eq!(tree.stats().obj_count(), (total - removed.len() as u64) as i64);
    for key in removed {
        assert_eq!(tree.get(&key)?, None);
    }
    assert!(tree.stats().merges() > 0);
    Ok(())
}

#[test]
fn concurrent_remove_any_drains_a_range_exactly_once() -> Result<()> {
    let tree = small_tree()?;
    for key in 0..1_000u64 {
        tree.insert(key, key)?;
    }
    let window = KeyRange::new(100u64, true, 900, false);
    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let mut handles = vec![];

    for _ in 0..NUM_THREADS {
        let tree = Arc::clone(&tree);
        let barrier = Arc::clone(&barrier);
        let window = window.clone();
        handles.push(thread::spawn(move || -> Result<Vec<u64>> {
            let mut taken = Vec::new();
            barrier.wait();
            while let Some((key, value)) = tree.remove_any(&window)? {
                assert_eq!(key, value);
                taken.push(key);
            }
            Ok(taken)
        }));
    }
    let mut taken = Vec::new();
    for handle in handles {
        taken.extend(handle.join().expect("drain thread panicked")?);
    }

    taken.sort_unstable();
    assert_eq!(taken, (100..900).collect::<Vec<_>>());
    assert_eq!(tree.get_any(&window)?, None);
    assert_eq!(tree.stats().obj_count(), 200);
    assert_eq!(tree.get(&99)?, Some(99));
    assert_eq!(tree.get(&900)?, Some(900));
    tree.verify()?;
    Ok(())
}

#[test]
fn readers_and_range_updates_run_beside_writers() -> Result<()> {
    let tree = small_tree()?;
    let span = NUM_THREADS as u64 * KEYS_PER_THREAD;
    for key in (0..span).step_by(2) {
        tree.insert(key, 0)?;
    }
    let barrier = Arc::new(Barrier::new(NUM_THREADS + 2));
    let mut handles = vec![];

    for thread_id in 0..NUM_THREADS {
        let tree = Arc::clone(&tree);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || -> Result<()> {
            barrier.wait();
            for key in thread_keys(thread_id).filter(|k| k % 2 == 1) {
                tree.insert(key, 0)?;
            }
            Ok(())
        }));
    }
    {
        let tree = Arc::clone(&tree);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || -> Result<()> {
            barrier.wait();
            for round in 0..20u64 {
                let lo = (round * 97) % span;
                tree.range_update(KeyRange::new(lo, true, lo + 64, false), |entries, _| {
                    Ok(entries.iter().map(|(k, v)| (*k, v + 1)).collect())
                })?;
            }
            Ok(())
        }));
    }
    {
        let tree = Arc::clone(&tree);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || -> Result<()> {
            barrier.wait();
            for _ in 0..50 {
                let hits = tree.query(KeyRange::all(), None)?;
                assert!(hits.windows(2).all(|pair| pair[0].0 < pair[1].0));
            }
            Ok(())
        }));
    }
    for handle in handles {
        handle.join().expect("thread panicked")?;
    }

    tree.verify()?;
    assert_eq!(tree.stats().obj_count(), span as i64);
    let all = tree.query(KeyRange::all(), None)?;
    assert_eq!(all.len() as u64, span);
    assert!(all.iter().filter(|(k, _)| k % 2 == 0).all(|(_, v)| *v <= 20));
    Ok(())
}

#[test]
fn checkpoints_interleave_with_writers() -> Result<()> {
    let tree = small_tree()?;
    let barrier = Arc::new(Barrier::new(NUM_THREADS + 1));
    let mut handles = vec![];
    for thread_id in 0..NUM_THREADS {
        let tree = Arc::clone(&tree);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || -> Result<()> {
            barrier.wait();
            for key in thread_keys(thread_id) {
                tree.insert(key, key)?;
                if key % 3 == 0 {
                    tree.remove(&key)?;
                }
            }
            Ok(())
        }));
    }
    {
        let tree = Arc::clone(&tree);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || -> Result<()> {
            barrier.wait();
            for _ in 0..30 {
                tree.checkpoint()?;
                thread::yield_now();
            }
            Ok(())
        }));
    }
    for handle in handles {
        handle.join().expect("thread panicked")?;
    }
    tree.verify()?;
    let total = NUM_THREADS as u64 * KEYS_PER_THREAD;
    let expected = (0..total).filter(|k| k % 3 != 0).count() as i64;
    assert_eq!(tree.stats().obj_count(), expected);
    Ok(())
}
