#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use gbtree::primitives::io::StdFileSystem;
use gbtree::types::{Result, TreeError};
use gbtree::{GbTree, GbTreeBuilder, LongLayout, PageCache, PageCacheOptions};
use tempfile::tempdir;

const STABLE_KEYS: u64 = 2_000;

fn open_tree(dir: &std::path::Path, cache_bytes: usize) -> Result<GbTree<LongLayout>> {
    let cache = PageCache::create(
        Arc::new(StdFileSystem),
        PageCacheOptions {
            page_size: 4096,
            cache_bytes,
            verify_checksums: true,
        },
    )?;
    GbTreeBuilder::new(
        &cache,
        dir.join("concurrent.gbt"),
        LongLayout::with_key_padding(120),
    )
    .build()
}

/// Even keys exist before the readers start and are never touched again;
/// odd keys are inserted and removed while the readers scan.
#[test]
fn seekers_observe_stable_keys_exactly_once_during_writes() -> Result<()> {
    let dir = tempdir()?;
    let tree = open_tree(dir.path(), 8 << 20)?;
    let mut writer = tree.writer()?;
    for key in 0..STABLE_KEYS {
        writer.put(&(key * 2), &(key * 2))?;
    }
    tree.checkpoint()?;

    let done = AtomicBool::new(false);
    let (tree, done) = (&tree, &done);
    thread::scope(|scope| -> Result<()> {
        let readers: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(move || -> Result<u64> {
                    let mut scans = 0;
                    while !done.load(Ordering::Acquire) || scans == 0 {
                        let mut last = None;
                        let mut stable_seen = 0;
                        for entry in tree.scan()?.entries() {
                            let (key, value) = entry?;
                            if let Some(last) = last {
                                if key <= last {
                                    return Err(TreeError::Corruption("seeker went backwards"));
                                }
                            }
                            last = Some(key);
                            if key % 2 == 0 {
                                assert_eq!(value, key);
                                stable_seen += 1;
                            }
                        }
                        assert_eq!(stable_seen, STABLE_KEYS);
                        scans += 1;
                    }
                    Ok(scans)
                })
            })
            .collect();

        for round in 0..6u64 {
            for key in 0..STABLE_KEYS {
                writer.put(&(key * 2 + 1), &round)?;
            }
            tree.checkpoint()?;
            for key in (0..STABLE_KEYS).filter(|key| key % 3 != round % 3) {
                writer.remove(&(key * 2 + 1))?;
            }
        }
        done.store(true, Ordering::Release);
        for reader in readers {
            let scans = reader
                .join()
                .map_err(|_| TreeError::Invalid("reader panicked"))??;
            assert!(scans > 0);
        }
        Ok(())
    })?;
    writer.close()?;

    let report = tree.consistency_check()?;
    assert!(report.is_consistent(), "{:?}", report.errors);
    assert_eq!(tree.latch_snapshot().readers, 0);
    Ok(())
}

#[test]
fn checkpoints_run_beside_the_writer() -> Result<()> {
    let dir = tempdir()?;
    let tree = open_tree(dir.path(), 8 << 20)?;
    let done = AtomicBool::new(false);
    thread::scope(|scope| -> Result<()> {
        let checkpointer = scope.spawn(|| -> Result<u64> {
            let mut count = 0;
            while !done.load(Ordering::Acquire) {
                tree.checkpoint()?;
                count += 1;
                thread::yield_now();
            }
            Ok(count)
        });
        let mut writer = tree.writer()?;
        for key in 0..5_000u64 {
            writer.put(&key, &key)?;
            if key % 4 == 0 {
                writer.remove(&(key / 2))?;
            }
        }
        writer.close()?;
        done.store(true, Ordering::Release);
        checkpointer
            .join()
            .map_err(|_| TreeError::Invalid("checkpointer panicked"))??;
        Ok(())
    })?;
    let report = tree.consistency_check()?;
    assert!(report.is_consistent(), "{:?}", report.errors);
    assert!(tree.stats().checkpoints > 1);
    Ok(())
}

#[test]
fn second_writer_waits_for_the_first() -> Result<()> {
    let dir = tempdir()?;
    let tree = open_tree(dir.path(), 1 << 20)?;
    let first = tree.writer()?;
    let released = AtomicBool::new(false);
    thread::scope(|scope| -> Result<()> {
        let waiter = scope.spawn(|| -> Result<bool> {
            let mut writer = tree.writer()?;
            writer.put(&1, &1)?;
            Ok(released.load(Ordering::Acquire))
        });
        thread::sleep(std::time::Duration::from_millis(50));
        released.store(true, Ordering::Release);
        first.close()?;
        let saw_release = waiter
            .join()
            .map_err(|_| TreeError::Invalid("writer thread panicked"))??;
        assert!(saw_release);
        Ok(())
    })?;
    assert_eq!(tree.get(&1)?, Some(1));
    Ok(())
}
