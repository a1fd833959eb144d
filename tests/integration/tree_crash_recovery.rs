#![allow(missing_docs)]

use std::path::Path;
use std::sync::Arc;

use gbtree::primitives::io::StdFileSystem;
use gbtree::storage::btree::meta;
use gbtree::types::{Result, TreeError};
use gbtree::{GbTree, GbTreeBuilder, LongLayout, PageCache, PageCacheOptions};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

/// Smallest cache the page cache allows, so uncheckpointed pages reach disk
/// through eviction before the simulated crash.
fn tiny_cache() -> Result<PageCache> {
    PageCache::create(
        Arc::new(StdFileSystem),
        PageCacheOptions {
            page_size: 4096,
            cache_bytes: 0,
            verify_checksums: true,
        },
    )
}

fn open(cache: &PageCache, path: &Path) -> Result<GbTree<LongLayout>> {
    GbTreeBuilder::new(cache, path, LongLayout::with_key_padding(100)).build()
}

fn keys(tree: &GbTree<LongLayout>) -> Result<Vec<u64>> {
    tree.scan()?
        .entries()
        .map(|entry| entry.map(|(key, _)| key))
        .collect()
}

#[test]
fn crash_discards_work_after_last_checkpoint() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("crash.gbt");
    let cache = tiny_cache()?;
    {
        let tree = open(&cache, &path)?;
        let mut writer = tree.writer()?;
        for key in 0..1_000u64 {
            writer.put(&key, &key)?;
        }
        writer.close()?;
        tree.checkpoint()?;

        let mut writer = tree.writer()?;
        for key in 1_000..3_000u64 {
            writer.put(&key, &key)?;
        }
        for key in (0..1_000u64).step_by(2) {
            writer.remove(&key)?;
        }
        writer.close()?;
    }

    {
        let file = cache.map(&path, false)?;
        assert!(!meta::read_state(&file)?.was_clean());
    }
    let tree = open(&cache, &path)?;
    assert_eq!(keys(&tree)?, (0..1_000u64).collect::<Vec<_>>());
    assert!(tree.stats().pages_reclaimed > 0);
    let report = tree.consistency_check()?;
    assert!(report.is_consistent(), "{:?}", report.errors);
    tree.close()
}

#[test]
fn crash_during_copy_on_write_keeps_stable_root() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("cow-crash.gbt");
    let cache = tiny_cache()?;
    {
        let tree = open(&cache, &path)?;
        let mut writer = tree.writer()?;
        for key in 0..800u64 {
            writer.put(&key, &1)?;
        }
        tree.checkpoint()?;
        // Every leaf is copied and its stable version gets a successor link.
        for key in 0..800u64 {
            writer.put(&key, &2)?;
        }
        writer.close()?;
    }

    let tree = open(&cache, &path)?;
    let entries: Vec<(u64, u64)> = tree.scan()?.entries().collect::<Result<_>>()?;
    assert_eq!(entries.len(), 800);
    assert!(entries.iter().all(|(_, value)| *value == 1));
    let mut writer = tree.writer()?;
    writer.put(&5, &3)?;
    writer.close()?;
    assert_eq!(tree.get(&5)?, Some(3));
    let report = tree.consistency_check()?;
    assert!(report.is_consistent(), "{:?}", report.errors);
    tree.close()
}

#[test]
fn repeated_crashes_do_not_leak_pages() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("leak.gbt");
    let cache = tiny_cache()?;
    {
        let tree = open(&cache, &path)?;
        let mut writer = tree.writer()?;
        for key in 0..500u64 {
            writer.put(&key, &key)?;
        }
        writer.close()?;
        tree.close()?;
    }

    let mut high_water = Vec::new();
    for _ in 0..5 {
        {
            // Same workload every round, so each crash orphans as many pages.
            let mut rng = ChaCha8Rng::seed_from_u64(0xC0FFEE);
            let tree = open(&cache, &path)?;
            high_water.push(tree.consistency_check()?.high_water);
            let mut writer = tree.writer()?;
            for _ in 0..1_500 {
                let key = rng.gen_range(500..5_000u64);
                writer.put(&key, &key)?;
            }
            writer.close()?;
        }
    }

    let tree = open(&cache, &path)?;
    assert_eq!(keys(&tree)?, (0..500u64).collect::<Vec<_>>());
    let report = tree.consistency_check()?;
    assert!(report.is_consistent(), "{:?}", report.errors);
    // Pages orphaned by one crash are handed out again after the next one.
    let first = high_water[1];
    let last = report.high_water;
    assert!(last <= first + 16, "high water grew from {first} to {last}");
    tree.close()
}

#[test]
fn torn_state_slot_falls_back_to_previous_checkpoint() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("torn.gbt");
    let (newest, slot) = {
        let cache = tiny_cache()?;
        let tree = open(&cache, &path)?;
        let mut writer = tree.writer()?;
        for key in 0..100u64 {
            writer.put(&key, &key)?;
        }
        writer.close()?;
        tree.close()?;
        let file = cache.map(&path, false)?;
        let state = meta::read_state(&file)?;
        (state.sequence, state.slot())
    };

    // Flip a byte of the newest slot behind the page cache's back.
    let mut bytes = std::fs::read(&path)?;
    bytes[slot.0 as usize * 4096 + 40] ^= 0xFF;
    std::fs::write(&path, &bytes)?;

    let cache = tiny_cache()?;
    {
        let file = cache.map(&path, false)?;
        let state = meta::read_state(&file)?;
        assert_eq!(state.sequence, newest - 1);
    }
    // The older slot is the checkpoint taken when the tree was opened.
    let tree = open(&cache, &path)?;
    assert!(keys(&tree)?.is_empty());
    let report = tree.consistency_check()?;
    assert!(report.is_consistent(), "{:?}", report.errors);
    tree.close()
}

#[test]
fn both_state_slots_damaged_reports_header_corrupt() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("headless.gbt");
    {
        let cache = tiny_cache()?;
        let tree = open(&cache, &path)?;
        let mut writer = tree.writer()?;
        writer.put(&1, &1)?;
        writer.close()?;
        tree.close()?;
    }

    let mut bytes = std::fs::read(&path)?;
    for slot in meta::STATE_SLOTS {
        bytes[slot.0 as usize * 4096 + 40] ^= 0xFF;
    }
    std::fs::write(&path, &bytes)?;

    let cache = tiny_cache()?;
    assert!(matches!(open(&cache, &path), Err(TreeError::HeaderCorrupt(_))));
    Ok(())
}
