#![allow(missing_docs)]

use std::path::Path;
use std::sync::Arc;

use gbtree::primitives::io::StdFileSystem;
use gbtree::types::Result;
use gbtree::{GbTree, GbTreeBuilder, LongLayout, PageCache, PageCacheOptions};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

const PAGE_SIZES: [u32; 4] = [8 * 1024, 64 * 1024, 1024 * 1024, 4 * 1024 * 1024];

fn cache(page_size: u32) -> Result<PageCache> {
    PageCache::create(
        Arc::new(StdFileSystem),
        PageCacheOptions {
            page_size,
            cache_bytes: 64 * 1024 * 1024,
            verify_checksums: true,
        },
    )
}

/// Pads keys so that every page size holds roughly 40 entries per node.
fn layout_for(page_size: u32) -> LongLayout {
    LongLayout::with_key_padding(page_size as usize / 48)
}

fn open(cache: &PageCache, path: &Path, page_size: u32) -> Result<GbTree<LongLayout>> {
    GbTreeBuilder::new(cache, path, layout_for(page_size)).build()
}

fn scan_keys(tree: &GbTree<LongLayout>) -> Result<Vec<u64>> {
    tree.scan()?
        .entries()
        .map(|entry| entry.map(|(key, _)| key))
        .collect()
}

#[test]
fn full_scan_is_ordered_across_page_sizes() -> Result<()> {
    for page_size in PAGE_SIZES {
        let dir = tempdir()?;
        let cache = cache(page_size)?;
        let tree = open(&cache, &dir.path().join("order.gbt"), page_size)?;
        let mut rng = ChaCha8Rng::seed_from_u64(u64::from(page_size));
        let mut keys: Vec<u64> = (0..1_000u64).map(|k| k * 7 + 3).collect();
        keys.shuffle(&mut rng);

        let mut writer = tree.writer()?;
        for key in &keys {
            writer.put(key, key)?;
        }
        writer.close()?;

        let scanned = scan_keys(&tree)?;
        keys.sort_unstable();
        assert_eq!(scanned, keys, "page size {page_size}");
        assert!(tree.height()? > 1, "page size {page_size} never split");
        let report = tree.consistency_check()?;
        assert!(report.is_consistent(), "page size {page_size}: {:?}", report.errors);
        tree.close()?;
    }
    Ok(())
}

#[test]
fn exact_seek_returns_single_entry() -> Result<()> {
    for page_size in PAGE_SIZES {
        let dir = tempdir()?;
        let cache = cache(page_size)?;
        let tree = open(&cache, &dir.path().join("exact.gbt"), page_size)?;
        let mut writer = tree.writer()?;
        for key in 0..300u64 {
            writer.put(&(key * 2), &key)?;
        }
        writer.close()?;

        for key in [0u64, 2, 298, 598] {
            let mut seeker = tree.seek(&key, &key)?;
            assert!(seeker.next()?);
            assert_eq!(seeker.key(), Some(&key));
            assert_eq!(seeker.value(), Some(&(key / 2)));
            assert!(!seeker.next()?);
        }
        assert!(!tree.seek(&3, &3)?.next()?);
        tree.close()?;
    }
    Ok(())
}

#[test]
fn random_unique_keys_survive_splits() -> Result<()> {
    for page_size in PAGE_SIZES {
        let dir = tempdir()?;
        let cache = cache(page_size)?;
        let tree = open(&cache, &dir.path().join("split.gbt"), page_size)?;
        let mut rng = ChaCha8Rng::seed_from_u64(0xB7EE);
        let mut keys = Vec::with_capacity(1_000);
        let mut writer = tree.writer()?;
        while keys.len() < 1_000 {
            let key = rand::Rng::gen_range(&mut rng, 0..u64::MAX / 2);
            if writer.get(&key)?.is_none() {
                writer.put(&key, &!key)?;
                keys.push(key);
            }
        }
        writer.close()?;

        keys.sort_unstable();
        let entries: Vec<(u64, u64)> = tree.scan()?.entries().collect::<Result<_>>()?;
        assert_eq!(entries.len(), keys.len());
        for ((key, value), expected) in entries.iter().zip(&keys) {
            assert_eq!(key, expected);
            assert_eq!(*value, !key);
        }
        assert!(tree.stats().leaf_splits > 0);
        tree.close()?;
    }
    Ok(())
}

#[test]
fn overwrite_keeps_latest_value() -> Result<()> {
    for page_size in PAGE_SIZES {
        let dir = tempdir()?;
        let cache = cache(page_size)?;
        let tree = open(&cache, &dir.path().join("overwrite.gbt"), page_size)?;
        let mut writer = tree.writer()?;
        for key in 0..200u64 {
            writer.put(&key, &1)?;
        }
        tree.checkpoint()?;
        for key in 0..200u64 {
            writer.put(&key, &2)?;
        }
        writer.close()?;

        let entries: Vec<(u64, u64)> = tree.scan()?.entries().collect::<Result<_>>()?;
        assert_eq!(entries.len(), 200);
        assert!(entries.iter().all(|(_, value)| *value == 2));
        tree.close()?;
    }
    Ok(())
}

#[test]
fn empty_tree_roundtrips_through_close() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("empty.gbt");
    let cache = cache(8 * 1024)?;
    open(&cache, &path, 8 * 1024)?.close()?;
    let tree = open(&cache, &path, 8 * 1024)?;
    assert!(scan_keys(&tree)?.is_empty());
    assert_eq!(tree.stats().pages_reclaimed, 0);
    tree.close()?;
    cache.close()
}

#[test]
fn reopen_after_close_keeps_everything() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("reopen.gbt");
    let cache = cache(8 * 1024)?;
    {
        let tree = open(&cache, &path, 8 * 1024)?;
        let mut writer = tree.writer()?;
        for key in 0..2_000u64 {
            writer.put(&key, &(key ^ 0xFF))?;
        }
        for key in (0..2_000u64).step_by(3) {
            writer.remove(&key)?;
        }
        writer.close()?;
        tree.close()?;
    }
    let tree = open(&cache, &path, 8 * 1024)?;
    let expected: Vec<u64> = (0..2_000u64).filter(|key| key % 3 != 0).collect();
    assert_eq!(scan_keys(&tree)?, expected);
    assert_eq!(tree.get(&1_999)?, Some(1_999 ^ 0xFF));
    let report = tree.consistency_check()?;
    assert!(report.is_consistent(), "{:?}", report.errors);
    tree.close()
}
