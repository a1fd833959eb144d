#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use gbtree::primitives::io::StdFileSystem;
use gbtree::storage::token_scan::{
    entities_with_token, EntityTokenUpdate, TokenScanLayout, TokenScanWriter, TreeTokenScanWriter,
};
use gbtree::types::{Result, TreeError};
use gbtree::{GbTree, GbTreeBuilder, PageCache, PageCacheOptions};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

fn open(cache: &PageCache, path: &Path) -> Result<GbTree<TokenScanLayout>> {
    GbTreeBuilder::new(cache, path, TokenScanLayout).build()
}

fn cache() -> Result<PageCache> {
    PageCache::create(Arc::new(StdFileSystem), PageCacheOptions::default())
}

#[test]
fn updates_are_readable_per_token() -> Result<()> {
    let dir = tempdir()?;
    let cache = cache()?;
    let tree = open(&cache, &dir.path().join("tokens.gbt"))?;
    let mut writer = TreeTokenScanWriter::new(tree.writer()?);
    writer.write(EntityTokenUpdate::new(1, vec![], vec![7]))?;
    writer.write(EntityTokenUpdate::new(2, vec![], vec![7, 9]))?;
    writer.write(EntityTokenUpdate::new(70, vec![], vec![9]))?;
    writer.write(EntityTokenUpdate::new(500, vec![], vec![7]))?;
    writer.close()?;
    drop(writer);

    assert_eq!(entities_with_token(&tree, 7)?, vec![1, 2, 500]);
    assert_eq!(entities_with_token(&tree, 9)?, vec![2, 70]);
    assert!(entities_with_token(&tree, 8)?.is_empty());
    tree.close()
}

#[test]
fn removing_last_token_of_a_range_deletes_its_entry() -> Result<()> {
    let dir = tempdir()?;
    let cache = cache()?;
    let tree = open(&cache, &dir.path().join("remove.gbt"))?;
    {
        let mut writer = TreeTokenScanWriter::new(tree.writer()?);
        writer.write(EntityTokenUpdate::new(3, vec![], vec![1]))?;
        writer.write(EntityTokenUpdate::new(4, vec![], vec![1]))?;
        writer.close()?;
    }
    {
        let mut writer = TreeTokenScanWriter::new(tree.writer()?);
        writer.write(EntityTokenUpdate::new(3, vec![1], vec![]))?;
        writer.write(EntityTokenUpdate::new(4, vec![1], vec![2]))?;
        writer.close()?;
    }
    assert!(entities_with_token(&tree, 1)?.is_empty());
    assert_eq!(entities_with_token(&tree, 2)?, vec![4]);
    assert_eq!(tree.scan()?.entries().count(), 1);
    tree.close()
}

#[test]
fn out_of_order_updates_are_rejected() -> Result<()> {
    let dir = tempdir()?;
    let cache = cache()?;
    let tree = open(&cache, &dir.path().join("order.gbt"))?;
    let mut writer = TreeTokenScanWriter::new(tree.writer()?);
    writer.write(EntityTokenUpdate::new(10, vec![], vec![1]))?;
    let err = writer.write(EntityTokenUpdate::new(9, vec![], vec![1]));
    assert!(matches!(err, Err(TreeError::Invalid(_))));
    writer.close()?;
    assert_eq!(entities_with_token(&tree, 1)?, vec![10]);
    Ok(())
}

#[test]
fn random_updates_match_model_after_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("model.gbt");
    let cache = cache()?;
    let mut model: BTreeMap<u64, BTreeSet<u32>> = BTreeMap::new();
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    for _pass in 0..3 {
        let tree = open(&cache, &path)?;
        let mut writer = TreeTokenScanWriter::new(tree.writer()?);
        let mut entity = 0u64;
        while entity < 5_000 {
            entity += rng.gen_range(1..20);
            let before: Vec<u32> = model
                .get(&entity)
                .map(|t| t.iter().copied().collect())
                .unwrap_or_default();
            let after: BTreeSet<u32> =
                (0..rng.gen_range(0..4)).map(|_| rng.gen_range(0..6)).collect();
            writer.write(EntityTokenUpdate::new(
                entity,
                before,
                after.iter().copied().collect(),
            ))?;
            if after.is_empty() {
                model.remove(&entity);
            } else {
                model.insert(entity, after);
            }
        }
        writer.close()?;
        drop(writer);
        tree.close()?;
    }

    let tree = open(&cache, &path)?;
    for token in 0..6u32 {
        let expected: Vec<u64> = model
            .iter()
            .filter(|(_, tokens)| tokens.contains(&token))
            .map(|(entity, _)| *entity)
            .collect();
        assert_eq!(entities_with_token(&tree, token)?, expected, "token {token}");
    }
    tree.close()
}
