#![forbid(unsafe_code)]

//! Token scan store: which entities carry which token.
//!
//! Entities are grouped into ranges of [`RANGE_SIZE`] ids. Each `(token, range)`
//! key maps to a bitmap with one bit per entity of the range, so a scan over
//! one token reads its ranges in entity order.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::storage::btree::{GbTree, Writer};
use crate::storage::layout::Layout;
use crate::types::{page::read_array, Result, TreeError};

/// Entities covered by one bitmap value.
pub const RANGE_SIZE: u64 = 64;

const TOKEN_SCAN_LAYOUT_ID: u64 = u64::from_be_bytes(*b"gbtTOKEN");

/// Key of a token scan tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TokenScanKey {
    /// Token id.
    pub token: u32,
    /// Entity id divided by [`RANGE_SIZE`].
    pub range: u64,
}

/// Layout of token scan trees: `(token, range) -> entity bitmap`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokenScanLayout;

impl Layout for TokenScanLayout {
    type Key = TokenScanKey;
    type Value = u64;

    fn identifier(&self) -> u64 {
        TOKEN_SCAN_LAYOUT_ID
    }

    fn major_version(&self) -> u32 {
        1
    }

    fn minor_version(&self) -> u32 {
        0
    }

    fn key_size(&self) -> usize {
        12
    }

    fn value_size(&self) -> usize {
        8
    }

    fn compare(&self, a: &TokenScanKey, b: &TokenScanKey) -> Ordering {
        a.cmp(b)
    }

    fn write_key(&self, key: &TokenScanKey, dst: &mut [u8]) -> Result<()> {
        if dst.len() != 12 {
            return Err(TreeError::Invalid("key buffer has wrong size"));
        }
        dst[..4].copy_from_slice(&key.token.to_be_bytes());
        dst[4..].copy_from_slice(&key.range.to_be_bytes());
        Ok(())
    }

    fn read_key(&self, src: &[u8]) -> Result<TokenScanKey> {
        if src.len() != 12 {
            return Err(TreeError::Corruption("token scan key has wrong size"));
        }
        Ok(TokenScanKey {
            token: u32::from_be_bytes(read_array(&src[..4])?),
            range: u64::from_be_bytes(read_array(&src[4..])?),
        })
    }

    fn write_value(&self, value: &u64, dst: &mut [u8]) -> Result<()> {
        if dst.len() != 8 {
            return Err(TreeError::Invalid("value buffer has wrong size"));
        }
        dst.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    fn read_value(&self, src: &[u8]) -> Result<u64> {
        Ok(u64::from_be_bytes(read_array(src)?))
    }

    fn compare_encoded(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Token change of a single entity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityTokenUpdate {
    /// Entity id.
    pub entity_id: u64,
    /// Tokens before the change.
    pub tokens_before: Vec<u32>,
    /// Tokens after the change.
    pub tokens_after: Vec<u32>,
}

impl EntityTokenUpdate {
    /// Update moving an entity from `tokens_before` to `tokens_after`.
    pub fn new(entity_id: u64, mut tokens_before: Vec<u32>, mut tokens_after: Vec<u32>) -> Self {
        for tokens in [&mut tokens_before, &mut tokens_after] {
            tokens.sort_unstable();
            tokens.dedup();
        }
        Self {
            entity_id,
            tokens_before,
            tokens_after,
        }
    }

    fn added(&self) -> impl Iterator<Item = u32> + '_ {
        self.tokens_after
            .iter()
            .copied()
            .filter(|token| self.tokens_before.binary_search(token).is_err())
    }

    fn removed(&self) -> impl Iterator<Item = u32> + '_ {
        self.tokens_before
            .iter()
            .copied()
            .filter(|token| self.tokens_after.binary_search(token).is_err())
    }
}

/// Sink for entity token updates.
///
/// Updates must arrive in ascending entity id order; pending changes are only
/// guaranteed to be stored once [`TokenScanWriter::close`] returns.
pub trait TokenScanWriter {
    /// Stores one update.
    fn write(&mut self, update: EntityTokenUpdate) -> Result<()>;

    /// Flushes pending changes and releases the writer.
    fn close(&mut self) -> Result<()>;
}

/// Writer that discards every update.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyTokenScanWriter;

/// Shared no-op writer.
pub const EMPTY_WRITER: EmptyTokenScanWriter = EmptyTokenScanWriter;

impl TokenScanWriter for EmptyTokenScanWriter {
    fn write(&mut self, _update: EntityTokenUpdate) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Default)]
struct BitChange {
    set: u64,
    clear: u64,
}

/// [`TokenScanWriter`] applying updates to a token scan tree.
///
/// Changes are buffered per entity range and merged into the stored bitmaps
/// when the updates move past the range.
pub struct TreeTokenScanWriter {
    writer: Writer<TokenScanLayout>,
    range: Option<u64>,
    last_entity: Option<u64>,
    pending: BTreeMap<u32, BitChange>,
}

impl TreeTokenScanWriter {
    /// Wraps the writer of a token scan tree.
    pub fn new(writer: Writer<TokenScanLayout>) -> Self {
        Self {
            writer,
            range: None,
            last_entity: None,
            pending: BTreeMap::new(),
        }
    }

    fn flush(&mut self) -> Result<()> {
        let Some(range) = self.range else {
            return Ok(());
        };
        for (token, change) in std::mem::take(&mut self.pending) {
            let key = TokenScanKey { token, range };
            let stored = self.writer.get(&key)?.unwrap_or(0);
            let bits = (stored | change.set) & !change.clear;
            if bits == stored {
                continue;
            }
            if bits == 0 {
                self.writer.remove(&key)?;
            } else {
                self.writer.put(&key, &bits)?;
            }
        }
        Ok(())
    }
}

impl TokenScanWriter for TreeTokenScanWriter {
    fn write(&mut self, update: EntityTokenUpdate) -> Result<()> {
        if self.last_entity.is_some_and(|last| update.entity_id < last) {
            return Err(TreeError::Invalid("token updates must be ordered by ascending entity id"));
        }
        self.last_entity = Some(update.entity_id);
        let range = update.entity_id / RANGE_SIZE;
        if self.range != Some(range) {
            self.flush()?;
            self.range = Some(range);
        }
        let bit = 1u64 << (update.entity_id % RANGE_SIZE);
        for token in update.added() {
            let change = self.pending.entry(token).or_default();
            change.set |= bit;
            change.clear &= !bit;
        }
        for token in update.removed() {
            let change = self.pending.entry(token).or_default();
            change.clear |= bit;
            change.set &= !bit;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.range = None;
        Ok(())
    }
}

/// Ids of every entity carrying `token`, ascending.
pub fn entities_with_token(tree: &GbTree<TokenScanLayout>, token: u32) -> Result<Vec<u64>> {
    let from = TokenScanKey { token, range: 0 };
    let to = TokenScanKey {
        token,
        range: u64::MAX,
    };
    let mut entities = Vec::new();
    for entry in tree.seek(&from, &to)?.entries() {
        let (key, mut bits) = entry?;
        while bits != 0 {
            let offset = u64::from(bits.trailing_zeros());
            entities.push(key.range * RANGE_SIZE + offset);
            bits &= bits - 1;
        }
    }
    Ok(entities)
}
