use std::collections::VecDeque;
use std::ops::Range;

use crate::primitives::pager::PagedFile;
use crate::storage::btree::meta::FIRST_DATA_PAGE;
use crate::types::{
    page::{read_array, PageHeader, PageKind, PAGE_HDR_LEN},
    Generation, PageId, Result, TreeError,
};

const TRUNK_NEXT: Range<usize> = PAGE_HDR_LEN..PAGE_HDR_LEN + 8;
const TRUNK_COUNT: Range<usize> = PAGE_HDR_LEN + 8..PAGE_HDR_LEN + 12;
const TRUNK_IDS_OFFSET: usize = PAGE_HDR_LEN + 16;

/// Number of free page ids a single trunk page stores.
pub fn ids_per_trunk(page_size: usize) -> usize {
    (page_size - TRUNK_IDS_OFFSET) / 8
}

/// Page allocator for one tree file.
///
/// Freed pages wait in `pending` until both the checkpoint that made their
/// release durable has completed and no seeker registered in or before the
/// releasing generation is still open.
#[derive(Debug, Default)]
pub struct FreeList {
    high_water: u64,
    pending: VecDeque<(PageId, Generation)>,
    ready: Vec<PageId>,
    trunks: Vec<PageId>,
}

/// Free pages captured by a checkpoint together with the trunk pages reserved
/// to store them.
#[derive(Debug, Clone)]
pub struct FreeListSnapshot {
    /// Every page that is free as of the checkpointed state.
    pub free: Vec<PageId>,
    /// Trunk pages holding `free`, in chain order.
    pub trunks: Vec<PageId>,
    /// High-water mark including the trunk pages.
    pub high_water: u64,
}

impl FreeList {
    /// Allocator for a file whose first never-used page is `high_water`.
    pub fn new(high_water: u64) -> Self {
        Self {
            high_water: high_water.max(FIRST_DATA_PAGE),
            ..Self::default()
        }
    }

    /// Allocator restored from a durable free set.
    pub fn restore(high_water: u64, free: Vec<PageId>, trunks: Vec<PageId>) -> Self {
        Self {
            high_water: high_water.max(FIRST_DATA_PAGE),
            pending: VecDeque::new(),
            ready: free,
            trunks,
        }
    }

    /// First page id never handed out.
    pub fn high_water(&self) -> u64 {
        self.high_water
    }

    /// Number of free pages, reusable or not.
    pub fn len(&self) -> usize {
        self.ready.len() + self.pending.len()
    }

    /// Returns true when no page is free.
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.pending.is_empty()
    }

    /// Trunk pages of the last durable checkpoint.
    pub fn trunks(&self) -> &[PageId] {
        &self.trunks
    }

    /// Every free page, reusable or not.
    pub fn free_pages(&self) -> impl Iterator<Item = PageId> + '_ {
        self.ready
            .iter()
            .copied()
            .chain(self.pending.iter().map(|(id, _)| *id))
    }

    /// Hands out a page, reusing a released one when it is safe to.
    pub fn allocate(&mut self, stable: Generation, oldest_reader: Option<Generation>) -> PageId {
        self.promote(stable, oldest_reader);
        if let Some(id) = self.ready.pop() {
            return id;
        }
        let id = PageId(self.high_water);
        self.high_water += 1;
        id
    }

    /// Releases `id`, which stopped being reachable in generation `freed_in`.
    pub fn release(&mut self, id: PageId, freed_in: Generation) {
        self.pending.push_back((id, freed_in));
    }

    fn promote(&mut self, stable: Generation, oldest_reader: Option<Generation>) {
        while let Some(&(id, freed_in)) = self.pending.front() {
            let durable = freed_in <= stable;
            let unobserved = oldest_reader.map_or(true, |reader| reader > freed_in);
            if !(durable && unobserved) {
                break;
            }
            self.pending.pop_front();
            self.ready.push(id);
        }
    }

    /// Captures the free set for a checkpoint and reserves trunk pages for it
    /// past the high-water mark.
    ///
    /// The trunks of the previous checkpoint are part of the captured free set:
    /// they stop being referenced once the new state is durable.
    pub fn snapshot(&mut self, page_size: usize) -> FreeListSnapshot {
        let mut free: Vec<PageId> = self.free_pages().chain(self.trunks.iter().copied()).collect();
        free.sort_unstable();
        let per_trunk = ids_per_trunk(page_size);
        let needed = free.len().div_ceil(per_trunk);
        let trunks = (0..needed as u64)
            .map(|offset| PageId(self.high_water + offset))
            .collect();
        self.high_water += needed as u64;
        FreeListSnapshot {
            free,
            trunks,
            high_water: self.high_water,
        }
    }

    /// Installs the trunks of a checkpoint that became durable and makes the
    /// previous trunks reusable.
    pub fn checkpoint_completed(&mut self, trunks: Vec<PageId>) {
        let previous = std::mem::replace(&mut self.trunks, trunks);
        self.ready.extend(previous);
    }
}

/// Writes `snapshot.free` into the trunk chain `snapshot.trunks`.
pub fn write_trunks(file: &PagedFile, salt: u64, snapshot: &FreeListSnapshot) -> Result<()> {
    let page_size = file.page_size();
    let per_trunk = ids_per_trunk(page_size);
    let mut chunks = snapshot.free.chunks(per_trunk);
    for (idx, trunk) in snapshot.trunks.iter().enumerate() {
        let ids = chunks.next().unwrap_or(&[]);
        let next = snapshot.trunks.get(idx + 1).copied().unwrap_or(PageId(0));
        let page = file.pin(*trunk)?;
        let mut buf = page.write();
        buf.fill(0);
        PageHeader::new(*trunk, PageKind::FreeList, page_size as u32, salt)?.encode(&mut buf)?;
        buf[TRUNK_NEXT].copy_from_slice(&next.0.to_be_bytes());
        buf[TRUNK_COUNT].copy_from_slice(&(ids.len() as u32).to_be_bytes());
        for (slot, id) in ids.iter().enumerate() {
            let at = TRUNK_IDS_OFFSET + slot * 8;
            buf[at..at + 8].copy_from_slice(&id.0.to_be_bytes());
        }
    }
    Ok(())
}

/// Reads the trunk chain starting at `head`, returning `(trunks, free ids)`.
pub fn read_trunks(
    file: &PagedFile,
    salt: u64,
    head: PageId,
    len: u64,
    high_water: u64,
) -> Result<(Vec<PageId>, Vec<PageId>)> {
    let page_size = file.page_size();
    let max_trunks = (len as usize).div_ceil(ids_per_trunk(page_size));
    let mut trunks = Vec::with_capacity(max_trunks);
    let mut free = Vec::with_capacity(len as usize);
    let mut next = head;
    while next.0 != 0 {
        if trunks.len() >= max_trunks {
            return Err(TreeError::Corruption("free-list chain longer than recorded"));
        }
        if next.0 < FIRST_DATA_PAGE || next.0 >= high_water {
            return Err(TreeError::Corruption("free-list trunk outside allocated pages"));
        }
        let page = file.pin(next)?;
        let buf = page.read();
        let header = PageHeader::decode(&buf)?;
        if header.kind != PageKind::FreeList || header.salt != salt {
            return Err(TreeError::Corruption("free-list trunk has wrong kind or salt"));
        }
        let count = u32::from_be_bytes(read_array(&buf[TRUNK_COUNT])?) as usize;
        if count > ids_per_trunk(page_size) {
            return Err(TreeError::Corruption("free-list trunk count exceeds capacity"));
        }
        for slot in 0..count {
            let at = TRUNK_IDS_OFFSET + slot * 8;
            let id = u64::from_be_bytes(read_array(&buf[at..at + 8])?);
            if id < FIRST_DATA_PAGE || id >= high_water {
                return Err(TreeError::Corruption("free page id outside allocated pages"));
            }
            free.push(PageId(id));
        }
        trunks.push(next);
        next = PageId(u64::from_be_bytes(read_array(&buf[TRUNK_NEXT])?));
    }
    if free.len() as u64 != len {
        return Err(TreeError::Corruption("free-list length disagrees with state"));
    }
    Ok((trunks, free))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::StdFileSystem;
    use crate::primitives::pager::{PageCache, PageCacheOptions};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn released_pages_wait_for_checkpoint_and_readers() {
        let mut list = FreeList::new(10);
        list.release(PageId(4), Generation(5));
        assert_eq!(list.allocate(Generation(4), None), PageId(10));
        assert_eq!(list.allocate(Generation(5), Some(Generation(5))), PageId(11));
        assert_eq!(list.allocate(Generation(5), Some(Generation(6))), PageId(4));
        assert_eq!(list.allocate(Generation(5), None), PageId(12));
        assert!(list.is_empty());
    }

    #[test]
    fn snapshot_reserves_trunks_and_recycles_previous_ones() {
        let mut list = FreeList::restore(20, vec![PageId(3), PageId(5)], vec![PageId(19)]);
        let snapshot = list.snapshot(4096);
        assert_eq!(snapshot.free, vec![PageId(3), PageId(5), PageId(19)]);
        assert_eq!(snapshot.trunks, vec![PageId(20)]);
        assert_eq!(snapshot.high_water, 21);
        list.checkpoint_completed(snapshot.trunks.clone());
        assert_eq!(list.trunks(), &[PageId(20)]);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn trunk_chain_roundtrip() -> Result<()> {
        let dir = tempdir().unwrap();
        let cache = PageCache::create(Arc::new(StdFileSystem), PageCacheOptions::default())?;
        let file = cache.map(dir.path().join("free.db"), true)?;
        let per_trunk = ids_per_trunk(file.page_size()) as u64;
        let free: Vec<PageId> = (2..2 + per_trunk + 7).map(PageId).collect();
        let mut list = FreeList::restore(2 + per_trunk + 7, free.clone(), Vec::new());
        let snapshot = list.snapshot(file.page_size());
        assert_eq!(snapshot.trunks.len(), 2);
        write_trunks(&file, 42, &snapshot)?;
        let (trunks, read) = read_trunks(
            &file,
            42,
            snapshot.trunks[0],
            free.len() as u64,
            snapshot.high_water,
        )?;
        assert_eq!(trunks, snapshot.trunks);
        assert_eq!(read, free);
        let wrong_salt = read_trunks(
            &file,
            43,
            snapshot.trunks[0],
            free.len() as u64,
            snapshot.high_water,
        );
        assert!(wrong_salt.is_err());
        Ok(())
    }
}
