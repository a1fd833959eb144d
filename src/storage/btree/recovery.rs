use std::collections::{HashSet, VecDeque};

use super::freelist::{self, FreeList};
use super::meta::{TreeState, FIRST_DATA_PAGE};
use super::page::{self, Geometry, NodeKind, NodeView};
use crate::primitives::pager::PagedFile;
use crate::types::{PageId, Result, TreeError};

/// Result of rebuilding the allocator after an unclean shutdown.
#[derive(Debug)]
pub struct RecoveryOutcome {
    /// Allocator holding every page not reachable from the stable root.
    pub freelist: FreeList,
    /// Pages found free that the durable free list did not record.
    pub reclaimed: u64,
    /// Successor links removed from pages reachable from the stable root.
    pub cleared_successors: u64,
}

/// Rebuilds the free set of a tree that was not closed cleanly.
///
/// The stable root and everything below it are exactly as the last
/// checkpoint wrote them, apart from successor links added after it. Those
/// links are cleared; every other page below the high-water mark that is
/// neither reachable nor a free-list trunk is free.
pub fn recover(
    file: &PagedFile,
    geometry: &Geometry,
    state: &TreeState,
) -> Result<RecoveryOutcome> {
    let pages_on_disk = file.pages_on_disk()?;
    let high_water = state.high_water.max(pages_on_disk);
    let mut reachable = HashSet::from([state.root]);
    let mut queue = VecDeque::from([state.root]);
    let mut cleared_successors = 0u64;
    while let Some(id) = queue.pop_front() {
        let page = file.pin(id)?;
        let (children, superseded) = {
            let buf = page.read();
            let view = NodeView::parse(&buf, *geometry)?;
            if view.generation() > state.stable_generation {
                return Err(TreeError::Corruption(
                    "page reachable from stable root is newer than the checkpoint",
                ));
            }
            if id == state.root && view.generation() != state.root_generation {
                return Err(TreeError::Corruption("root generation disagrees with state"));
            }
            let children = match view.kind() {
                NodeKind::Leaf => Vec::new(),
                NodeKind::Internal => (0..=view.len())
                    .map(|idx| view.child(idx))
                    .collect::<Result<Vec<_>>>()?,
            };
            (children, view.state().successor().is_some())
        };
        if superseded {
            page::clear_successor(&mut page.write());
            cleared_successors += 1;
        }
        for child in children {
            if child.0 >= high_water {
                return Err(TreeError::Corruption("child reference past the end of the file"));
            }
            if !reachable.insert(child) {
                return Err(TreeError::Corruption("page referenced twice"));
            }
            queue.push_back(child);
        }
    }

    let (trunks, durable_free) = match freelist::read_trunks(
        file,
        state.salt,
        state.freelist_head,
        state.freelist_len,
        state.high_water,
    ) {
        Ok(chain) => chain,
        Err(err) => {
            tracing::warn!(
                target: "gbtree::recovery",
                error = %err,
                "free-list chain unreadable, rebuilding from reachability"
            );
            (Vec::new(), Vec::new())
        }
    };
    let trunk_set: HashSet<PageId> = trunks.iter().copied().collect();
    let durable_free: HashSet<PageId> = durable_free.into_iter().collect();

    let free: Vec<PageId> = (FIRST_DATA_PAGE..high_water)
        .map(PageId)
        .filter(|id| !reachable.contains(id) && !trunk_set.contains(id))
        .collect();
    let reclaimed = free.iter().filter(|id| !durable_free.contains(id)).count() as u64;

    if reclaimed > 0 || cleared_successors > 0 {
        tracing::warn!(
            target: "gbtree::recovery",
            reclaimed,
            cleared_successors,
            "recovered tree after unclean shutdown"
        );
    }
    tracing::info!(
        target: "gbtree::recovery",
        stable = state.stable_generation.0,
        reachable = reachable.len(),
        free = free.len(),
        high_water,
        "recovery finished"
    );
    Ok(RecoveryOutcome {
        freelist: FreeList::restore(high_water, free, trunks),
        reclaimed,
        cleared_successors,
    })
}
