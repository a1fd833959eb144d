use std::sync::atomic::{AtomicU64, Ordering};

use super::freelist;
use super::meta;
use super::tree::TreeShared;
use crate::storage::layout::Layout;
use crate::types::{Generation, PageId, Result};

/// Stable and unstable generation counters of one tree.
///
/// Pages stamped with the unstable generation were written after the last
/// checkpoint and may be edited in place. Pages with an older stamp are
/// reachable from a durable root and are only ever replaced.
#[derive(Debug)]
pub struct GenerationClock {
    stable: AtomicU64,
    unstable: AtomicU64,
}

impl GenerationClock {
    /// Clock resuming after the checkpoint of `stable`.
    pub fn new(stable: Generation) -> Self {
        Self {
            stable: AtomicU64::new(stable.0),
            unstable: AtomicU64::new(stable.0 + 1),
        }
    }

    /// Last checkpointed generation.
    pub fn stable(&self) -> Generation {
        Generation(self.stable.load(Ordering::Acquire))
    }

    /// Generation stamped on pages written now.
    pub fn unstable(&self) -> Generation {
        Generation(self.unstable.load(Ordering::Acquire))
    }

    /// Closes the current unstable generation and returns it. Writes issued
    /// afterwards carry the next generation.
    pub(crate) fn begin_checkpoint(&self) -> Generation {
        Generation(self.unstable.fetch_add(1, Ordering::AcqRel))
    }

    pub(crate) fn complete_checkpoint(&self, generation: Generation) {
        self.stable.store(generation.0, Ordering::Release);
    }
}

impl<L: Layout> TreeShared<L> {
    /// Runs a checkpoint.
    ///
    /// Only the capture of root, generation and free set excludes the writer;
    /// page write-back and the state slot update run concurrently with it.
    pub(crate) fn checkpoint(&self, clean: bool) -> Result<Generation> {
        let _serial = self.checkpoint_lock.lock();
        let (root, generation, snapshot) = {
            let _op = self.op_latch.lock();
            let root = self.root();
            let generation = self.clock.begin_checkpoint();
            let snapshot = self.freelist.lock().snapshot(self.geometry.page_size);
            (root, generation, snapshot)
        };
        tracing::debug!(
            target: "gbtree::checkpoint",
            generation = generation.0,
            root = root.id.0,
            free = snapshot.free.len(),
            "checkpoint started"
        );

        let mut state = self.durable.lock().clone();
        state.sequence += 1;
        state.stable_generation = generation;
        state.clean_generation = if clean { generation } else { Generation(0) };
        state.root = root.id;
        state.root_generation = root.generation;
        state.high_water = snapshot.high_water;
        state.freelist_head = snapshot.trunks.first().copied().unwrap_or(PageId(0));
        state.freelist_len = snapshot.free.len() as u64;

        freelist::write_trunks(&self.file, self.geometry.salt, &snapshot)?;
        self.file.flush()?;
        meta::write_state(&self.file, &state)?;

        self.clock.complete_checkpoint(generation);
        self.freelist.lock().checkpoint_completed(snapshot.trunks);
        *self.durable.lock() = state;
        self.stats.inc_checkpoints();
        tracing::debug!(
            target: "gbtree::checkpoint",
            generation = generation.0,
            clean,
            "checkpoint completed"
        );
        Ok(generation)
    }
}
