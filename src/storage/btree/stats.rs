use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::Serialize;

/// Snapshot of tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TreeStatsSnapshot {
    /// Number of leaf splits performed
    pub leaf_splits: u64,
    /// Number of internal node splits performed
    pub internal_splits: u64,
    /// Number of sibling merges performed
    pub merges: u64,
    /// Number of sibling redistributions performed
    pub borrows: u64,
    /// Number of root splits (height increases)
    pub root_splits: u64,
    /// Number of root collapses (height decreases)
    pub root_collapses: u64,
    /// Number of pages edited in place
    pub in_place_edits: u64,
    /// Number of pages copied to a new version
    pub copy_on_write: u64,
    /// Number of seeker re-descents from the root
    pub seeker_restarts: u64,
    /// Number of successor links followed by seekers
    pub successor_follows: u64,
    /// Number of completed checkpoints
    pub checkpoints: u64,
    /// Number of orphaned pages reclaimed by recovery
    pub pages_reclaimed: u64,
}

/// Thread-safe statistics tracking for tree operations.
#[derive(Default)]
pub struct TreeStats {
    leaf_splits: AtomicU64,
    internal_splits: AtomicU64,
    merges: AtomicU64,
    borrows: AtomicU64,
    root_splits: AtomicU64,
    root_collapses: AtomicU64,
    in_place_edits: AtomicU64,
    copy_on_write: AtomicU64,
    seeker_restarts: AtomicU64,
    successor_follows: AtomicU64,
    checkpoints: AtomicU64,
    pages_reclaimed: AtomicU64,
}

impl TreeStats {
    /// Returns the current count of leaf splits.
    pub fn leaf_splits(&self) -> u64 {
        self.leaf_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of internal node splits.
    pub fn internal_splits(&self) -> u64 {
        self.internal_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of sibling merges.
    pub fn merges(&self) -> u64 {
        self.merges.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of sibling redistributions.
    pub fn borrows(&self) -> u64 {
        self.borrows.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of pages copied to a new version.
    pub fn copy_on_write(&self) -> u64 {
        self.copy_on_write.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of seeker restarts from the root.
    pub fn seeker_restarts(&self) -> u64 {
        self.seeker_restarts.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn inc_leaf_splits(&self) {
        self.leaf_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_internal_splits(&self) {
        self.internal_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_merges(&self) {
        self.merges.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_borrows(&self) {
        self.borrows.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_splits(&self) {
        self.root_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_collapses(&self) {
        self.root_collapses.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_in_place_edits(&self) {
        self.in_place_edits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_copy_on_write(&self) {
        self.copy_on_write.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_seeker_restarts(&self) {
        self.seeker_restarts.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_successor_follows(&self) {
        self.successor_follows.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_checkpoints(&self) {
        self.checkpoints.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn add_pages_reclaimed(&self, pages: u64) {
        self.pages_reclaimed.fetch_add(pages, AtomicOrdering::Relaxed);
    }

    /// Creates a snapshot of all current statistics.
    pub fn snapshot(&self) -> TreeStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(AtomicOrdering::Relaxed);
        TreeStatsSnapshot {
            leaf_splits: load(&self.leaf_splits),
            internal_splits: load(&self.internal_splits),
            merges: load(&self.merges),
            borrows: load(&self.borrows),
            root_splits: load(&self.root_splits),
            root_collapses: load(&self.root_collapses),
            in_place_edits: load(&self.in_place_edits),
            copy_on_write: load(&self.copy_on_write),
            seeker_restarts: load(&self.seeker_restarts),
            successor_follows: load(&self.successor_follows),
            checkpoints: load(&self.checkpoints),
            pages_reclaimed: load(&self.pages_reclaimed),
        }
    }

    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "gbtree::stats",
            leaf_splits = snapshot.leaf_splits,
            internal_splits = snapshot.internal_splits,
            merges = snapshot.merges,
            borrows = snapshot.borrows,
            root_splits = snapshot.root_splits,
            root_collapses = snapshot.root_collapses,
            in_place_edits = snapshot.in_place_edits,
            copy_on_write = snapshot.copy_on_write,
            seeker_restarts = snapshot.seeker_restarts,
            successor_follows = snapshot.successor_follows,
            checkpoints = snapshot.checkpoints,
            pages_reclaimed = snapshot.pages_reclaimed,
            "tree stats snapshot"
        );
    }
}
