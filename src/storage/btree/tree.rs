use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::freelist::{self, FreeList};
use super::generation::GenerationClock;
use super::meta::{self, LayoutIdentity, TreeState, FIRST_DATA_PAGE};
use super::page::{Geometry, Node, NodeKind, NodeView};
use super::recovery;
use super::seeker::Seeker;
use super::stats::{TreeStats, TreeStatsSnapshot};
use super::verify::{self, ConsistencyReport};
use super::writer::Writer;
use crate::primitives::concurrency::{LatchSnapshot, TreeLatch};
use crate::primitives::pager::{PageCache, PagedFile};
use crate::storage::layout::Layout;
use crate::types::{Generation, PageId, Result, TreeError};

/// Deepest tree a descent accepts before reporting corruption.
pub const MAX_TREE_HEIGHT: usize = 64;

/// Configuration options for a tree.
#[derive(Clone, Debug)]
pub struct TreeOptions {
    /// Fill percentage (0-100) below which a non-root node is rebalanced.
    pub min_fill_percent: u8,
    /// Root re-descents a seeker may perform within a single step.
    pub max_restarts: usize,
    /// Successor links a seeker may follow from one page.
    pub max_successor_chain: usize,
    /// Create the file when it does not exist.
    pub create_if_missing: bool,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            min_fill_percent: 40,
            max_restarts: 100_000,
            max_successor_chain: 64,
            create_if_missing: true,
        }
    }
}

impl TreeOptions {
    fn validate(&self) -> Result<()> {
        if self.min_fill_percent > 50 {
            return Err(TreeError::Invalid("min_fill_percent must be at most 50"));
        }
        if self.max_restarts == 0 || self.max_successor_chain == 0 {
            return Err(TreeError::Invalid("seeker bounds must be non-zero"));
        }
        Ok(())
    }
}

/// Root page reference shared by the writer and seekers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RootRef {
    /// Root page.
    pub id: PageId,
    /// Generation of the root page.
    pub generation: Generation,
}

/// State shared between a tree handle, its writer and its seekers.
pub(crate) struct TreeShared<L: Layout> {
    pub(crate) layout: L,
    pub(crate) file: PagedFile,
    pub(crate) geometry: Geometry,
    pub(crate) options: TreeOptions,
    pub(crate) latch: TreeLatch,
    /// Held for the duration of each writer operation and by checkpoints
    /// while they capture the tree state.
    pub(crate) op_latch: Mutex<()>,
    pub(crate) checkpoint_lock: Mutex<()>,
    pub(crate) clock: GenerationClock,
    pub(crate) root: RwLock<RootRef>,
    pub(crate) freelist: Mutex<FreeList>,
    pub(crate) durable: Mutex<TreeState>,
    pub(crate) stats: TreeStats,
}

impl<L: Layout> TreeShared<L> {
    pub(crate) fn root(&self) -> RootRef {
        *self.root.read()
    }

    pub(crate) fn encode_key(&self, key: &L::Key) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.geometry.key_size];
        self.layout.write_key(key, &mut buf)?;
        Ok(buf)
    }

    pub(crate) fn encode_value(&self, value: &L::Value) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.geometry.value_size];
        self.layout.write_value(value, &mut buf)?;
        Ok(buf)
    }
}

/// Builder that opens or creates a tree file through a page cache.
pub struct GbTreeBuilder<L: Layout> {
    cache: PageCache,
    path: PathBuf,
    layout: L,
    options: TreeOptions,
}

impl<L: Layout> GbTreeBuilder<L> {
    /// Builder for the tree stored at `path`.
    pub fn new(cache: &PageCache, path: impl AsRef<Path>, layout: L) -> Self {
        Self {
            cache: cache.clone(),
            path: path.as_ref().to_path_buf(),
            layout,
            options: TreeOptions::default(),
        }
    }

    /// Replaces the tree options.
    pub fn with_options(mut self, options: TreeOptions) -> Self {
        self.options = options;
        self
    }

    /// Opens the tree, creating it when missing and recovering it after an
    /// unclean shutdown.
    pub fn build(self) -> Result<GbTree<L>> {
        self.options.validate()?;
        let identity = LayoutIdentity::of(&self.layout);
        let page_size = self.cache.page_size();
        Geometry::for_layout(&self.layout, page_size, 0)?;
        let file = self.cache.map(&self.path, self.options.create_if_missing)?;
        let state = if file.pages_on_disk()? == 0 {
            if !self.options.create_if_missing {
                return Err(TreeError::NotFound);
            }
            create_empty(&file, identity, page_size)?
        } else {
            meta::read_state(&file)?
        };
        identity.check(&state.layout)?;
        if state.page_size != page_size {
            return Err(TreeError::Invalid("page cache page size differs from the tree file"));
        }
        let geometry = Geometry::for_layout(&self.layout, page_size, state.salt)?;
        let stats = TreeStats::default();

        let freelist = if state.was_clean() {
            let (trunks, free) = freelist::read_trunks(
                &file,
                state.salt,
                state.freelist_head,
                state.freelist_len,
                state.high_water,
            )?;
            FreeList::restore(state.high_water, free, trunks)
        } else {
            let outcome = recovery::recover(&file, &geometry, &state)?;
            stats.add_pages_reclaimed(outcome.reclaimed);
            outcome.freelist
        };

        let root = RootRef {
            id: state.root,
            generation: state.root_generation,
        };
        let shared = Arc::new(TreeShared {
            clock: GenerationClock::new(state.stable_generation),
            layout: self.layout,
            file,
            geometry,
            options: self.options,
            latch: TreeLatch::new(),
            op_latch: Mutex::new(()),
            checkpoint_lock: Mutex::new(()),
            root: RwLock::new(root),
            freelist: Mutex::new(freelist),
            durable: Mutex::new(state),
            stats,
        });
        // Records the open marker and makes any recovery result durable.
        shared.checkpoint(false)?;
        tracing::debug!(
            target: "gbtree::tree",
            path = %self.path.display(),
            root = shared.root().id.0,
            stable = shared.clock.stable().0,
            "tree opened"
        );
        Ok(GbTree { shared })
    }
}

fn create_empty(file: &PagedFile, identity: LayoutIdentity, page_size: u32) -> Result<TreeState> {
    let root = PageId(FIRST_DATA_PAGE);
    let mut state = TreeState::fresh(identity, page_size, root);
    let geometry = Geometry::new(
        page_size,
        identity.key_size as usize,
        identity.value_size as usize,
        state.salt,
    )?;
    let leaf = Node::leaf(&geometry, state.root_generation);
    {
        let page = file.pin(root)?;
        leaf.encode(root, &geometry, &mut page.write())?;
    }
    file.flush()?;
    state.clean_generation = state.stable_generation;
    meta::write_state(file, &state)?;
    tracing::info!(target: "gbtree::tree", path = %file.path().display(), "created empty tree");
    Ok(state)
}

/// Handle to an open generational B+tree.
///
/// Dropping the handle without calling [`GbTree::close`] leaves the file as
/// of its last checkpoint, exactly like a crash.
pub struct GbTree<L: Layout> {
    pub(crate) shared: Arc<TreeShared<L>>,
}

impl<L: Layout> GbTree<L> {
    /// Acquires the writer, blocking while another writer is live.
    pub fn writer(&self) -> Result<Writer<L>> {
        let permit = self.shared.latch.acquire_writer();
        Ok(Writer::new(Arc::clone(&self.shared), permit))
    }

    /// Acquires the writer or fails with [`TreeError::WriterBusy`].
    pub fn try_writer(&self) -> Result<Writer<L>> {
        let permit = self.shared.latch.try_acquire_writer()?;
        Ok(Writer::new(Arc::clone(&self.shared), permit))
    }

    /// Seeks entries with keys in `[from, to]`, in ascending order.
    pub fn seek(&self, from: &L::Key, to: &L::Key) -> Result<Seeker<L>> {
        let from = self.shared.encode_key(from)?;
        let to = self.shared.encode_key(to)?;
        Ok(Seeker::new(Arc::clone(&self.shared), Some(from), Some(to)))
    }

    /// Seeks every entry of the tree.
    pub fn scan(&self) -> Result<Seeker<L>> {
        Ok(Seeker::new(Arc::clone(&self.shared), None, None))
    }

    /// Looks up the value stored under `key`.
    pub fn get(&self, key: &L::Key) -> Result<Option<L::Value>> {
        let mut seeker = self.seek(key, key)?;
        if seeker.next()? {
            Ok(seeker.value().cloned())
        } else {
            Ok(None)
        }
    }

    /// Makes every change made so far durable and returns the checkpointed generation.
    pub fn checkpoint(&self) -> Result<Generation> {
        self.shared.checkpoint(false)
    }

    /// Checkpoints with the clean-shutdown marker and releases the tree.
    ///
    /// Fails with [`TreeError::WriterBusy`] while a writer is live.
    pub fn close(self) -> Result<()> {
        let _permit = self.shared.latch.try_acquire_writer()?;
        self.shared.checkpoint(true)?;
        tracing::debug!(target: "gbtree::tree", "tree closed");
        Ok(())
    }

    /// Walks the whole tree and reports structural violations.
    pub fn consistency_check(&self) -> Result<ConsistencyReport> {
        verify::check(&self.shared)
    }

    /// Returns a snapshot of tree statistics.
    pub fn stats(&self) -> TreeStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Emits tree statistics through `tracing`.
    pub fn emit_stats(&self) {
        self.shared.stats.emit_tracing();
    }

    /// Current root reference.
    pub fn root(&self) -> RootRef {
        self.shared.root()
    }

    /// Last checkpointed generation.
    pub fn stable_generation(&self) -> Generation {
        self.shared.clock.stable()
    }

    /// Generation stamped on pages written now.
    pub fn unstable_generation(&self) -> Generation {
        self.shared.clock.unstable()
    }

    /// Writer and seeker registrations.
    pub fn latch_snapshot(&self) -> LatchSnapshot {
        self.shared.latch.snapshot()
    }

    /// Number of levels from the root to the leaves.
    pub fn height(&self) -> Result<usize> {
        let mut id = self.shared.root().id;
        let mut height = 1;
        loop {
            let page = self.shared.file.pin(id)?;
            let buf = page.read();
            let view = NodeView::parse(&buf, self.shared.geometry)?;
            if view.kind() == NodeKind::Leaf {
                return Ok(height);
            }
            id = view.child(0)?;
            height += 1;
            if height > MAX_TREE_HEIGHT {
                return Err(TreeError::Corruption("tree deeper than supported"));
            }
        }
    }

    /// Node geometry of this tree.
    pub fn geometry(&self) -> Geometry {
        self.shared.geometry
    }

    /// The layout this tree was opened with.
    pub fn layout(&self) -> &L {
        &self.shared.layout
    }
}
