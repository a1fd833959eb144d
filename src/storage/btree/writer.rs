use std::sync::Arc;

use smallvec::SmallVec;

use super::page::{self, Geometry, Node, NodeKind, NodeView};
use super::tree::{RootRef, TreeShared, MAX_TREE_HEIGHT};
use crate::primitives::concurrency::WriterGuard;
use crate::storage::layout::Layout;
use crate::types::{Generation, PageId, Result, TreeError};

/// The single mutation handle of a tree.
///
/// Every `put`/`remove` is visible to seekers when it returns. Closing the
/// writer releases the exclusive permit; it does not checkpoint.
pub struct Writer<L: Layout> {
    shared: Arc<TreeShared<L>>,
    _permit: WriterGuard,
}

#[derive(Clone, Copy, Debug)]
struct PathEntry {
    page_id: PageId,
    child: usize,
}

/// Internal pages from the root down to the current leaf.
type Path = SmallVec<[PathEntry; 8]>;

/// What a modified node reports to its parent.
enum Update {
    Unchanged,
    Changed { id: PageId, underflow: bool },
    Split { left: PageId, separator: Vec<u8>, right: PageId },
}

/// Whether writing a node in place may hide entries that now live elsewhere.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Shape {
    Grow,
    Shrink,
}

/// Publication steps deferred until the new structure is reachable.
enum Deferred {
    Write { page_id: PageId, node: Node },
    Supersede { old: PageId, successor: PageId, successor_generation: Generation },
}

impl<L: Layout> Writer<L> {
    pub(crate) fn new(shared: Arc<TreeShared<L>>, permit: WriterGuard) -> Self {
        Self {
            shared,
            _permit: permit,
        }
    }

    /// Inserts `key` or overwrites its value.
    pub fn put(&mut self, key: &L::Key, value: &L::Value) -> Result<()> {
        let key = self.shared.encode_key(key)?;
        let value = self.shared.encode_value(value)?;
        let _op = self.shared.op_latch.lock();
        let mut op = Operation::new(&self.shared);
        let (path, leaf_id, mut leaf) = op.descend(&key)?;
        let leaf_generation = leaf.generation;
        match leaf.search(&self.shared.layout, &key) {
            Ok(idx) => {
                if leaf.value(idx) == value.as_slice() {
                    return Ok(());
                }
                leaf.set_value(idx, &value);
            }
            Err(idx) => leaf.insert_entry(idx, &key, &value),
        }
        let update = if leaf.overflows(&op.geometry) {
            op.split(leaf, leaf_id, leaf_generation)?
        } else {
            Update::Changed {
                id: op.place(leaf, leaf_id, leaf_generation, Shape::Grow)?,
                underflow: false,
            }
        };
        op.propagate(path, update)
    }

    /// Removes `key`, returning the value it held.
    pub fn remove(&mut self, key: &L::Key) -> Result<Option<L::Value>> {
        let key = self.shared.encode_key(key)?;
        let _op = self.shared.op_latch.lock();
        let mut op = Operation::new(&self.shared);
        let (path, leaf_id, mut leaf) = op.descend(&key)?;
        let Ok(idx) = leaf.search(&self.shared.layout, &key) else {
            return Ok(None);
        };
        let leaf_generation = leaf.generation;
        let removed = leaf.remove_entry(idx);
        let value = self.shared.layout.read_value(&removed)?;
        let underflow = !path.is_empty() && leaf.len() < op.min_fill(NodeKind::Leaf);
        let id = op.place(leaf, leaf_id, leaf_generation, Shape::Grow)?;
        op.propagate(path, Update::Changed { id, underflow })?;
        Ok(Some(value))
    }

    /// Looks up `key`, observing every change made through this writer.
    pub fn get(&self, key: &L::Key) -> Result<Option<L::Value>> {
        let key = self.shared.encode_key(key)?;
        let _op = self.shared.op_latch.lock();
        let op = Operation::new(&self.shared);
        let (_, _, leaf) = op.descend(&key)?;
        match leaf.search(&self.shared.layout, &key) {
            Ok(idx) => Ok(Some(self.shared.layout.read_value(leaf.value(idx))?)),
            Err(_) => Ok(None),
        }
    }

    /// Releases the writer. All changes are already visible.
    pub fn close(self) -> Result<()> {
        Ok(())
    }
}

/// One `put` or `remove`, executed under the operation latch.
struct Operation<'a, L: Layout> {
    shared: &'a TreeShared<L>,
    geometry: Geometry,
    unstable: Generation,
    root: RootRef,
    deferred: Vec<Deferred>,
    released: Vec<PageId>,
}

impl<'a, L: Layout> Operation<'a, L> {
    fn new(shared: &'a TreeShared<L>) -> Self {
        Self {
            shared,
            geometry: shared.geometry,
            unstable: shared.clock.unstable(),
            root: shared.root(),
            deferred: Vec::new(),
            released: Vec::new(),
        }
    }

    fn min_fill(&self, kind: NodeKind) -> usize {
        self.geometry
            .min_fill(kind, self.shared.options.min_fill_percent)
    }

    fn descend(&self, key: &[u8]) -> Result<(Path, PageId, Node)> {
        let mut path = Path::new();
        let mut page_id = self.root.id;
        loop {
            let page = self.shared.file.pin(page_id)?;
            let buf = page.read();
            let view = NodeView::parse(&buf, self.geometry)?;
            if view.state().successor().is_some() {
                return Err(TreeError::Corruption("writer reached a superseded page"));
            }
            if view.kind() == NodeKind::Leaf {
                return Ok((path, page_id, Node::from_view(&view)?));
            }
            let child = view.child_index(&self.shared.layout, key);
            path.push(PathEntry { page_id, child });
            if path.len() > MAX_TREE_HEIGHT {
                return Err(TreeError::Corruption("tree deeper than supported"));
            }
            page_id = view.child(child)?;
        }
    }

    fn read_node(&self, page_id: PageId) -> Result<Node> {
        let page = self.shared.file.pin(page_id)?;
        let buf = page.read();
        let view = NodeView::parse(&buf, self.geometry)?;
        if view.state().successor().is_some() {
            return Err(TreeError::Corruption("writer reached a superseded page"));
        }
        Node::from_view(&view)
    }

    fn write_node(&self, page_id: PageId, node: &Node) -> Result<()> {
        let page = self.shared.file.pin(page_id)?;
        let mut buf = page.write();
        node.encode(page_id, &self.geometry, &mut buf)
    }

    fn allocate(&self) -> PageId {
        let stable = self.shared.clock.stable();
        let oldest_reader = self.shared.latch.oldest_reader();
        self.shared.freelist.lock().allocate(stable, oldest_reader)
    }

    /// Stores `node`, the new content of `page_id`, and returns where it lives.
    ///
    /// Pages of the unstable generation are rewritten in place; a shrinking
    /// rewrite waits until the entries it drops are reachable elsewhere. Older
    /// pages are copied to a fresh page and superseded once it is published.
    fn place(
        &mut self,
        mut node: Node,
        page_id: PageId,
        generation: Generation,
        shape: Shape,
    ) -> Result<PageId> {
        node.generation = self.unstable;
        if generation == self.unstable {
            self.shared.stats.inc_in_place_edits();
            match shape {
                Shape::Grow => self.write_node(page_id, &node)?,
                Shape::Shrink => self.deferred.push(Deferred::Write { page_id, node }),
            }
            return Ok(page_id);
        }
        let new_id = self.allocate();
        self.write_node(new_id, &node)?;
        self.shared.stats.inc_copy_on_write();
        tracing::trace!(
            target: "gbtree::writer",
            old = page_id.0,
            new = new_id.0,
            generation = self.unstable.0,
            "copied page to new generation"
        );
        self.supersede(page_id, new_id);
        Ok(new_id)
    }

    fn supersede(&mut self, old: PageId, successor: PageId) {
        self.deferred.push(Deferred::Supersede {
            old,
            successor,
            successor_generation: self.unstable,
        });
        self.released.push(old);
    }

    /// Splits an overfull node. The right half always goes to a new page and
    /// is written before the left half is narrowed.
    fn split(&mut self, mut node: Node, page_id: PageId, generation: Generation) -> Result<Update> {
        let kind = node.kind();
        let (mut right, separator) = node.split();
        right.generation = self.unstable;
        let right_id = self.allocate();
        self.write_node(right_id, &right)?;
        let left_id = self.place(node, page_id, generation, Shape::Shrink)?;
        match kind {
            NodeKind::Leaf => self.shared.stats.inc_leaf_splits(),
            NodeKind::Internal => self.shared.stats.inc_internal_splits(),
        }
        tracing::trace!(
            target: "gbtree::writer",
            ?kind,
            left = left_id.0,
            right = right_id.0,
            "split node"
        );
        Ok(Update::Split {
            left: left_id,
            separator,
            right: right_id,
        })
    }

    /// Applies child updates bottom-up along `path`, then publishes.
    fn propagate(mut self, mut path: Path, mut update: Update) -> Result<()> {
        while let Some(entry) = path.pop() {
            if matches!(update, Update::Unchanged) {
                break;
            }
            let mut node = self.read_node(entry.page_id)?;
            let generation = node.generation;
            let idx = entry.child;
            let mut changed = false;
            match std::mem::replace(&mut update, Update::Unchanged) {
                Update::Unchanged => {}
                Update::Changed { id, underflow } => {
                    if node.child(idx) != id {
                        node.set_child(idx, id);
                        changed = true;
                    }
                    if underflow {
                        changed |= self.rebalance(&mut node, idx)?;
                    }
                }
                Update::Split {
                    left,
                    separator,
                    right,
                } => {
                    node.set_child(idx, left);
                    node.insert_separator(idx, &separator, right);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
            if path.is_empty() && node.is_empty() {
                self.collapse_root(entry.page_id, &node)?;
                return self.publish();
            }
            update = if node.overflows(&self.geometry) {
                self.split(node, entry.page_id, generation)?
            } else {
                let underflow =
                    !path.is_empty() && node.len() < self.min_fill(NodeKind::Internal);
                Update::Changed {
                    id: self.place(node, entry.page_id, generation, Shape::Grow)?,
                    underflow,
                }
            };
        }
        match update {
            Update::Unchanged => {}
            Update::Changed { id, .. } => {
                if id != self.root.id {
                    self.root = RootRef {
                        id,
                        generation: self.unstable,
                    };
                }
            }
            Update::Split {
                left,
                separator,
                right,
            } => {
                let mut root = Node::internal(&self.geometry, self.unstable, left);
                root.insert_separator(0, &separator, right);
                let root_id = self.allocate();
                self.write_node(root_id, &root)?;
                self.shared.stats.inc_root_splits();
                tracing::trace!(
                    target: "gbtree::writer",
                    root = root_id.0,
                    "root split, height grew"
                );
                self.root = RootRef {
                    id: root_id,
                    generation: self.unstable,
                };
            }
        }
        self.publish()
    }

    /// Replaces an internal root left without separators by its only child.
    fn collapse_root(&mut self, root_id: PageId, root: &Node) -> Result<()> {
        let Some(child) = root.only_child() else {
            return Err(TreeError::Corruption("empty internal root without child"));
        };
        let child_generation = {
            let page = self.shared.file.pin(child)?;
            let buf = page.read();
            NodeView::parse(&buf, self.geometry)?.generation()
        };
        self.deferred.push(Deferred::Supersede {
            old: root_id,
            successor: child,
            successor_generation: child_generation,
        });
        self.released.push(root_id);
        self.shared.stats.inc_root_collapses();
        tracing::trace!(
            target: "gbtree::writer",
            old_root = root_id.0,
            new_root = child.0,
            "root collapsed, height shrank"
        );
        self.root = RootRef {
            id: child,
            generation: child_generation,
        };
        Ok(())
    }

    /// Fixes the underfull child `idx` of `parent` by borrowing from or
    /// merging with a sibling. Returns true when `parent` changed.
    fn rebalance(&mut self, parent: &mut Node, idx: usize) -> Result<bool> {
        if parent.is_empty() {
            return Ok(false);
        }
        let left_idx = if idx < parent.len() { idx } else { idx - 1 };
        let left_id = parent.child(left_idx);
        let right_id = parent.child(left_idx + 1);
        let separator = parent.key(left_idx).to_vec();
        let mut left = self.read_node(left_id)?;
        let mut right = self.read_node(right_id)?;
        let kind = left.kind();
        let min = self.min_fill(kind);
        let sibling_len = if left_idx == idx { right.len() } else { left.len() };
        let merged_len = match kind {
            NodeKind::Leaf => left.len() + right.len(),
            NodeKind::Internal => left.len() + right.len() + 1,
        };

        if sibling_len <= min && merged_len <= self.geometry.capacity(kind) {
            let left_generation = left.generation;
            left.merge_from(right, &separator);
            let merged_id = self.place(left, left_id, left_generation, Shape::Grow)?;
            self.supersede(right_id, merged_id);
            parent.remove_separator(left_idx);
            parent.set_child(left_idx, merged_id);
            self.shared.stats.inc_merges();
            tracing::trace!(
                target: "gbtree::writer",
                ?kind,
                left = merged_id.0,
                right = right_id.0,
                "merged siblings"
            );
            return Ok(true);
        }

        let (left_generation, right_generation) = (left.generation, right.generation);
        let new_separator = left.redistribute(&mut right, &separator);
        // The receiving side is written first; the donor narrows afterwards.
        let (left_id, right_id) = if left_idx == idx {
            let left_id = self.place(left, left_id, left_generation, Shape::Grow)?;
            let right_id = self.place(right, right_id, right_generation, Shape::Shrink)?;
            (left_id, right_id)
        } else {
            let right_id = self.place(right, right_id, right_generation, Shape::Grow)?;
            let left_id = self.place(left, left_id, left_generation, Shape::Shrink)?;
            (left_id, right_id)
        };
        parent.set_key(left_idx, &new_separator);
        parent.set_child(left_idx, left_id);
        parent.set_child(left_idx + 1, right_id);
        self.shared.stats.inc_borrows();
        Ok(true)
    }

    /// Swaps the root, then narrows and supersedes old pages top-down, then
    /// releases the superseded pages.
    fn publish(self) -> Result<()> {
        let Operation {
            shared,
            geometry,
            unstable,
            root,
            deferred,
            released,
        } = self;
        {
            let mut current = shared.root.write();
            if *current != root {
                *current = root;
            }
        }
        for step in deferred.into_iter().rev() {
            match step {
                Deferred::Write { page_id, node } => {
                    let page = shared.file.pin(page_id)?;
                    node.encode(page_id, &geometry, &mut page.write())?;
                }
                Deferred::Supersede {
                    old,
                    successor,
                    successor_generation,
                } => {
                    let page = shared.file.pin(old)?;
                    page::mark_superseded(&mut page.write(), successor, successor_generation);
                }
            }
        }
        if !released.is_empty() {
            let mut freelist = shared.freelist.lock();
            for page_id in released {
                freelist.release(page_id, unstable);
            }
        }
        Ok(())
    }
}
