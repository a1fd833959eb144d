use std::cmp::Ordering;
use std::sync::Arc;

use super::page::{NodeKind, NodeView};
use super::tree::{TreeShared, MAX_TREE_HEIGHT};
use crate::primitives::concurrency::ReaderGuard;
use crate::storage::layout::Layout;
use crate::types::{Generation, PageId, Result, TreeError};

/// Ascending range scan that runs concurrently with the writer.
///
/// A seeker remembers the last key it returned rather than a slot, so a leaf
/// that is split, merged or copied underneath it is re-located by key and no
/// entry is returned twice. Entries inserted or removed during the scan may
/// or may not be observed.
pub struct Seeker<L: Layout> {
    shared: Arc<TreeShared<L>>,
    _reader: ReaderGuard,
    to: Option<Vec<u8>>,
    position: Option<Vec<u8>>,
    inclusive: bool,
    leaf: Option<(PageId, Generation)>,
    offset: usize,
    exhausted: bool,
    current: Option<(L::Key, L::Value)>,
}

enum Step<K, V> {
    Found(K, V),
    Moved,
    Restart,
    Done,
}

impl<L: Layout> Seeker<L> {
    pub(crate) fn new(
        shared: Arc<TreeShared<L>>,
        from: Option<Vec<u8>>,
        to: Option<Vec<u8>>,
    ) -> Self {
        let reader = shared.latch.acquire_reader(shared.clock.unstable());
        let exhausted = match (&from, &to) {
            (Some(from), Some(to)) => shared.layout.compare_encoded(from, to) == Ordering::Greater,
            _ => false,
        };
        Self {
            shared,
            _reader: reader,
            to,
            position: from,
            inclusive: true,
            leaf: None,
            offset: 0,
            exhausted,
            current: None,
        }
    }

    /// Advances to the next entry. Returns `false` once the range is exhausted.
    pub fn next(&mut self) -> Result<bool> {
        self.current = None;
        if self.exhausted {
            return Ok(false);
        }
        let mut restarts = 0;
        loop {
            match self.step()? {
                Step::Found(key, value) => {
                    self.current = Some((key, value));
                    return Ok(true);
                }
                Step::Done => {
                    self.exhausted = true;
                    self.leaf = None;
                    return Ok(false);
                }
                Step::Moved => {}
                Step::Restart => {
                    restarts += 1;
                    self.shared.stats.inc_seeker_restarts();
                    if restarts > self.shared.options.max_restarts {
                        return Err(TreeError::ConcurrencyExhausted { restarts });
                    }
                    self.leaf = None;
                    std::thread::yield_now();
                }
            }
        }
    }

    /// Key of the current entry.
    pub fn key(&self) -> Option<&L::Key> {
        self.current.as_ref().map(|(key, _)| key)
    }

    /// Value of the current entry.
    pub fn value(&self) -> Option<&L::Value> {
        self.current.as_ref().map(|(_, value)| value)
    }

    /// Consumes the seeker as an iterator of owned entries.
    pub fn entries(self) -> Entries<L> {
        Entries { seeker: self }
    }

    fn step(&mut self) -> Result<Step<L::Key, L::Value>> {
        let (leaf_id, leaf_generation) = match self.leaf {
            Some(leaf) => leaf,
            None => match self.locate()? {
                Some(leaf) => {
                    self.offset = 0;
                    leaf
                }
                None => return Ok(Step::Restart),
            },
        };
        let layout = &self.shared.layout;
        let geometry = self.shared.geometry;
        let mut id = leaf_id;
        let mut expected = leaf_generation;
        let mut hops = 0;
        loop {
            let page = self.shared.file.pin(id)?;
            let buf = page.read();
            let view = NodeView::parse(&buf, geometry)?;
            if view.generation() != expected || view.kind() != NodeKind::Leaf {
                return Ok(Step::Restart);
            }
            if let Some((successor, successor_generation)) = view.state().successor() {
                hops += 1;
                if hops > self.shared.options.max_successor_chain {
                    return Err(TreeError::SuccessorChainTooLong { length: hops });
                }
                self.shared.stats.inc_successor_follows();
                id = successor;
                expected = successor_generation;
                self.offset = 0;
                continue;
            }
            let in_range = match &self.position {
                Some(position) => view.covers(layout, position),
                None => view.low_fence().is_none(),
            };
            if !in_range {
                return Ok(Step::Restart);
            }

            let idx = match &self.position {
                None => 0,
                Some(position) => {
                    let hinted = !self.inclusive
                        && self.offset > 0
                        && self.offset <= view.len()
                        && layout.compare_encoded(view.key(self.offset - 1), position)
                            == Ordering::Equal;
                    if hinted {
                        self.offset
                    } else {
                        match view.search(layout, position) {
                            Ok(idx) if self.inclusive => idx,
                            Ok(idx) => idx + 1,
                            Err(idx) => idx,
                        }
                    }
                }
            };

            if idx < view.len() {
                let key = view.key(idx);
                if self.past_end(key) {
                    return Ok(Step::Done);
                }
                let decoded = (layout.read_key(key)?, layout.read_value(view.value(idx))?);
                self.position = Some(key.to_vec());
                self.inclusive = false;
                self.offset = idx + 1;
                self.leaf = Some((id, expected));
                return Ok(Step::Found(decoded.0, decoded.1));
            }

            return match view.high_fence() {
                Some(high) if !self.past_end(high) => {
                    self.position = Some(high.to_vec());
                    self.inclusive = true;
                    self.leaf = None;
                    Ok(Step::Moved)
                }
                _ => Ok(Step::Done),
            };
        }
    }

    fn past_end(&self, key: &[u8]) -> bool {
        self.to.as_deref().is_some_and(|to| {
            self.shared.layout.compare_encoded(key, to) == Ordering::Greater
        })
    }

    /// Descends from the current root to the leaf covering the position.
    /// Returns `None` when a concurrent change was observed on the way.
    fn locate(&self) -> Result<Option<(PageId, Generation)>> {
        let layout = &self.shared.layout;
        let geometry = self.shared.geometry;
        let root = self.shared.root();
        let mut id = root.id;
        let mut expected = Some(root.generation);
        let mut depth = 0;
        let mut hops = 0;
        loop {
            let page = self.shared.file.pin(id)?;
            let buf = page.read();
            let view = NodeView::parse(&buf, geometry)?;
            if expected.is_some_and(|generation| generation != view.generation()) {
                return Ok(None);
            }
            if let Some((successor, successor_generation)) = view.state().successor() {
                hops += 1;
                if hops > self.shared.options.max_successor_chain {
                    return Err(TreeError::SuccessorChainTooLong { length: hops });
                }
                self.shared.stats.inc_successor_follows();
                id = successor;
                expected = Some(successor_generation);
                continue;
            }
            let in_range = match &self.position {
                Some(position) => view.covers(layout, position),
                None => view.low_fence().is_none(),
            };
            if !in_range {
                return Ok(None);
            }
            if view.kind() == NodeKind::Leaf {
                return Ok(Some((id, view.generation())));
            }
            depth += 1;
            if depth > MAX_TREE_HEIGHT {
                return Err(TreeError::Corruption("tree deeper than supported"));
            }
            let child = match &self.position {
                Some(position) => view.child_index(layout, position),
                None => 0,
            };
            id = view.child(child)?;
            expected = None;
            hops = 0;
        }
    }
}

/// Iterator over the remaining entries of a [`Seeker`].
pub struct Entries<L: Layout> {
    seeker: Seeker<L>,
}

impl<L: Layout> Iterator for Entries<L> {
    type Item = Result<(L::Key, L::Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.seeker.next() {
            Ok(true) => self.seeker.current.take().map(Ok),
            Ok(false) => None,
            Err(err) => {
                self.seeker.exhausted = true;
                Some(Err(err))
            }
        }
    }
}
