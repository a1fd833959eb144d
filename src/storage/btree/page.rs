use std::cmp::Ordering;
use std::ops::Range;

use crate::storage::layout::Layout;
use crate::types::{
    page::{self, read_array, PageHeader, PageKind, PAGE_HDR_LEN},
    Generation, PageId, Result, TreeError,
};

/// Number of bytes used by the node header that follows the common page header.
pub const NODE_HEADER_LEN: usize = 32;

/// Smallest number of entries every node must be able to hold.
pub const MIN_NODE_CAPACITY: usize = 4;

const FLAGS: usize = PAGE_HDR_LEN;
const COUNT: Range<usize> = PAGE_HDR_LEN + 4..PAGE_HDR_LEN + 8;
const GENERATION: Range<usize> = PAGE_HDR_LEN + 8..PAGE_HDR_LEN + 16;
const SUCCESSOR: Range<usize> = PAGE_HDR_LEN + 16..PAGE_HDR_LEN + 24;
const SUCCESSOR_GENERATION: Range<usize> = PAGE_HDR_LEN + 24..PAGE_HDR_LEN + 32;
const FENCES_OFFSET: usize = PAGE_HDR_LEN + NODE_HEADER_LEN;

const FLAG_LOW_FENCE: u8 = 0x01;
const FLAG_HIGH_FENCE: u8 = 0x02;

const CHILD_LEN: usize = 8;

/// Logical kind of a tree node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeKind {
    /// Leaf holding key/value entries.
    Leaf,
    /// Internal node holding separator keys and child references.
    Internal,
}

impl NodeKind {
    /// Page kind written into the common header for this node kind.
    pub fn page_kind(self) -> PageKind {
        match self {
            NodeKind::Leaf => PageKind::TreeLeaf,
            NodeKind::Internal => PageKind::TreeInternal,
        }
    }

    /// Maps a common page kind back to a node kind.
    pub fn from_page_kind(kind: PageKind) -> Result<Self> {
        match kind {
            PageKind::TreeLeaf => Ok(NodeKind::Leaf),
            PageKind::TreeInternal => Ok(NodeKind::Internal),
            _ => Err(TreeError::Corruption("page is not a tree node")),
        }
    }
}

/// Liveness of a node page.
///
/// A superseded page has been replaced by `successor`, which was stamped with
/// `successor_generation` when it took over the superseded page's range.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PageState {
    /// The page is the current version of its key range.
    Live {
        /// Generation the page was written in.
        generation: Generation,
    },
    /// The page was replaced by a newer version.
    Superseded {
        /// Generation the page was written in.
        generation: Generation,
        /// Page that took over this page's range.
        successor: PageId,
        /// Generation of `successor` when the link was recorded.
        successor_generation: Generation,
    },
}

impl PageState {
    /// Generation stamped on the page itself.
    pub fn generation(&self) -> Generation {
        match *self {
            PageState::Live { generation } | PageState::Superseded { generation, .. } => generation,
        }
    }

    /// Successor link, when the page was superseded.
    pub fn successor(&self) -> Option<(PageId, Generation)> {
        match *self {
            PageState::Live { .. } => None,
            PageState::Superseded {
                successor,
                successor_generation,
                ..
            } => Some((successor, successor_generation)),
        }
    }
}

/// Fixed node geometry derived from the page size and the layout entry sizes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Geometry {
    /// Page size in bytes.
    pub page_size: usize,
    /// Encoded key size in bytes.
    pub key_size: usize,
    /// Encoded value size in bytes.
    pub value_size: usize,
    /// Salt stamped into every page header of the tree.
    pub salt: u64,
    /// Maximum number of entries in a leaf.
    pub leaf_capacity: usize,
    /// Maximum number of separator keys in an internal node.
    pub internal_capacity: usize,
}

impl Geometry {
    /// Computes node capacities, rejecting entry sizes that leave fewer than
    /// [`MIN_NODE_CAPACITY`] entries per page.
    pub fn new(page_size: u32, key_size: usize, value_size: usize, salt: u64) -> Result<Self> {
        page::validate_page_size(page_size)?;
        if key_size == 0 {
            return Err(TreeError::Invalid("key size must be non-zero"));
        }
        let page_size = page_size as usize;
        let body = page_size - FENCES_OFFSET;
        let available = body.checked_sub(2 * key_size).ok_or(TreeError::CapacityExceeded {
            what: "key size",
            limit: body / 2,
        })?;
        let leaf_capacity = available / (key_size + value_size);
        if leaf_capacity < MIN_NODE_CAPACITY {
            return Err(TreeError::CapacityExceeded {
                what: "leaf entry size",
                limit: available / MIN_NODE_CAPACITY,
            });
        }
        let internal_capacity = available.saturating_sub(CHILD_LEN) / (key_size + CHILD_LEN);
        if internal_capacity < MIN_NODE_CAPACITY {
            return Err(TreeError::CapacityExceeded {
                what: "internal entry size",
                limit: available.saturating_sub(CHILD_LEN) / MIN_NODE_CAPACITY,
            });
        }
        Ok(Self {
            page_size,
            key_size,
            value_size,
            salt,
            leaf_capacity,
            internal_capacity,
        })
    }

    /// Geometry for `layout` at `page_size`.
    pub fn for_layout<L: Layout>(layout: &L, page_size: u32, salt: u64) -> Result<Self> {
        Self::new(page_size, layout.key_size(), layout.value_size(), salt)
    }

    /// Maximum entry count for a node of `kind`.
    pub fn capacity(&self, kind: NodeKind) -> usize {
        match kind {
            NodeKind::Leaf => self.leaf_capacity,
            NodeKind::Internal => self.internal_capacity,
        }
    }

    /// Entry count below which a non-root node of `kind` is underfull.
    pub fn min_fill(&self, kind: NodeKind, percent: u8) -> usize {
        (self.capacity(kind) * percent as usize / 100).max(1)
    }

    fn entries_offset(&self) -> usize {
        FENCES_OFFSET + 2 * self.key_size
    }

    fn leaf_stride(&self) -> usize {
        self.key_size + self.value_size
    }

    fn internal_stride(&self) -> usize {
        self.key_size + CHILD_LEN
    }
}

/// Returns true when the fence range `[low, high)` contains `key`.
pub fn fence_covers<L: Layout>(
    layout: &L,
    low: Option<&[u8]>,
    high: Option<&[u8]>,
    key: &[u8],
) -> bool {
    let above_low = low.map_or(true, |low| layout.compare_encoded(low, key) != Ordering::Greater);
    let below_high = high.map_or(true, |high| layout.compare_encoded(key, high) == Ordering::Less);
    above_low && below_high
}

/// Borrowed, validated view over an encoded node page.
#[derive(Clone, Copy)]
pub struct NodeView<'a> {
    buf: &'a [u8],
    geometry: Geometry,
    kind: NodeKind,
    state: PageState,
    count: usize,
    flags: u8,
}

impl<'a> NodeView<'a> {
    /// Validates the page header and node header of `buf`.
    pub fn parse(buf: &'a [u8], geometry: Geometry) -> Result<Self> {
        if buf.len() != geometry.page_size {
            return Err(TreeError::Corruption("node buffer has wrong size"));
        }
        let header = PageHeader::decode(buf)?;
        if header.page_size as usize != geometry.page_size {
            return Err(TreeError::Corruption("node page size mismatch"));
        }
        if header.salt != geometry.salt {
            return Err(TreeError::Corruption("node page salt mismatch"));
        }
        let kind = NodeKind::from_page_kind(header.kind)?;
        let flags = buf[FLAGS];
        let count = u32::from_be_bytes(read_array(&buf[COUNT])?) as usize;
        if count > geometry.capacity(kind) {
            return Err(TreeError::Corruption("node entry count exceeds capacity"));
        }
        let generation = Generation(u64::from_be_bytes(read_array(&buf[GENERATION])?));
        let successor = u64::from_be_bytes(read_array(&buf[SUCCESSOR])?);
        let state = if successor == 0 {
            PageState::Live { generation }
        } else {
            PageState::Superseded {
                generation,
                successor: PageId(successor),
                successor_generation: Generation(u64::from_be_bytes(read_array(
                    &buf[SUCCESSOR_GENERATION],
                )?)),
            }
        };
        Ok(Self {
            buf,
            geometry,
            kind,
            state,
            count,
            flags,
        })
    }

    /// Node kind.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Liveness state.
    pub fn state(&self) -> PageState {
        self.state
    }

    /// Generation stamped on the page.
    pub fn generation(&self) -> Generation {
        self.state.generation()
    }

    /// Number of entries (leaf) or separator keys (internal).
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns true when the node holds no entries.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Inclusive low fence, `None` for the leftmost node of a level.
    pub fn low_fence(&self) -> Option<&'a [u8]> {
        (self.flags & FLAG_LOW_FENCE != 0)
            .then(|| &self.buf[FENCES_OFFSET..FENCES_OFFSET + self.geometry.key_size])
    }

    /// Exclusive high fence, `None` for the rightmost node of a level.
    pub fn high_fence(&self) -> Option<&'a [u8]> {
        let start = FENCES_OFFSET + self.geometry.key_size;
        (self.flags & FLAG_HIGH_FENCE != 0)
            .then(|| &self.buf[start..start + self.geometry.key_size])
    }

    /// Returns true when the node's fences contain `key`.
    pub fn covers<L: Layout>(&self, layout: &L, key: &[u8]) -> bool {
        fence_covers(layout, self.low_fence(), self.high_fence(), key)
    }

    /// Encoded key at `idx`.
    pub fn key(&self, idx: usize) -> &'a [u8] {
        let start = match self.kind {
            NodeKind::Leaf => self.geometry.entries_offset() + idx * self.geometry.leaf_stride(),
            NodeKind::Internal => {
                self.geometry.entries_offset() + CHILD_LEN + idx * self.geometry.internal_stride()
            }
        };
        &self.buf[start..start + self.geometry.key_size]
    }

    /// Encoded value at `idx` of a leaf.
    pub fn value(&self, idx: usize) -> &'a [u8] {
        let start = self.geometry.entries_offset()
            + idx * self.geometry.leaf_stride()
            + self.geometry.key_size;
        &self.buf[start..start + self.geometry.value_size]
    }

    /// Child reference at `idx` (`0..=len`) of an internal node.
    pub fn child(&self, idx: usize) -> Result<PageId> {
        let start = if idx == 0 {
            self.geometry.entries_offset()
        } else {
            self.geometry.entries_offset()
                + CHILD_LEN
                + (idx - 1) * self.geometry.internal_stride()
                + self.geometry.key_size
        };
        let id = u64::from_be_bytes(read_array(&self.buf[start..start + CHILD_LEN])?);
        if id < 2 {
            return Err(TreeError::Corruption("child reference points at header page"));
        }
        Ok(PageId(id))
    }

    /// Binary search for `key`: `Ok(idx)` on an exact match, otherwise the insertion point.
    pub fn search<L: Layout>(&self, layout: &L, key: &[u8]) -> std::result::Result<usize, usize> {
        binary_search(self.count, |idx| layout.compare_encoded(self.key(idx), key))
    }

    /// Index of the child whose range contains `key`.
    pub fn child_index<L: Layout>(&self, layout: &L, key: &[u8]) -> usize {
        match self.search(layout, key) {
            Ok(idx) => idx + 1,
            Err(idx) => idx,
        }
    }
}

fn binary_search(
    len: usize,
    mut cmp: impl FnMut(usize) -> Ordering,
) -> std::result::Result<usize, usize> {
    let (mut lo, mut hi) = (0usize, len);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match cmp(mid) {
            Ordering::Less => lo = mid + 1,
            Ordering::Greater => hi = mid,
            Ordering::Equal => return Ok(mid),
        }
    }
    Err(lo)
}

/// Records `successor` in the node header of `buf`, leaving the entries untouched.
pub fn mark_superseded(buf: &mut [u8], successor: PageId, successor_generation: Generation) {
    buf[SUCCESSOR].copy_from_slice(&successor.0.to_be_bytes());
    buf[SUCCESSOR_GENERATION].copy_from_slice(&successor_generation.0.to_be_bytes());
}

/// Clears a successor link recorded in `buf`.
pub fn clear_successor(buf: &mut [u8]) {
    buf[SUCCESSOR].fill(0);
    buf[SUCCESSOR_GENERATION].fill(0);
}

/// Owned, editable copy of a node used by the writer.
///
/// Keys and values are stored back to back with a fixed stride, exactly as on
/// the page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    kind: NodeKind,
    /// Generation the node will be stamped with when encoded.
    pub generation: Generation,
    /// Inclusive low fence.
    pub low_fence: Option<Vec<u8>>,
    /// Exclusive high fence.
    pub high_fence: Option<Vec<u8>>,
    key_size: usize,
    value_size: usize,
    keys: Vec<u8>,
    values: Vec<u8>,
    children: Vec<PageId>,
}

impl Node {
    /// Empty leaf.
    pub fn leaf(geometry: &Geometry, generation: Generation) -> Self {
        Self {
            kind: NodeKind::Leaf,
            generation,
            low_fence: None,
            high_fence: None,
            key_size: geometry.key_size,
            value_size: geometry.value_size,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Internal node with a single child and no separators.
    pub fn internal(geometry: &Geometry, generation: Generation, first_child: PageId) -> Self {
        Self {
            kind: NodeKind::Internal,
            generation,
            low_fence: None,
            high_fence: None,
            key_size: geometry.key_size,
            value_size: geometry.value_size,
            keys: Vec::new(),
            values: Vec::new(),
            children: vec![first_child],
        }
    }

    /// Copies the content of `view`. The successor link is not carried over.
    pub fn from_view(view: &NodeView<'_>) -> Result<Self> {
        let geometry = &view.geometry;
        let count = view.len();
        let start = geometry.entries_offset();
        let mut node = match view.kind() {
            NodeKind::Leaf => Self::leaf(geometry, view.generation()),
            NodeKind::Internal => Self::internal(geometry, view.generation(), view.child(0)?),
        };
        node.low_fence = view.low_fence().map(<[u8]>::to_vec);
        node.high_fence = view.high_fence().map(<[u8]>::to_vec);
        match view.kind() {
            NodeKind::Leaf => {
                let stride = geometry.leaf_stride();
                let entries = &view.buf[start..start + count * stride];
                node.keys.reserve(count * geometry.key_size);
                node.values.reserve(count * geometry.value_size);
                for entry in entries.chunks_exact(stride) {
                    node.keys.extend_from_slice(&entry[..geometry.key_size]);
                    node.values.extend_from_slice(&entry[geometry.key_size..]);
                }
            }
            NodeKind::Internal => {
                node.keys.reserve(count * geometry.key_size);
                node.children.reserve(count);
                for idx in 0..count {
                    node.keys.extend_from_slice(view.key(idx));
                    node.children.push(view.child(idx + 1)?);
                }
            }
        }
        Ok(node)
    }

    /// Node kind.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Number of entries (leaf) or separator keys (internal).
    pub fn len(&self) -> usize {
        self.keys.len() / self.key_size
    }

    /// Returns true when the node holds no entries.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Encoded key at `idx`.
    pub fn key(&self, idx: usize) -> &[u8] {
        &self.keys[idx * self.key_size..(idx + 1) * self.key_size]
    }

    /// Encoded value at `idx` of a leaf.
    pub fn value(&self, idx: usize) -> &[u8] {
        &self.values[idx * self.value_size..(idx + 1) * self.value_size]
    }

    /// Child reference at `idx` of an internal node.
    pub fn child(&self, idx: usize) -> PageId {
        self.children[idx]
    }

    /// All child references of an internal node.
    pub fn children(&self) -> &[PageId] {
        &self.children
    }

    /// Binary search for `key`.
    pub fn search<L: Layout>(&self, layout: &L, key: &[u8]) -> std::result::Result<usize, usize> {
        binary_search(self.len(), |idx| layout.compare_encoded(self.key(idx), key))
    }

    /// Inserts a leaf entry at `idx`.
    pub fn insert_entry(&mut self, idx: usize, key: &[u8], value: &[u8]) {
        let k = idx * self.key_size;
        self.keys.splice(k..k, key.iter().copied());
        let v = idx * self.value_size;
        self.values.splice(v..v, value.iter().copied());
    }

    /// Replaces the value of the leaf entry at `idx`.
    pub fn set_value(&mut self, idx: usize, value: &[u8]) {
        let v = idx * self.value_size;
        self.values[v..v + self.value_size].copy_from_slice(value);
    }

    /// Removes the leaf entry at `idx`, returning its encoded value.
    pub fn remove_entry(&mut self, idx: usize) -> Vec<u8> {
        let k = idx * self.key_size;
        self.keys.drain(k..k + self.key_size);
        let v = idx * self.value_size;
        self.values.drain(v..v + self.value_size).collect()
    }

    /// Inserts separator `key` at `idx` with `right` as the child that follows it.
    pub fn insert_separator(&mut self, idx: usize, key: &[u8], right: PageId) {
        let k = idx * self.key_size;
        self.keys.splice(k..k, key.iter().copied());
        self.children.insert(idx + 1, right);
    }

    /// Removes separator `idx` together with the child that follows it.
    pub fn remove_separator(&mut self, idx: usize) {
        let k = idx * self.key_size;
        self.keys.drain(k..k + self.key_size);
        self.children.remove(idx + 1);
    }

    /// Replaces separator `idx`.
    pub fn set_key(&mut self, idx: usize, key: &[u8]) {
        let k = idx * self.key_size;
        self.keys[k..k + self.key_size].copy_from_slice(key);
    }

    /// Replaces child reference `idx`.
    pub fn set_child(&mut self, idx: usize, child: PageId) {
        self.children[idx] = child;
    }

    /// Returns the sole child of an internal node that has no separators left.
    pub fn only_child(&self) -> Option<PageId> {
        (self.kind == NodeKind::Internal && self.keys.is_empty())
            .then(|| self.children.first().copied())
            .flatten()
    }

    /// Splits the node in two and returns the right half with its separator.
    ///
    /// A leaf keeps `ceil(n / 2)` entries and the separator is the first key of
    /// the right half. An internal node moves its middle key up.
    pub fn split(&mut self) -> (Node, Vec<u8>) {
        let count = self.len();
        let mut right = Node {
            kind: self.kind,
            generation: self.generation,
            low_fence: None,
            high_fence: self.high_fence.take(),
            key_size: self.key_size,
            value_size: self.value_size,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
        };
        let separator = match self.kind {
            NodeKind::Leaf => {
                let at = count.div_ceil(2);
                right.keys = self.keys.split_off(at * self.key_size);
                right.values = self.values.split_off(at * self.value_size);
                right.key(0).to_vec()
            }
            NodeKind::Internal => {
                let mid = count / 2;
                right.keys = self.keys.split_off((mid + 1) * self.key_size);
                let separator = self.keys.split_off(mid * self.key_size);
                right.children = self.children.split_off(mid + 1);
                separator
            }
        };
        right.low_fence = Some(separator.clone());
        self.high_fence = Some(separator.clone());
        (right, separator)
    }

    /// Appends the content of `right`, the node immediately to the right of
    /// `self` under `separator`.
    pub fn merge_from(&mut self, right: Node, separator: &[u8]) {
        if self.kind == NodeKind::Internal {
            self.keys.extend_from_slice(separator);
            self.children.extend(right.children);
        }
        self.keys.extend(right.keys);
        self.values.extend(right.values);
        self.high_fence = right.high_fence;
    }

    /// Evens out two siblings and returns their new separator.
    pub fn redistribute(&mut self, right: &mut Node, separator: &[u8]) -> Vec<u8> {
        let taken = std::mem::replace(
            right,
            Node {
                kind: self.kind,
                generation: right.generation,
                low_fence: None,
                high_fence: None,
                key_size: self.key_size,
                value_size: self.value_size,
                keys: Vec::new(),
                values: Vec::new(),
                children: Vec::new(),
            },
        );
        let generation = taken.generation;
        self.merge_from(taken, separator);
        let (mut new_right, new_separator) = self.split();
        new_right.generation = generation;
        *right = new_right;
        new_separator
    }

    /// Returns true when the node holds more entries than a page can store.
    pub fn overflows(&self, geometry: &Geometry) -> bool {
        self.len() > geometry.capacity(self.kind)
    }

    /// Encodes the node as page `id` into `buf`, clearing any successor link.
    pub fn encode(&self, id: PageId, geometry: &Geometry, buf: &mut [u8]) -> Result<()> {
        if buf.len() != geometry.page_size {
            return Err(TreeError::Invalid("node buffer has wrong size"));
        }
        if self.overflows(geometry) {
            return Err(TreeError::CapacityExceeded {
                what: "node entries",
                limit: geometry.capacity(self.kind),
            });
        }
        PageHeader::new(id, self.kind.page_kind(), geometry.page_size as u32, geometry.salt)?
            .encode(buf)?;
        buf[FENCES_OFFSET - NODE_HEADER_LEN..FENCES_OFFSET].fill(0);
        let mut flags = 0;
        let ks = geometry.key_size;
        if let Some(low) = &self.low_fence {
            flags |= FLAG_LOW_FENCE;
            buf[FENCES_OFFSET..FENCES_OFFSET + ks].copy_from_slice(low);
        } else {
            buf[FENCES_OFFSET..FENCES_OFFSET + ks].fill(0);
        }
        if let Some(high) = &self.high_fence {
            flags |= FLAG_HIGH_FENCE;
            buf[FENCES_OFFSET + ks..FENCES_OFFSET + 2 * ks].copy_from_slice(high);
        } else {
            buf[FENCES_OFFSET + ks..FENCES_OFFSET + 2 * ks].fill(0);
        }
        buf[FLAGS] = flags;
        buf[COUNT].copy_from_slice(&(self.len() as u32).to_be_bytes());
        buf[GENERATION].copy_from_slice(&self.generation.0.to_be_bytes());

        let mut pos = geometry.entries_offset();
        match self.kind {
            NodeKind::Leaf => {
                let vs = geometry.value_size;
                for idx in 0..self.len() {
                    buf[pos..pos + ks].copy_from_slice(self.key(idx));
                    buf[pos + ks..pos + ks + vs].copy_from_slice(self.value(idx));
                    pos += ks + vs;
                }
            }
            NodeKind::Internal => {
                let first = self
                    .children
                    .first()
                    .ok_or(TreeError::Invalid("internal node without children"))?;
                buf[pos..pos + CHILD_LEN].copy_from_slice(&first.0.to_be_bytes());
                pos += CHILD_LEN;
                for (key, child) in self.keys.chunks_exact(ks).zip(&self.children[1..]) {
                    buf[pos..pos + ks].copy_from_slice(key);
                    buf[pos + ks..pos + ks + CHILD_LEN].copy_from_slice(&child.0.to_be_bytes());
                    pos += ks + CHILD_LEN;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::layout::LongLayout;

    fn geometry() -> Geometry {
        Geometry::new(4096, 8, 8, 99).unwrap()
    }

    fn key(k: u64) -> [u8; 8] {
        k.to_be_bytes()
    }

    fn leaf_with(keys: impl IntoIterator<Item = u64>) -> Node {
        let geo = geometry();
        let mut node = Node::leaf(&geo, Generation(3));
        for (idx, k) in keys.into_iter().enumerate() {
            node.insert_entry(idx, &key(k), &key(k * 10));
        }
        node
    }

    #[test]
    fn geometry_capacities() -> Result<()> {
        let geo = geometry();
        assert_eq!(geo.leaf_capacity, (4096 - 64 - 16) / 16);
        assert_eq!(geo.internal_capacity, (4096 - 64 - 16 - 8) / 16);
        assert_eq!(geo.min_fill(NodeKind::Leaf, 40), geo.leaf_capacity * 40 / 100);
        Ok(())
    }

    #[test]
    fn geometry_rejects_oversized_entries() {
        let err = Geometry::new(4096, 1000, 1000, 0).unwrap_err();
        assert!(matches!(err, TreeError::CapacityExceeded { .. }));
        assert!(matches!(
            Geometry::new(4096, 0, 8, 0),
            Err(TreeError::Invalid(_))
        ));
    }

    #[test]
    fn leaf_encode_and_parse() -> Result<()> {
        let geo = geometry();
        let layout = LongLayout::new();
        let mut node = leaf_with([5, 10, 20]);
        node.low_fence = Some(key(5).to_vec());
        node.high_fence = Some(key(30).to_vec());
        let mut buf = vec![0u8; geo.page_size];
        node.encode(PageId(7), &geo, &mut buf)?;

        let view = NodeView::parse(&buf, geo)?;
        assert_eq!(view.kind(), NodeKind::Leaf);
        assert_eq!(view.len(), 3);
        assert_eq!(view.state(), PageState::Live { generation: Generation(3) });
        assert_eq!(view.key(1), key(10));
        assert_eq!(view.value(2), key(200));
        assert_eq!(view.search(&layout, &key(20)), Ok(2));
        assert_eq!(view.search(&layout, &key(11)), Err(2));
        assert!(view.covers(&layout, &key(5)));
        assert!(view.covers(&layout, &key(29)));
        assert!(!view.covers(&layout, &key(30)));
        assert!(!view.covers(&layout, &key(4)));
        assert_eq!(Node::from_view(&view)?, node);
        Ok(())
    }

    #[test]
    fn internal_child_routing() -> Result<()> {
        let geo = geometry();
        let layout = LongLayout::new();
        let mut node = Node::internal(&geo, Generation(1), PageId(2));
        node.insert_separator(0, &key(100), PageId(3));
        node.insert_separator(1, &key(200), PageId(4));
        let mut buf = vec![0u8; geo.page_size];
        node.encode(PageId(9), &geo, &mut buf)?;
        let view = NodeView::parse(&buf, geo)?;
        assert_eq!(view.child(view.child_index(&layout, &key(99)))?, PageId(2));
        assert_eq!(view.child(view.child_index(&layout, &key(100)))?, PageId(3));
        assert_eq!(view.child(view.child_index(&layout, &key(250)))?, PageId(4));
        assert_eq!(Node::from_view(&view)?, node);
        Ok(())
    }

    #[test]
    fn supersede_marks_only_the_header() -> Result<()> {
        let geo = geometry();
        let node = leaf_with([1, 2]);
        let mut buf = vec![0u8; geo.page_size];
        node.encode(PageId(4), &geo, &mut buf)?;
        mark_superseded(&mut buf, PageId(12), Generation(8));
        let view = NodeView::parse(&buf, geo)?;
        assert_eq!(view.state().successor(), Some((PageId(12), Generation(8))));
        assert_eq!(view.generation(), Generation(3));
        assert_eq!(view.len(), 2);
        clear_successor(&mut buf);
        assert_eq!(NodeView::parse(&buf, geo)?.state().successor(), None);
        Ok(())
    }

    #[test]
    fn leaf_split_sets_fences() {
        let mut left = leaf_with(1..=5);
        left.high_fence = Some(key(50).to_vec());
        let (right, separator) = left.split();
        assert_eq!(left.len(), 3);
        assert_eq!(right.len(), 2);
        assert_eq!(separator, key(4));
        assert_eq!(left.high_fence.as_deref(), Some(&key(4)[..]));
        assert_eq!(right.low_fence.as_deref(), Some(&key(4)[..]));
        assert_eq!(right.high_fence.as_deref(), Some(&key(50)[..]));
    }

    #[test]
    fn internal_split_moves_middle_key_up() {
        let geo = geometry();
        let mut node = Node::internal(&geo, Generation(1), PageId(10));
        for i in 0..5u64 {
            node.insert_separator(i as usize, &key((i + 1) * 10), PageId(11 + i));
        }
        let (right, separator) = node.split();
        assert_eq!(separator, key(30));
        assert_eq!(node.len(), 2);
        assert_eq!(node.children(), &[PageId(10), PageId(11), PageId(12)]);
        assert_eq!(right.len(), 2);
        assert_eq!(right.children(), &[PageId(13), PageId(14), PageId(15)]);
    }

    #[test]
    fn redistribute_balances_leaves() {
        let mut left = leaf_with([1]);
        let mut right = leaf_with([10, 11, 12, 13, 14]);
        right.low_fence = Some(key(10).to_vec());
        left.high_fence = Some(key(10).to_vec());
        let separator = left.redistribute(&mut right, &key(10));
        assert_eq!(left.len(), 3);
        assert_eq!(right.len(), 3);
        assert_eq!(separator, key(12));
        assert_eq!(right.key(0), key(12));
        assert_eq!(right.low_fence.as_deref(), Some(&key(12)[..]));
    }

    #[test]
    fn merge_joins_internal_nodes_with_separator() {
        let geo = geometry();
        let mut left = Node::internal(&geo, Generation(1), PageId(2));
        left.insert_separator(0, &key(10), PageId(3));
        let mut right = Node::internal(&geo, Generation(1), PageId(4));
        right.insert_separator(0, &key(30), PageId(5));
        left.merge_from(right, &key(20));
        assert_eq!(left.len(), 3);
        assert_eq!(left.key(1), key(20));
        assert_eq!(
            left.children(),
            &[PageId(2), PageId(3), PageId(4), PageId(5)]
        );
    }
}
