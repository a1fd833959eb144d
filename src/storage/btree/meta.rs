use std::ops::Range;

use rand::{rngs::OsRng, RngCore};

use crate::primitives::pager::PagedFile;
use crate::storage::layout::Layout;
use crate::types::{
    checksum::{stamp_page_crc32, verify_page_crc32},
    page::{read_array, PageHeader, PageKind, PAGE_HDR_LEN},
    Generation, PageId, Result, TreeError,
};

/// Tree format version recorded in every state slot.
pub const TREE_FORMAT_VERSION: u32 = 1;

/// The two pages holding alternating copies of the tree state.
pub const STATE_SLOTS: [PageId; 2] = [PageId(0), PageId(1)];

/// First page id available to tree nodes and free-list trunks.
pub const FIRST_DATA_PAGE: u64 = 2;

const STATE_PAGE_SIZE: Range<usize> = PAGE_HDR_LEN..PAGE_HDR_LEN + 4;
const STATE_FORMAT_VERSION: Range<usize> = PAGE_HDR_LEN + 4..PAGE_HDR_LEN + 8;
const STATE_LAYOUT_ID: Range<usize> = PAGE_HDR_LEN + 8..PAGE_HDR_LEN + 16;
const STATE_LAYOUT_MAJOR: Range<usize> = PAGE_HDR_LEN + 16..PAGE_HDR_LEN + 20;
const STATE_LAYOUT_MINOR: Range<usize> = PAGE_HDR_LEN + 20..PAGE_HDR_LEN + 24;
const STATE_KEY_SIZE: Range<usize> = PAGE_HDR_LEN + 24..PAGE_HDR_LEN + 28;
const STATE_VALUE_SIZE: Range<usize> = PAGE_HDR_LEN + 28..PAGE_HDR_LEN + 32;
const STATE_SEQUENCE: Range<usize> = PAGE_HDR_LEN + 32..PAGE_HDR_LEN + 40;
const STATE_STABLE_GENERATION: Range<usize> = PAGE_HDR_LEN + 40..PAGE_HDR_LEN + 48;
const STATE_CLEAN_GENERATION: Range<usize> = PAGE_HDR_LEN + 48..PAGE_HDR_LEN + 56;
const STATE_ROOT: Range<usize> = PAGE_HDR_LEN + 56..PAGE_HDR_LEN + 64;
const STATE_ROOT_GENERATION: Range<usize> = PAGE_HDR_LEN + 64..PAGE_HDR_LEN + 72;
const STATE_HIGH_WATER: Range<usize> = PAGE_HDR_LEN + 72..PAGE_HDR_LEN + 80;
const STATE_FREELIST_HEAD: Range<usize> = PAGE_HDR_LEN + 80..PAGE_HDR_LEN + 88;
const STATE_FREELIST_LEN: Range<usize> = PAGE_HDR_LEN + 88..PAGE_HDR_LEN + 96;

/// Identity of the layout a tree file was created with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayoutIdentity {
    /// Layout identifier.
    pub identifier: u64,
    /// Layout major version.
    pub major: u32,
    /// Layout minor version.
    pub minor: u32,
    /// Encoded key size.
    pub key_size: u32,
    /// Encoded value size.
    pub value_size: u32,
}

impl LayoutIdentity {
    /// Identity of `layout`.
    pub fn of<L: Layout>(layout: &L) -> Self {
        Self {
            identifier: layout.identifier(),
            major: layout.major_version(),
            minor: layout.minor_version(),
            key_size: layout.key_size() as u32,
            value_size: layout.value_size() as u32,
        }
    }

    /// Fails with [`TreeError::LayoutMismatch`] unless `other` matches `self`.
    pub fn check(&self, other: &LayoutIdentity) -> Result<()> {
        if self.identifier != other.identifier {
            return Err(TreeError::LayoutMismatch("layout identifier differs"));
        }
        if self.major != other.major || self.minor != other.minor {
            return Err(TreeError::LayoutMismatch("layout version differs"));
        }
        if self.key_size != other.key_size || self.value_size != other.value_size {
            return Err(TreeError::LayoutMismatch("layout entry sizes differ"));
        }
        Ok(())
    }
}

/// Durable tree state written to one of the two state slots by each checkpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeState {
    /// Page size the file was created with.
    pub page_size: u32,
    /// Random salt stamped into every page header.
    pub salt: u64,
    /// Layout the file was created with.
    pub layout: LayoutIdentity,
    /// Checkpoint sequence number; the slot with the highest valid value wins.
    pub sequence: u64,
    /// Last checkpointed generation.
    pub stable_generation: Generation,
    /// Equal to `stable_generation` after a clean close, zero while the tree is open.
    pub clean_generation: Generation,
    /// Root page as of the checkpoint.
    pub root: PageId,
    /// Generation of the root page as of the checkpoint.
    pub root_generation: Generation,
    /// First page id never handed out.
    pub high_water: u64,
    /// First free-list trunk page, zero when the list is empty.
    pub freelist_head: PageId,
    /// Number of free page ids stored in the trunk chain.
    pub freelist_len: u64,
}

impl TreeState {
    /// State of a freshly created tree whose empty root leaf lives at `root`.
    pub fn fresh(layout: LayoutIdentity, page_size: u32, root: PageId) -> Self {
        Self {
            page_size,
            salt: generate_salt(),
            layout,
            sequence: 0,
            stable_generation: Generation(1),
            clean_generation: Generation(0),
            root,
            root_generation: Generation(1),
            high_water: root.0 + 1,
            freelist_head: PageId(0),
            freelist_len: 0,
        }
    }

    /// Returns true when the previous session ended with a clean close.
    pub fn was_clean(&self) -> bool {
        self.clean_generation == self.stable_generation
    }

    /// Slot this state is written to.
    pub fn slot(&self) -> PageId {
        STATE_SLOTS[(self.sequence % 2) as usize]
    }

    /// Encodes the state into a full page buffer for its slot, checksum included.
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < STATE_FREELIST_LEN.end {
            return Err(TreeError::Invalid("state buffer too small"));
        }
        buf.fill(0);
        PageHeader::new(self.slot(), PageKind::State, self.page_size, self.salt)?.encode(buf)?;
        buf[STATE_PAGE_SIZE].copy_from_slice(&self.page_size.to_be_bytes());
        buf[STATE_FORMAT_VERSION].copy_from_slice(&TREE_FORMAT_VERSION.to_be_bytes());
        buf[STATE_LAYOUT_ID].copy_from_slice(&self.layout.identifier.to_be_bytes());
        buf[STATE_LAYOUT_MAJOR].copy_from_slice(&self.layout.major.to_be_bytes());
        buf[STATE_LAYOUT_MINOR].copy_from_slice(&self.layout.minor.to_be_bytes());
        buf[STATE_KEY_SIZE].copy_from_slice(&self.layout.key_size.to_be_bytes());
        buf[STATE_VALUE_SIZE].copy_from_slice(&self.layout.value_size.to_be_bytes());
        buf[STATE_SEQUENCE].copy_from_slice(&self.sequence.to_be_bytes());
        buf[STATE_STABLE_GENERATION].copy_from_slice(&self.stable_generation.0.to_be_bytes());
        buf[STATE_CLEAN_GENERATION].copy_from_slice(&self.clean_generation.0.to_be_bytes());
        buf[STATE_ROOT].copy_from_slice(&self.root.0.to_be_bytes());
        buf[STATE_ROOT_GENERATION].copy_from_slice(&self.root_generation.0.to_be_bytes());
        buf[STATE_HIGH_WATER].copy_from_slice(&self.high_water.to_be_bytes());
        buf[STATE_FREELIST_HEAD].copy_from_slice(&self.freelist_head.0.to_be_bytes());
        buf[STATE_FREELIST_LEN].copy_from_slice(&self.freelist_len.to_be_bytes());
        stamp_page_crc32(self.slot().0, buf);
        Ok(())
    }

    /// Decodes and validates a state slot.
    ///
    /// The checksum is always verified here, whether or not the page cache
    /// verifies checksums on load.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < STATE_FREELIST_LEN.end {
            return Err(TreeError::Corruption("state page truncated"));
        }
        let header = PageHeader::decode(buf)?;
        if header.kind != PageKind::State {
            return Err(TreeError::Corruption("state slot holds a non-state page"));
        }
        if !verify_page_crc32(header.page_no.0, buf) {
            return Err(TreeError::Corruption("state page checksum mismatch"));
        }
        let format = u32::from_be_bytes(read_array(&buf[STATE_FORMAT_VERSION])?);
        if format != TREE_FORMAT_VERSION {
            return Err(TreeError::Corruption("unsupported tree format version"));
        }
        let page_size = u32::from_be_bytes(read_array(&buf[STATE_PAGE_SIZE])?);
        if page_size != header.page_size {
            return Err(TreeError::Corruption("state page size disagrees with header"));
        }
        let u64_at = |range: Range<usize>| -> Result<u64> {
            Ok(u64::from_be_bytes(read_array(&buf[range])?))
        };
        let u32_at = |range: Range<usize>| -> Result<u32> {
            Ok(u32::from_be_bytes(read_array(&buf[range])?))
        };
        let state = Self {
            page_size,
            salt: header.salt,
            layout: LayoutIdentity {
                identifier: u64_at(STATE_LAYOUT_ID)?,
                major: u32_at(STATE_LAYOUT_MAJOR)?,
                minor: u32_at(STATE_LAYOUT_MINOR)?,
                key_size: u32_at(STATE_KEY_SIZE)?,
                value_size: u32_at(STATE_VALUE_SIZE)?,
            },
            sequence: u64_at(STATE_SEQUENCE)?,
            stable_generation: Generation(u64_at(STATE_STABLE_GENERATION)?),
            clean_generation: Generation(u64_at(STATE_CLEAN_GENERATION)?),
            root: PageId(u64_at(STATE_ROOT)?),
            root_generation: Generation(u64_at(STATE_ROOT_GENERATION)?),
            high_water: u64_at(STATE_HIGH_WATER)?,
            freelist_head: PageId(u64_at(STATE_FREELIST_HEAD)?),
            freelist_len: u64_at(STATE_FREELIST_LEN)?,
        };
        if header.page_no != state.slot() {
            return Err(TreeError::Corruption("state sequence does not match its slot"));
        }
        if state.root.0 < FIRST_DATA_PAGE || state.root.0 >= state.high_water {
            return Err(TreeError::Corruption("state root outside allocated pages"));
        }
        if state.root_generation > state.stable_generation {
            return Err(TreeError::Corruption("state root newer than stable generation"));
        }
        Ok(state)
    }
}

/// Random salt for a new tree file.
pub fn generate_salt() -> u64 {
    OsRng.next_u64()
}

/// Reads both state slots and returns the valid one with the highest sequence.
pub fn read_state(file: &PagedFile) -> Result<TreeState> {
    let mut best: Option<TreeState> = None;
    for slot in STATE_SLOTS {
        let decoded = file.pin(slot).and_then(|page| {
            let buf = page.read();
            TreeState::decode(&buf)
        });
        match decoded {
            Ok(state) => {
                if best.as_ref().map_or(true, |b| state.sequence > b.sequence) {
                    best = Some(state);
                }
            }
            Err(err) => {
                tracing::debug!(
                    target: "gbtree::meta",
                    slot = slot.0,
                    error = %err,
                    "state slot unusable"
                );
            }
        }
    }
    best.ok_or(TreeError::HeaderCorrupt("no valid state slot"))
}

/// Writes `state` to its slot and forces it to stable storage.
///
/// The slot is overwritten without loading it first: a torn earlier write
/// must not stop the next checkpoint from replacing it.
pub fn write_state(file: &PagedFile, state: &TreeState) -> Result<()> {
    let page = file.pin_blank(state.slot())?;
    {
        let mut buf = page.write();
        state.encode(&mut buf)?;
    }
    drop(page);
    file.flush()
}
