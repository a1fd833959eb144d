#![forbid(unsafe_code)]

//! Identifiers, errors and the shared on-disk page header.

use std::fmt;

/// Page checksums.
pub mod checksum;

pub use checksum::page_crc32;

/// Identifier of a fixed-size page inside a paged file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PageId(pub u64);

/// Monotonically increasing stamp applied to every structural write.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Generation(pub u64);

impl Generation {
    /// Returns the generation that follows `self`.
    pub fn next(self) -> Self {
        Generation(self.0.saturating_add(1))
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Errors surfaced by the page cache and the tree.
#[derive(thiserror::Error, Debug)]
pub enum TreeError {
    /// Underlying file I/O failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// On-disk structure failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an argument the tree cannot accept.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The requested file or entry does not exist.
    #[error("not found")]
    NotFound,
    /// A key, value or entry does not fit the configured page size.
    #[error("capacity exceeded: {what} (limit {limit})")]
    CapacityExceeded {
        /// What overflowed.
        what: &'static str,
        /// The limit that applies for the configured page size.
        limit: usize,
    },
    /// Another writer is live on this tree.
    #[error("writer already held")]
    WriterBusy,
    /// A seeker restarted from the root more often than allowed.
    #[error("seeker gave up after {restarts} restarts")]
    ConcurrencyExhausted {
        /// Number of restarts performed before giving up.
        restarts: usize,
    },
    /// A successor chain was longer than the configured bound.
    #[error("successor chain of length {length} exceeds bound")]
    SuccessorChainTooLong {
        /// Number of successor hops followed.
        length: usize,
    },
    /// The file was created with a different layout.
    #[error("layout mismatch: {0}")]
    LayoutMismatch(&'static str),
    /// Neither header slot could be decoded.
    #[error("tree header unreadable: {0}")]
    HeaderCorrupt(&'static str),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TreeError>;

pub mod page {
    //! Shared on-disk page metadata used by pager components.

    use std::convert::{TryFrom, TryInto};

    use super::{PageId, Result, TreeError};

    /// Magic bytes opening every written page.
    pub const PAGE_MAGIC: [u8; 4] = *b"GBPT";
    /// Version of the page header layout.
    pub const PAGE_FORMAT_VERSION: u16 = 1;
    /// Page size used when none is configured.
    pub const DEFAULT_PAGE_SIZE: u32 = 8192;
    /// Smallest supported page size.
    pub const MIN_PAGE_SIZE: u32 = 4096;
    /// Largest supported page size.
    pub const MAX_PAGE_SIZE: u32 = 4 * 1024 * 1024;
    /// Length of the common page header.
    pub const PAGE_HDR_LEN: usize = 32;

    pub mod header {
        //! Byte offsets for fixed header fields.
        use std::ops::Range;

        /// Page magic.
        pub const MAGIC: Range<usize> = 0..4;
        /// Header layout version, big-endian.
        pub const FORMAT_VERSION: Range<usize> = 4..6;
        /// Page kind byte.
        pub const PAGE_KIND: usize = 6;
        /// Always zero.
        pub const RESERVED: usize = 7;
        /// Page size, big-endian.
        pub const PAGE_SIZE: Range<usize> = 8..12;
        /// Page number, big-endian.
        pub const PAGE_NO: Range<usize> = 12..20;
        /// File salt, big-endian.
        pub const SALT: Range<usize> = 20..28;
        /// Page checksum, big-endian.
        pub const CRC32: Range<usize> = 28..32;
    }

    /// What a page holds.
    #[repr(u8)]
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub enum PageKind {
        /// One of the two tree state slots.
        State = 1,
        /// Free-list trunk.
        FreeList = 2,
        /// Tree leaf node.
        TreeLeaf = 3,
        /// Tree internal node.
        TreeInternal = 4,
    }

    impl PageKind {
        /// On-disk kind byte.
        pub const fn as_u8(self) -> u8 {
            self as u8
        }
    }

    impl TryFrom<u8> for PageKind {
        type Error = TreeError;

        fn try_from(value: u8) -> Result<Self> {
            match value {
                1 => Ok(PageKind::State),
                2 => Ok(PageKind::FreeList),
                3 => Ok(PageKind::TreeLeaf),
                4 => Ok(PageKind::TreeInternal),
                _ => Err(TreeError::Corruption("unknown page kind")),
            }
        }
    }

    /// Decoded common page header.
    #[derive(Clone, Debug, Eq, PartialEq)]
    pub struct PageHeader {
        /// Header layout version.
        pub format_version: u16,
        /// Page kind.
        pub kind: PageKind,
        /// Page size of the file the page belongs to.
        pub page_size: u32,
        /// Page number the image was written for.
        pub page_no: PageId,
        /// Per-file salt.
        pub salt: u64,
        /// Stored checksum.
        pub crc32: u32,
    }

    impl PageHeader {
        /// Header for a new page with an unset checksum.
        pub fn new(page_no: PageId, kind: PageKind, page_size: u32, salt: u64) -> Result<Self> {
            if (page_size as usize) < PAGE_HDR_LEN {
                return Err(TreeError::Invalid("page size smaller than header"));
            }
            Ok(Self {
                format_version: PAGE_FORMAT_VERSION,
                kind,
                page_size,
                page_no,
                salt,
                crc32: 0,
            })
        }

        /// Writes the header into the first bytes of `dst`.
        pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
            if dst.len() < PAGE_HDR_LEN {
                return Err(TreeError::Invalid("page header buffer too small"));
            }
            let hdr = &mut dst[..PAGE_HDR_LEN];
            hdr[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
            hdr[header::FORMAT_VERSION].copy_from_slice(&self.format_version.to_be_bytes());
            hdr[header::PAGE_KIND] = self.kind.as_u8();
            hdr[header::RESERVED] = 0;
            hdr[header::PAGE_SIZE].copy_from_slice(&self.page_size.to_be_bytes());
            hdr[header::PAGE_NO].copy_from_slice(&self.page_no.0.to_be_bytes());
            hdr[header::SALT].copy_from_slice(&self.salt.to_be_bytes());
            hdr[header::CRC32].copy_from_slice(&self.crc32.to_be_bytes());
            Ok(())
        }

        /// Parses and validates the header at the start of `src`.
        pub fn decode(src: &[u8]) -> Result<Self> {
            if src.len() < PAGE_HDR_LEN {
                return Err(TreeError::Corruption("page header truncated"));
            }
            let hdr = &src[..PAGE_HDR_LEN];
            if hdr[header::MAGIC] != PAGE_MAGIC {
                return Err(TreeError::Corruption("invalid page magic"));
            }
            let format_version = u16::from_be_bytes(read_array(&hdr[header::FORMAT_VERSION])?);
            if format_version != PAGE_FORMAT_VERSION {
                return Err(TreeError::Corruption("unsupported page format version"));
            }
            if hdr[header::RESERVED] != 0 {
                return Err(TreeError::Corruption("page header reserved byte not zero"));
            }
            let kind = PageKind::try_from(hdr[header::PAGE_KIND])?;
            let page_size = u32::from_be_bytes(read_array(&hdr[header::PAGE_SIZE])?);
            if (page_size as usize) < PAGE_HDR_LEN {
                return Err(TreeError::Corruption("page size smaller than header"));
            }
            let page_no = PageId(u64::from_be_bytes(read_array(&hdr[header::PAGE_NO])?));
            let salt = u64::from_be_bytes(read_array(&hdr[header::SALT])?);
            let crc32 = u32::from_be_bytes(read_array(&hdr[header::CRC32])?);
            Ok(Self {
                format_version,
                kind,
                page_size,
                page_no,
                salt,
                crc32,
            })
        }
    }

    /// Returns true when `buf` carries the page magic (i.e. was ever written).
    pub fn has_magic(buf: &[u8]) -> bool {
        buf.len() >= PAGE_HDR_LEN && buf[header::MAGIC] == PAGE_MAGIC
    }

    /// Reads the page kind byte without validating the rest of the header.
    pub fn peek_kind(buf: &[u8]) -> Option<PageKind> {
        if !has_magic(buf) {
            return None;
        }
        PageKind::try_from(buf[header::PAGE_KIND]).ok()
    }

    /// Validates that `page_size` is a power of two inside the supported range.
    pub fn validate_page_size(page_size: u32) -> Result<()> {
        if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(TreeError::Invalid(
                "page size must be a power of two between 4 KiB and 4 MiB",
            ));
        }
        Ok(())
    }

    pub(crate) fn read_array<const N: usize>(src: &[u8]) -> Result<[u8; N]> {
        src.try_into()
            .map_err(|_| TreeError::Corruption("field slice has wrong length"))
    }
}
