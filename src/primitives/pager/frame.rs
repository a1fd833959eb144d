use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::RwLock;

use crate::primitives::pager::FileId;
use crate::types::PageId;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub(crate) struct FrameKey {
    pub(crate) file: FileId,
    pub(crate) page: PageId,
}

pub(crate) struct Frame {
    pub(crate) buf: RwLock<Box<[u8]>>,
    pub(crate) dirty: AtomicBool,
    pins: AtomicU32,
}

impl Frame {
    pub(crate) fn new(buf: Box<[u8]>) -> Self {
        Self {
            buf: RwLock::new(buf),
            dirty: AtomicBool::new(false),
            pins: AtomicU32::new(0),
        }
    }

    pub(crate) fn pin(&self) {
        self.pins.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unpin(&self) {
        self.pins.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}
