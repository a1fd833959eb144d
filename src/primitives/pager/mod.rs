#![forbid(unsafe_code)]

mod frame;
mod pager;

pub use pager::{
    FileId, PageCache, PageCacheOptions, PageCacheStats, PagedFile, PinnedPage, MIN_CACHE_FRAMES,
};
