//! Generational B+tree: an ordered, crash-safe index over a page cache.
//!
//! A tree has one exclusive [`Writer`] and any number of concurrent
//! [`Seeker`]s. Checkpoints make the current state durable without a write
//! ahead log; reopening after a crash returns the last checkpointed tree.

#![warn(missing_docs)]

pub mod primitives;
pub mod storage;
pub mod types;

pub use primitives::pager::{PageCache, PageCacheOptions};
pub use storage::btree::{ConsistencyReport, GbTree, GbTreeBuilder, Seeker, TreeOptions, Writer};
pub use storage::layout::{BytesLayout, Layout, LongLayout, TestLayout};
pub use types::{Generation, PageId, Result, TreeError};
