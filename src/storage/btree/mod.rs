#![forbid(unsafe_code)]

//! Generational B+tree over a page cache.
//!
//! One writer mutates the tree while any number of seekers read it without
//! blocking. Pages written since the last checkpoint are edited in place;
//! older pages are replaced by new versions and keep a successor link so
//! seekers holding them can catch up. Checkpoints make the current root
//! durable; after a crash the tree reopens at its last checkpoint and
//! reclaims whatever was allocated afterwards.

/// Free page allocator and its on-disk trunk chain.
pub mod freelist;
mod generation;
/// Double-slot tree state pages.
pub mod meta;
/// Node page format and owned node edits.
pub mod page;
mod recovery;
mod seeker;
mod stats;
mod tree;
mod verify;
mod writer;

pub use generation::GenerationClock;
pub use page::{Geometry, NodeKind, PageState};
pub use recovery::RecoveryOutcome;
pub use seeker::{Entries, Seeker};
pub use stats::{TreeStats, TreeStatsSnapshot};
pub use tree::{GbTree, GbTreeBuilder, RootRef, TreeOptions, MAX_TREE_HEIGHT};
pub use verify::ConsistencyReport;
pub use writer::Writer;
