//! Tree storage: the generational B+tree and the layouts stored in it.

/// Generational B+tree implementation.
pub mod btree;

/// Key/value layout contract and stock layouts.
pub mod layout;

/// Entity token scan store built on the tree.
pub mod token_scan;

pub use btree::{GbTree, GbTreeBuilder, Seeker, TreeOptions, Writer};
pub use layout::{BytesLayout, Layout, LongLayout, TestLayout};
