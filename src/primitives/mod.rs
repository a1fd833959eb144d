//! Low-level primitives for building the tree.
//!
//! Includes I/O operations, concurrency controls and the page cache.

/// Concurrency primitives and synchronization.
///
/// Exclusive writer permit and shared reader registry.
pub mod concurrency;

/// I/O abstractions and utilities.
///
/// Interfaces for reading/writing data and file operations.
pub mod io;

/// Page cache over fixed-size pages.
///
/// Manages frames, pinning, eviction and write-back.
pub mod pager;
