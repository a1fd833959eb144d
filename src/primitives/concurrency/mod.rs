#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::types::{Generation, Result, TreeError};
use parking_lot::{Condvar, Mutex};

/// Single-writer, multiple-reader coordinator for one tree.
///
/// The writer side is an exclusive permit. The reader side never blocks: it
/// only registers the generation each reader captured so page reuse can be
/// held back while an older reader may still be walking freed pages.
#[derive(Clone, Default)]
pub struct TreeLatch {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<LatchState>,
    writer_released: Condvar,
}

#[derive(Default, Debug)]
struct LatchState {
    writer: bool,
    readers: u32,
    reader_generations: BTreeMap<Generation, u32>,
}

/// Snapshot of latch state for observability.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatchSnapshot {
    /// Number of registered readers.
    pub readers: u32,
    /// Whether the writer permit is held.
    pub writer: bool,
    /// Oldest generation captured by a live reader.
    pub oldest_reader: Option<Generation>,
}

/// Guard representing the held writer permit.
pub struct WriterGuard {
    inner: Arc<Inner>,
}

/// Guard representing a registered reader.
pub struct ReaderGuard {
    inner: Arc<Inner>,
    generation: Generation,
}

impl TreeLatch {
    /// Creates a latch with no holders.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the writer permit, blocking until the current holder releases it.
    pub fn acquire_writer(&self) -> WriterGuard {
        let mut state = self.inner.state.lock();
        while state.writer {
            self.inner.writer_released.wait(&mut state);
        }
        state.writer = true;
        WriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Acquires the writer permit or fails with [`TreeError::WriterBusy`].
    pub fn try_acquire_writer(&self) -> Result<WriterGuard> {
        let mut state = self.inner.state.lock();
        if state.writer {
            return Err(TreeError::WriterBusy);
        }
        state.writer = true;
        Ok(WriterGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Registers a reader that captured `generation`. Never blocks on the writer.
    pub fn acquire_reader(&self, generation: Generation) -> ReaderGuard {
        let mut state = self.inner.state.lock();
        state.readers = state.readers.saturating_add(1);
        *state.reader_generations.entry(generation).or_insert(0) += 1;
        ReaderGuard {
            inner: Arc::clone(&self.inner),
            generation,
        }
    }

    /// Returns the oldest generation captured by any live reader.
    pub fn oldest_reader(&self) -> Option<Generation> {
        let state = self.inner.state.lock();
        state.reader_generations.keys().next().copied()
    }

    /// Returns a snapshot of the current latch state.
    pub fn snapshot(&self) -> LatchSnapshot {
        let state = self.inner.state.lock();
        LatchSnapshot {
            readers: state.readers,
            writer: state.writer,
            oldest_reader: state.reader_generations.keys().next().copied(),
        }
    }
}

impl ReaderGuard {
    /// Generation captured when the reader registered.
    pub fn generation(&self) -> Generation {
        self.generation
    }
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.writer = false;
        drop(state);
        self.inner.writer_released.notify_one();
    }
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.readers = state.readers.saturating_sub(1);
        if let Some(count) = state.reader_generations.get_mut(&self.generation) {
            *count -= 1;
            if *count == 0 {
                state.reader_generations.remove(&self.generation);
            }
        }
    }
}
