use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLockReadGuard, RwLockWriteGuard};

use super::frame::{Frame, FrameKey};
use crate::primitives::io::{FileIo, FileSystem};
use crate::types::{
    checksum::{stamp_page_crc32, verify_page_crc32},
    page::{self, DEFAULT_PAGE_SIZE},
    PageId, Result, TreeError,
};

/// Minimum number of frames a cache keeps regardless of its byte budget.
pub const MIN_CACHE_FRAMES: usize = 16;

/// Identifier of a file mapped into a [`PageCache`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct FileId(pub u32);

/// Configuration options for the page cache.
#[derive(Clone, Debug)]
pub struct PageCacheOptions {
    /// Size of every page in bytes.
    pub page_size: u32,
    /// Memory budget for cached frames in bytes.
    pub cache_bytes: usize,
    /// Whether to verify page checksums when loading from disk.
    pub verify_checksums: bool,
}

impl Default for PageCacheOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_bytes: 64 * 1024 * 1024,
            verify_checksums: true,
        }
    }
}

/// Statistics tracking page cache operations.
#[derive(Default, Clone, Debug)]
pub struct PageCacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of page evictions from cache.
    pub evictions: u64,
    /// Number of dirty pages written back.
    pub dirty_writebacks: u64,
    /// Number of frames currently resident.
    pub resident: u64,
}

impl fmt::Display for PageCacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} evictions={} writebacks={} resident={}",
            self.hits, self.misses, self.evictions, self.dirty_writebacks, self.resident
        )
    }
}

/// Fixed-size page cache shared by every file mapped through it.
#[derive(Clone)]
pub struct PageCache {
    shared: Arc<CacheShared>,
}

struct CacheShared {
    fs: Arc<dyn FileSystem>,
    page_size: u32,
    capacity: usize,
    verify_checksums: bool,
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    writebacks: AtomicU64,
}

struct CacheState {
    frames: LruCache<FrameKey, Arc<Frame>>,
    files: HashMap<FileId, MappedFile>,
    next_file: u32,
    closed: bool,
}

struct MappedFile {
    io: Arc<dyn FileIo>,
    path: PathBuf,
    mappings: usize,
}

/// A file mapped into the page cache.
pub struct PagedFile {
    shared: Arc<CacheShared>,
    file: FileId,
    io: Arc<dyn FileIo>,
    path: PathBuf,
}

/// A pinned page. The frame stays resident until the pin is dropped.
pub struct PinnedPage {
    /// Page identifier.
    pub id: PageId,
    frame: Arc<Frame>,
}

impl PageCache {
    /// Creates a page cache over `fs`.
    pub fn create(fs: Arc<dyn FileSystem>, options: PageCacheOptions) -> Result<Self> {
        page::validate_page_size(options.page_size)?;
        let capacity = (options.cache_bytes / options.page_size as usize).max(MIN_CACHE_FRAMES);
        Ok(Self {
            shared: Arc::new(CacheShared {
                fs,
                page_size: options.page_size,
                capacity,
                verify_checksums: options.verify_checksums,
                state: Mutex::new(CacheState {
                    frames: LruCache::unbounded(),
                    files: HashMap::new(),
                    next_file: 1,
                    closed: false,
                }),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
                writebacks: AtomicU64::new(0),
            }),
        })
    }

    /// Returns the page size in bytes.
    pub fn page_size(&self) -> u32 {
        self.shared.page_size
    }

    /// Returns the number of frames the cache keeps before evicting.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Returns true when `path` exists on the underlying filesystem.
    pub fn file_exists(&self, path: &Path) -> bool {
        self.shared.fs.exists(path)
    }

    /// Maps `path` into the cache, creating the file when `create` is set.
    pub fn map(&self, path: impl AsRef<Path>, create: bool) -> Result<PagedFile> {
        let path = path.as_ref().to_path_buf();
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(TreeError::Invalid("page cache closed"));
        }
        if let Some((id, mapped)) = state.files.iter_mut().find(|(_, f)| f.path == path) {
            mapped.mappings += 1;
            return Ok(PagedFile {
                shared: Arc::clone(&self.shared),
                file: *id,
                io: Arc::clone(&mapped.io),
                path,
            });
        }
        let io = self.shared.fs.open(&path, create)?;
        let id = FileId(state.next_file);
        state.next_file += 1;
        state.files.insert(
            id,
            MappedFile {
                io: Arc::clone(&io),
                path: path.clone(),
                mappings: 1,
            },
        );
        Ok(PagedFile {
            shared: Arc::clone(&self.shared),
            file: id,
            io,
            path,
        })
    }

    /// Returns a snapshot of cache statistics.
    pub fn stats(&self) -> PageCacheStats {
        let resident = self.shared.state.lock().frames.len() as u64;
        PageCacheStats {
            hits: self.shared.hits.load(Ordering::Relaxed),
            misses: self.shared.misses.load(Ordering::Relaxed),
            evictions: self.shared.evictions.load(Ordering::Relaxed),
            dirty_writebacks: self.shared.writebacks.load(Ordering::Relaxed),
            resident,
        }
    }

    /// Flushes every mapped file and refuses further mappings.
    pub fn close(&self) -> Result<()> {
        let files: Vec<(FileId, Arc<dyn FileIo>)> = {
            let mut state = self.shared.state.lock();
            state.closed = true;
            state
                .files
                .iter()
                .map(|(id, f)| (*id, Arc::clone(&f.io)))
                .collect()
        };
        for (id, io) in files {
            self.shared.flush_file(id, io.as_ref())?;
        }
        Ok(())
    }
}

impl CacheShared {
    fn pin(&self, file: FileId, io: &dyn FileIo, id: PageId) -> Result<Arc<Frame>> {
        let key = FrameKey { file, page: id };
        let mut state = self.state.lock();
        if let Some(frame) = state.frames.get(&key) {
            frame.pin();
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(frame));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        if state.frames.len() >= self.capacity {
            self.evict_one(&mut state)?;
        }
        let buf = self.load_page(io, id)?;
        let frame = Arc::new(Frame::new(buf));
        frame.pin();
        state.frames.put(key, Arc::clone(&frame));
        Ok(frame)
    }

    fn pin_blank(&self, file: FileId, id: PageId) -> Result<Arc<Frame>> {
        let key = FrameKey { file, page: id };
        let mut state = self.state.lock();
        if let Some(frame) = state.frames.get(&key) {
            frame.pin();
            let frame = Arc::clone(frame);
            drop(state);
            frame.buf.write().fill(0);
            return Ok(frame);
        }
        if state.frames.len() >= self.capacity {
            self.evict_one(&mut state)?;
        }
        let frame = Arc::new(Frame::new(vec![0u8; self.page_size as usize].into_boxed_slice()));
        frame.pin();
        state.frames.put(key, Arc::clone(&frame));
        Ok(frame)
    }

    fn load_page(&self, io: &dyn FileIo, id: PageId) -> Result<Box<[u8]>> {
        let page_size = self.page_size as usize;
        let mut buf = vec![0u8; page_size].into_boxed_slice();
        let offset = id
            .0
            .checked_mul(page_size as u64)
            .ok_or(TreeError::Invalid("page offset overflow"))?;
        if offset + page_size as u64 <= io.len()? {
            io.read_at(offset, &mut buf)?;
            if self.verify_checksums && page::has_magic(&buf) && !verify_page_crc32(id.0, &buf) {
                return Err(TreeError::Corruption("page checksum mismatch"));
            }
        }
        Ok(buf)
    }

    fn evict_one(&self, state: &mut CacheState) -> Result<()> {
        let victim = state
            .frames
            .iter()
            .rev()
            .find(|(_, frame)| !frame.is_pinned())
            .map(|(key, _)| *key);
        // Every frame pinned: grow past capacity rather than fail the caller.
        let Some(key) = victim else {
            return Ok(());
        };
        let Some(frame) = state.frames.pop(&key) else {
            return Ok(());
        };
        self.evictions.fetch_add(1, Ordering::Relaxed);
        if frame.is_dirty() {
            let io = state
                .files
                .get(&key.file)
                .map(|f| Arc::clone(&f.io))
                .ok_or(TreeError::Invalid("evicting frame of unmapped file"))?;
            let result = self.write_back(io.as_ref(), key.page, &frame);
            if result.is_err() {
                state.frames.put(key, frame);
            }
            result?;
        }
        Ok(())
    }

    fn write_back(&self, io: &dyn FileIo, id: PageId, frame: &Frame) -> Result<()> {
        frame.dirty.store(false, Ordering::Release);
        let mut image = frame.buf.read().to_vec();
        if page::has_magic(&image) {
            stamp_page_crc32(id.0, &mut image);
        }
        let offset = id.0 * self.page_size as u64;
        if let Err(err) = io.write_at(offset, &image) {
            frame.dirty.store(true, Ordering::Release);
            return Err(err);
        }
        self.writebacks.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(target: "gbtree::pager", page = id.0, "wrote back dirty page");
        Ok(())
    }

    fn flush_file(&self, file: FileId, io: &dyn FileIo) -> Result<()> {
        let dirty: Vec<PinnedPage> = {
            let state = self.state.lock();
            state
                .frames
                .iter()
                .filter(|(key, frame)| key.file == file && frame.is_dirty())
                .map(|(key, frame)| {
                    frame.pin();
                    PinnedPage {
                        id: key.page,
                        frame: Arc::clone(frame),
                    }
                })
                .collect()
        };
        let count = dirty.len();
        for pinned in &dirty {
            self.write_back(io, pinned.id, &pinned.frame)?;
        }
        drop(dirty);
        io.sync_all()?;
        tracing::debug!(target: "gbtree::pager", pages = count, "flushed mapped file");
        Ok(())
    }
}

impl PagedFile {
    /// Returns the page size in bytes.
    pub fn page_size(&self) -> usize {
        self.shared.page_size as usize
    }

    /// Returns the path this file was mapped from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pins `id`, loading it from disk on a miss. Pages past the end of the file read as zeroes.
    pub fn pin(&self, id: PageId) -> Result<PinnedPage> {
        let frame = self.shared.pin(self.file, self.io.as_ref(), id)?;
        Ok(PinnedPage { id, frame })
    }

    /// Pins `id` with zeroed contents without reading it from disk, so a page
    /// whose stored image is damaged can still be rewritten whole.
    pub fn pin_blank(&self, id: PageId) -> Result<PinnedPage> {
        let frame = self.shared.pin_blank(self.file, id)?;
        Ok(PinnedPage { id, frame })
    }

    /// Writes every dirty page of this file and syncs it to stable storage.
    pub fn flush(&self) -> Result<()> {
        self.shared.flush_file(self.file, self.io.as_ref())
    }

    /// Number of whole pages currently stored on disk.
    pub fn pages_on_disk(&self) -> Result<u64> {
        Ok(self.io.len()? / self.shared.page_size as u64)
    }
}

impl Drop for PagedFile {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        let remove = match state.files.get_mut(&self.file) {
            Some(mapped) => {
                mapped.mappings -= 1;
                mapped.mappings == 0
            }
            None => false,
        };
        if remove {
            // Unflushed frames are discarded: only flush() makes pages durable.
            state.files.remove(&self.file);
            let keys: Vec<FrameKey> = state
                .frames
                .iter()
                .filter(|(key, _)| key.file == self.file)
                .map(|(key, _)| *key)
                .collect();
            for key in keys {
                state.frames.pop(&key);
            }
        }
    }
}

impl PinnedPage {
    /// Returns the page bytes under a shared latch.
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.frame.buf.read()
    }

    /// Returns the page bytes under an exclusive latch and marks the page dirty.
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        let guard = self.frame.buf.write();
        self.frame.dirty.store(true, Ordering::Release);
        guard
    }
}

impl Drop for PinnedPage {
    fn drop(&mut self) {
        self.frame.unpin();
    }
}
