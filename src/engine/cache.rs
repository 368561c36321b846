// Chunked on-disk store for one item: a sparse memory-mapped file plus a bitvec of landed chunks.

use std::fs::{self, OpenOptions};
use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use bitvec::prelude::*;
use bytes::Bytes;
use memmap2::MmapMut;
use parking_lot::{Mutex, RwLock};

/// How an item of `content_length` bytes splits into fixed-size chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    pub content_length: u64,
    pub chunk_size: u64,
}

impl ChunkLayout {
    pub fn total_chunks(&self) -> usize {
        self.content_length.div_ceil(self.chunk_size) as usize
    }

    pub fn chunk_of(&self, offset: u64) -> usize {
        (offset / self.chunk_size) as usize
    }

    /// Byte span `[start, end)` covered by `chunk`. The last one may be short.
    pub fn span(&self, chunk: usize) -> Range<u64> {
        let start = chunk as u64 * self.chunk_size;
        start..(start + self.chunk_size).min(self.content_length)
    }
}

struct Landed {
    chunks: BitVec,
    bytes: u64,
}

pub struct DiskCache {
    layout: ChunkLayout,
    mmap: RwLock<MmapMut>,
    landed: Mutex<Landed>,
    path: PathBuf,
}

impl DiskCache {
    /// Create `<cache_dir>/<key>.cache`, sized to `content_length` and empty.
    pub fn new(cache_dir: &Path, key: &str, content_length: u64, chunk_size: u64) -> Result<Self> {
        if content_length == 0 || chunk_size == 0 {
            bail!("cache needs a non-zero length and chunk size");
        }
        fs::create_dir_all(cache_dir)
            .with_context(|| format!("cannot create {}", cache_dir.display()))?;

        let path = cache_dir.join(format!("{}.cache", key));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("cannot open {}", path.display()))?;
        file.set_len(content_length)?;

        // SAFETY: the file was just created and truncated; nothing else maps it.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        let layout = ChunkLayout {
            content_length,
            chunk_size,
        };
        Ok(Self {
            landed: Mutex::new(Landed {
                chunks: bitvec![0; layout.total_chunks()],
                bytes: 0,
            }),
            layout,
            mmap: RwLock::new(mmap),
            path,
        })
    }

    pub fn layout(&self) -> ChunkLayout {
        self.layout
    }

    /// Store the bytes of `chunk`. `data` must cover the chunk exactly.
    pub fn put_chunk(&self, chunk: usize, data: &[u8]) -> Result<()> {
        if chunk >= self.layout.total_chunks() {
            bail!(
                "chunk {} out of range ({} chunks)",
                chunk,
                self.layout.total_chunks()
            );
        }
        let span = self.layout.span(chunk);
        if data.len() as u64 != span.end - span.start {
            bail!(
                "chunk {} is {} bytes, got {}",
                chunk,
                span.end - span.start,
                data.len()
            );
        }

        self.mmap.write()[span.start as usize..span.end as usize].copy_from_slice(data);

        let mut landed = self.landed.lock();
        if !landed.chunks.replace(chunk, true) {
            landed.bytes += data.len() as u64;
        }
        Ok(())
    }

    /// Bytes `[start, end)`, or `None` unless every chunk they touch has landed.
    pub fn read_range(&self, start: u64, end: u64) -> Option<Bytes> {
        if start >= end || end > self.layout.content_length {
            return None;
        }
        let chunks = self.layout.chunk_of(start)..=self.layout.chunk_of(end - 1);
        if !self.landed.lock().chunks[chunks].all() {
            return None;
        }
        let mmap = self.mmap.read();
        Some(Bytes::copy_from_slice(&mmap[start as usize..end as usize]))
    }

    pub fn has_chunk(&self, chunk: usize) -> bool {
        self.landed
            .lock()
            .chunks
            .get(chunk)
            .map(|bit| *bit)
            .unwrap_or(false)
    }

    pub fn chunk_of(&self, offset: u64) -> usize {
        self.layout.chunk_of(offset)
    }

    pub fn chunk_start(&self, chunk: usize) -> u64 {
        self.layout.span(chunk).start
    }

    pub fn chunk_len(&self, chunk: usize) -> usize {
        let span = self.layout.span(chunk);
        (span.end - span.start) as usize
    }

    pub fn total_chunks(&self) -> usize {
        self.layout.total_chunks()
    }

    /// Bytes landed so far. Never decreases.
    pub fn cached_bytes(&self) -> u64 {
        self.landed.lock().bytes
    }

    pub fn content_length(&self) -> u64 {
        self.layout.content_length
    }

    pub fn chunk_size(&self) -> u64 {
        self.layout.chunk_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DiskCache {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
