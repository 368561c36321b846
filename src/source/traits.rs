use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Resolves an identifier into a progressively fetched set of named items.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Resolve `identifier` and return its content set once metadata is known.
    ///
    /// May wait indefinitely for metadata; callers bound it with a timeout.
    async fn resolve(&self, identifier: &str) -> Result<Arc<dyn Content>>;
}

/// An in-progress or completed acquisition.
pub trait Content: Send + Sync {
    /// The identifier this content was resolved from.
    fn identifier(&self) -> &str;

    /// Display name of the whole set.
    fn name(&self) -> &str;

    /// Sub-items in enumeration order.
    fn items(&self) -> Vec<Arc<dyn ContentItem>>;

    /// Stop all background fetching. Idempotent.
    fn abandon(&self);
}

/// One named byte sequence inside a content set.
pub trait ContentItem: Send + Sync {
    fn path(&self) -> &str;

    /// Total length in bytes.
    fn length(&self) -> u64;

    /// Bytes fetched so far. Never decreases.
    fn bytes_completed(&self) -> u64;

    /// Begin fetching the whole item in the background. Idempotent.
    fn download(&self);

    /// Open an independent read position at offset 0.
    fn open_cursor(&self) -> Box<dyn ItemCursor>;
}

/// Independent read position into an item. Dropping it closes it.
#[async_trait]
pub trait ItemCursor: Send {
    fn seek(&mut self, pos: u64);

    fn position(&self) -> u64;

    /// Read up to `max` bytes at the current position and advance past them.
    ///
    /// Waits for bytes that are not downloaded yet. An empty buffer means the
    /// cursor is at the end of the item.
    async fn read(&mut self, max: usize) -> Result<Bytes>;
}

/// A byte-addressable origin that can be fetched in ranges.
#[async_trait]
pub trait RangeSource: Send + Sync {
    /// Fetch the inclusive byte range `[start, end]`.
    async fn fetch_range(&self, start: u64, end: u64) -> Result<Bytes>;
}

/// Read from `cursor` until the end of its item.
pub async fn read_to_end(cursor: &mut dyn ItemCursor, frame: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let chunk = cursor.read(frame).await?;
        if chunk.is_empty() {
            return Ok(out);
        }
        out.extend_from_slice(&chunk);
    }
}
