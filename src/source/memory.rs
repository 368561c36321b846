// In-memory Content Source. Bytes become readable only as the owner advances each item's frontier.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::traits::{Content, ContentItem, ContentSource, ItemCursor};

struct ItemInner {
    path: String,
    data: Bytes,
    frontier: watch::Sender<u64>,
    downloading: AtomicBool,
    open_cursors: AtomicUsize,
}

/// An item whose bytes arrive when the test says so.
#[derive(Clone)]
pub struct MemoryItem {
    inner: Arc<ItemInner>,
}

impl MemoryItem {
    pub fn new(path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let (frontier, _) = watch::channel(0);
        Self {
            inner: Arc::new(ItemInner {
                path: path.into(),
                data: data.into(),
                frontier,
                downloading: AtomicBool::new(false),
                open_cursors: AtomicUsize::new(0),
            }),
        }
    }

    /// An item that is already fully downloaded.
    pub fn complete(path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let item = Self::new(path, data);
        item.deliver_all();
        item
    }

    /// Make the first `upto` bytes readable. The frontier never moves backwards.
    pub fn deliver(&self, upto: u64) {
        let upto = upto.min(self.inner.data.len() as u64);
        self.inner.frontier.send_if_modified(|frontier| {
            if upto > *frontier {
                *frontier = upto;
                true
            } else {
                false
            }
        });
    }

    pub fn deliver_all(&self) {
        self.deliver(self.inner.data.len() as u64);
    }

    pub fn frontier(&self) -> u64 {
        *self.inner.frontier.borrow()
    }

    /// Whether `download()` has been requested.
    pub fn is_downloading(&self) -> bool {
        self.inner.downloading.load(Ordering::SeqCst)
    }

    /// Cursors currently open against this item.
    pub fn open_cursors(&self) -> usize {
        self.inner.open_cursors.load(Ordering::SeqCst)
    }

    pub fn data(&self) -> &Bytes {
        &self.inner.data
    }
}

impl ContentItem for MemoryItem {
    fn path(&self) -> &str {
        &self.inner.path
    }

    fn length(&self) -> u64 {
        self.inner.data.len() as u64
    }

    fn bytes_completed(&self) -> u64 {
        self.frontier()
    }

    fn download(&self) {
        self.inner.downloading.store(true, Ordering::SeqCst);
    }

    fn open_cursor(&self) -> Box<dyn ItemCursor> {
        self.inner.open_cursors.fetch_add(1, Ordering::SeqCst);
        Box::new(MemoryCursor {
            inner: Arc::clone(&self.inner),
            frontier: self.inner.frontier.subscribe(),
            pos: 0,
        })
    }
}

struct MemoryCursor {
    inner: Arc<ItemInner>,
    frontier: watch::Receiver<u64>,
    pos: u64,
}

#[async_trait]
impl ItemCursor for MemoryCursor {
    fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    fn position(&self) -> u64 {
        self.pos
    }

    async fn read(&mut self, max: usize) -> Result<Bytes> {
        let len = self.inner.data.len() as u64;
        if self.pos >= len || max == 0 {
            return Ok(Bytes::new());
        }

        let pos = self.pos;
        let available = *self
            .frontier
            .wait_for(|&frontier| frontier > pos)
            .await
            .map_err(|_| anyhow!("item {} was dropped", self.inner.path))?;

        let end = available.min(pos + max as u64);
        self.pos = end;
        Ok(self.inner.data.slice(pos as usize..end as usize))
    }
}

impl Drop for MemoryCursor {
    fn drop(&mut self) {
        self.inner.open_cursors.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
struct Entry {
    name: String,
    items: Vec<MemoryItem>,
    delay: Duration,
    stalled: bool,
}

#[derive(Default)]
struct Handles {
    live: usize,
    peak: usize,
    resolved: usize,
}

/// Content Source serving registered in-memory content sets.
#[derive(Default)]
pub struct MemorySource {
    catalog: Mutex<HashMap<String, Entry>>,
    handles: Arc<Mutex<Handles>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a content set under `identifier`.
    pub fn insert(&self, identifier: impl Into<String>, name: impl Into<String>, items: Vec<MemoryItem>) {
        self.insert_delayed(identifier, name, items, Duration::ZERO);
    }

    /// Register a content set whose metadata takes `delay` to arrive.
    pub fn insert_delayed(
        &self,
        identifier: impl Into<String>,
        name: impl Into<String>,
        items: Vec<MemoryItem>,
        delay: Duration,
    ) {
        self.catalog.lock().insert(
            identifier.into(),
            Entry {
                name: name.into(),
                items,
                delay,
                stalled: false,
            },
        );
    }

    /// Register an identifier whose metadata never arrives.
    pub fn insert_stalled(&self, identifier: impl Into<String>) {
        self.catalog.lock().insert(
            identifier.into(),
            Entry {
                name: String::new(),
                items: Vec::new(),
                delay: Duration::ZERO,
                stalled: true,
            },
        );
    }

    /// Handles resolved and not yet abandoned.
    pub fn live_handles(&self) -> usize {
        self.handles.lock().live
    }

    /// Highest number of simultaneously live handles ever observed.
    pub fn peak_live_handles(&self) -> usize {
        self.handles.lock().peak
    }

    /// Total successful resolutions.
    pub fn resolved_count(&self) -> usize {
        self.handles.lock().resolved
    }
}

#[async_trait]
impl ContentSource for MemorySource {
    async fn resolve(&self, identifier: &str) -> Result<Arc<dyn Content>> {
        let entry = self
            .catalog
            .lock()
            .get(identifier)
            .cloned()
            .ok_or_else(|| anyhow!("unknown identifier"))?;

        if entry.stalled {
            std::future::pending::<()>().await;
        }
        if !entry.delay.is_zero() {
            tokio::time::sleep(entry.delay).await;
        }

        {
            let mut handles = self.handles.lock();
            handles.live += 1;
            handles.resolved += 1;
            handles.peak = handles.peak.max(handles.live);
        }

        Ok(Arc::new(MemoryContent {
            identifier: identifier.to_string(),
            name: entry.name,
            items: entry.items,
            abandoned: AtomicBool::new(false),
            handles: Arc::clone(&self.handles),
        }))
    }
}

struct MemoryContent {
    identifier: String,
    name: String,
    items: Vec<MemoryItem>,
    abandoned: AtomicBool,
    handles: Arc<Mutex<Handles>>,
}

impl Content for MemoryContent {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn items(&self) -> Vec<Arc<dyn ContentItem>> {
        self.items
            .iter()
            .map(|item| Arc::new(item.clone()) as Arc<dyn ContentItem>)
            .collect()
    }

    fn abandon(&self) {
        if !self.abandoned.swap(true, Ordering::SeqCst) {
            self.handles.lock().live -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::traits::read_to_end;

    #[tokio::test]
    async fn test_cursor_waits_for_frontier() {
        let item = MemoryItem::new("movie.mp4", (0..100u8).collect::<Vec<_>>());
        let mut cursor = item.open_cursor();
        cursor.seek(40);

        let reader = tokio::spawn(async move { cursor.read(10).await.unwrap() });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        item.deliver(45);
        let got = reader.await.unwrap();
        assert_eq!(&got[..], &[40, 41, 42, 43, 44]);
    }

    #[tokio::test]
    async fn test_cursor_eof_and_counting() {
        let item = MemoryItem::complete("a.srt", b"hello".to_vec());
        {
            let mut cursor = item.open_cursor();
            assert_eq!(item.open_cursors(), 1);
            assert_eq!(read_to_end(cursor.as_mut(), 2).await.unwrap(), b"hello");
            assert!(cursor.read(4).await.unwrap().is_empty());
        }
        assert_eq!(item.open_cursors(), 0);
    }

    #[tokio::test]
    async fn test_abandon_is_idempotent() {
        let source = MemorySource::new();
        source.insert("id", "set", vec![MemoryItem::complete("a.mp4", vec![1u8])]);
        let content = source.resolve("id").await.unwrap();
        assert_eq!(source.live_handles(), 1);
        content.abandon();
        content.abandon();
        assert_eq!(source.live_handles(), 0);
        assert!(source.resolve("missing").await.is_err());
    }
}
