// HTTP-backed Content Source: a direct file URL, or a `.json` manifest of named files
// ({"name": ..., "files": [{"path": ..., "url": ...}]}) with URLs relative to the manifest.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Url};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::http_source::HttpOrigin;
use super::traits::{Content, ContentItem, ContentSource, ItemCursor};
use crate::config::{SourceConfig, TAIL_PREFETCH_CHUNKS};
use crate::engine::cache::DiskCache;
use crate::engine::downloader::Downloader;

#[derive(Debug, Deserialize)]
struct Manifest {
    name: Option<String>,
    files: Vec<ManifestFile>,
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    path: String,
    url: String,
}

pub struct HttpContentSource {
    client: Client,
    config: SourceConfig,
}

impl HttpContentSource {
    pub fn new(config: SourceConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.cache_dir).with_context(|| {
            format!("cannot create cache dir {}", config.cache_dir.display())
        })?;
        let client = Client::builder().build()?;
        Ok(Self { client, config })
    }

    async fn fetch_manifest(&self, url: &Url) -> Result<(String, Vec<(String, Url)>)> {
        let resp = self.client.get(url.clone()).send().await?;
        if !resp.status().is_success() {
            bail!("manifest fetch failed: HTTP {}", resp.status().as_u16());
        }
        let manifest: Manifest = resp.json().await.context("malformed manifest")?;

        let mut entries = Vec::with_capacity(manifest.files.len());
        for file in manifest.files {
            let file_url = url
                .join(&file.url)
                .with_context(|| format!("bad url for manifest entry {}", file.path))?;
            entries.push((file.path, file_url));
        }
        let name = manifest
            .name
            .unwrap_or_else(|| last_segment(url).unwrap_or_else(|| url.to_string()));
        Ok((name, entries))
    }
}

fn last_segment(url: &Url) -> Option<String> {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl ContentSource for HttpContentSource {
    async fn resolve(&self, identifier: &str) -> Result<Arc<dyn Content>> {
        let url = Url::parse(identifier).context("identifier is not a valid URL")?;
        match url.scheme() {
            "http" | "https" => {}
            other => bail!("unsupported identifier scheme '{}': only http(s) URLs can be fetched", other),
        }

        let (name, entries) = if url.path().to_ascii_lowercase().ends_with(".json") {
            self.fetch_manifest(&url).await?
        } else {
            let name = last_segment(&url).ok_or_else(|| anyhow!("URL names no file"))?;
            (name.clone(), vec![(name, url.clone())])
        };

        let key = Uuid::new_v4().simple().to_string();
        let dir = self.config.cache_dir.join(&key);

        let mut items = Vec::with_capacity(entries.len());
        for (index, (path, file_url)) in entries.into_iter().enumerate() {
            let origin = Arc::new(HttpOrigin::new(self.client.clone(), file_url));
            let info = origin
                .inspect()
                .await
                .with_context(|| format!("cannot inspect {}", path))?;
            if info.content_length == 0 {
                warn!("skipping empty item {}", path);
                continue;
            }

            let cache = Arc::new(DiskCache::new(
                &dir,
                &index.to_string(),
                info.content_length,
                self.config.chunk_size,
            )?);
            let downloader = Arc::new(Downloader::new(
                origin,
                cache,
                self.config.max_concurrency,
                self.config.max_retries,
            ));
            debug!(
                "item {} inspected: {} bytes, type={}",
                path, info.content_length, info.content_type
            );
            items.push(Arc::new(HttpItem { path, downloader }));
        }

        if items.is_empty() {
            bail!("{} contains no downloadable items", name);
        }

        info!("resolved content {} ({} items)", name, items.len());
        Ok(Arc::new(HttpContent {
            identifier: identifier.to_string(),
            name,
            dir,
            items,
            abandoned: AtomicBool::new(false),
        }))
    }
}

struct HttpContent {
    identifier: String,
    name: String,
    dir: PathBuf,
    items: Vec<Arc<HttpItem>>,
    abandoned: AtomicBool,
}

impl Content for HttpContent {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn items(&self) -> Vec<Arc<dyn ContentItem>> {
        self.items
            .iter()
            .map(|item| Arc::clone(item) as Arc<dyn ContentItem>)
            .collect()
    }

    fn abandon(&self) {
        if self.abandoned.swap(true, Ordering::SeqCst) {
            return;
        }
        for item in &self.items {
            item.downloader.shutdown();
        }
        debug!("content {} abandoned", self.name);
    }
}

impl Drop for HttpContent {
    fn drop(&mut self) {
        self.abandon();
        // Cache files go away with their items; the directory only once empty.
        let _ = std::fs::remove_dir(&self.dir);
    }
}

struct HttpItem {
    path: String,
    downloader: Arc<Downloader>,
}

impl ContentItem for HttpItem {
    fn path(&self) -> &str {
        &self.path
    }

    fn length(&self) -> u64 {
        self.downloader.cache().content_length()
    }

    fn bytes_completed(&self) -> u64 {
        self.downloader.cache().cached_bytes()
    }

    fn download(&self) {
        self.downloader.fill_all(TAIL_PREFETCH_CHUNKS);
    }

    fn open_cursor(&self) -> Box<dyn ItemCursor> {
        Box::new(HttpCursor {
            downloader: Arc::clone(&self.downloader),
            pos: 0,
        })
    }
}

struct HttpCursor {
    downloader: Arc<Downloader>,
    pos: u64,
}

#[async_trait]
impl ItemCursor for HttpCursor {
    fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    fn position(&self) -> u64 {
        self.pos
    }

    async fn read(&mut self, max: usize) -> Result<Bytes> {
        let cache = Arc::clone(self.downloader.cache());
        if self.pos >= cache.content_length() || max == 0 {
            return Ok(Bytes::new());
        }

        let chunk = cache.chunk_of(self.pos);
        if !self.downloader.wait_for_chunk(chunk).await {
            bail!("chunk {} could not be fetched", chunk);
        }

        let chunk_end = cache.chunk_start(chunk) + cache.chunk_len(chunk) as u64;
        let end = chunk_end.min(self.pos + max as u64);
        let data = cache
            .read_range(self.pos, end)
            .ok_or_else(|| anyhow!("cache read failed for range [{}, {})", self.pos, end))?;
        self.pos = end;
        Ok(data)
    }
}
