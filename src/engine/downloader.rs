// Multi-connection chunk downloader. Fetches byte ranges from the origin in parallel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::cache::DiskCache;
use crate::source::traits::RangeSource;

/// Permits reserved for reads that a client is blocked on.
const URGENT_PERMITS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Priority {
    Urgent,
    Background,
}

#[derive(Debug, Default, Clone, Copy)]
struct InFlight {
    urgent: bool,
    background: bool,
}

impl InFlight {
    fn any(self) -> bool {
        self.urgent || self.background
    }

    fn set(&mut self, priority: Priority, value: bool) {
        match priority {
            Priority::Urgent => self.urgent = value,
            Priority::Background => self.background = value,
        }
    }
}

pub struct Downloader {
    source: Arc<dyn RangeSource>,
    cache: Arc<DiskCache>,
    urgent_semaphore: Arc<Semaphore>,
    background_semaphore: Arc<Semaphore>,
    in_flight: Mutex<Vec<InFlight>>,
    /// Signalled whenever any chunk fetch finishes, successfully or not.
    progress: Notify,
    shutdown_token: CancellationToken,
    filling: AtomicBool,
    max_retries: u32,
}

impl Downloader {
    pub fn new(
        source: Arc<dyn RangeSource>,
        cache: Arc<DiskCache>,
        max_concurrency: u32,
        max_retries: u32,
    ) -> Self {
        let total_chunks = cache.total_chunks();
        let background_permits = (max_concurrency as usize)
            .saturating_sub(URGENT_PERMITS)
            .max(1);
        Self {
            source,
            cache,
            urgent_semaphore: Arc::new(Semaphore::new(URGENT_PERMITS)),
            background_semaphore: Arc::new(Semaphore::new(background_permits)),
            in_flight: Mutex::new(vec![InFlight::default(); total_chunks]),
            progress: Notify::new(),
            shutdown_token: CancellationToken::new(),
            filling: AtomicBool::new(false),
            max_retries,
        }
    }

    pub fn cache(&self) -> &Arc<DiskCache> {
        &self.cache
    }

    /// Cancel all in-flight downloads and prevent new ones from starting.
    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
        self.progress.notify_waiters();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Idempotent: fetch every chunk at background priority.
    ///
    /// The head chunk goes first, then the last `tail_chunks` chunks, then the
    /// rest in order.
    pub fn fill_all(self: &Arc<Self>, tail_chunks: usize) {
        if self.filling.swap(true, Ordering::SeqCst) {
            return;
        }

        let total = self.cache.total_chunks();
        let tail_start = total.saturating_sub(tail_chunks).max(1);
        let order: Vec<usize> = std::iter::once(0)
            .chain(tail_start..total)
            .chain(1..tail_start)
            .filter(|&i| i < total)
            .collect();

        let this = Arc::clone(self);
        tokio::spawn(async move {
            for chunk_index in order {
                if this.shutdown_token.is_cancelled() {
                    return;
                }
                if this.cache.has_chunk(chunk_index) || this.in_flight.lock()[chunk_index].any() {
                    continue;
                }

                let permit = tokio::select! {
                    permit = Arc::clone(&this.background_semaphore).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                    _ = this.shutdown_token.cancelled() => return,
                };

                // An urgent read may have fetched it while we waited for the permit.
                if this.cache.has_chunk(chunk_index) {
                    continue;
                }
                {
                    let mut slots = this.in_flight.lock();
                    if slots[chunk_index].any() {
                        continue;
                    }
                    slots[chunk_index].set(Priority::Background, true);
                }
                this.spawn_fetch(chunk_index, Priority::Background, Some(permit));
            }
            debug!("background fill scheduled all {} chunks", this.cache.total_chunks());
        });
    }

    /// Idempotent: fetch a chunk at urgent priority unless it is cached or already being fetched.
    pub fn start_urgent(self: &Arc<Self>, chunk_index: usize) {
        if self.shutdown_token.is_cancelled() || chunk_index >= self.cache.total_chunks() {
            return;
        }
        if self.cache.has_chunk(chunk_index) {
            return;
        }
        {
            let mut slots = self.in_flight.lock();
            if slots[chunk_index].any() {
                return;
            }
            slots[chunk_index].set(Priority::Urgent, true);
        }
        self.spawn_fetch(chunk_index, Priority::Urgent, None);
    }

    fn spawn_fetch(
        self: &Arc<Self>,
        chunk_index: usize,
        priority: Priority,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = this.download_chunk_task(chunk_index, priority, permit).await;
            if let Err(e) = result {
                warn!("chunk {} {:?} fetch failed: {:#}", chunk_index, priority, e);
            }

            this.in_flight.lock()[chunk_index].set(priority, false);
            // Wake waiters regardless of success/failure.
            this.progress.notify_waiters();
        });
    }

    async fn download_chunk_task(
        &self,
        chunk_index: usize,
        priority: Priority,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<()> {
        let _permit = match permit {
            Some(permit) => permit,
            None => {
                let semaphore = match priority {
                    Priority::Urgent => Arc::clone(&self.urgent_semaphore),
                    Priority::Background => Arc::clone(&self.background_semaphore),
                };
                tokio::select! {
                    permit = semaphore.acquire_owned() => permit.map_err(|e| anyhow!("{}", e))?,
                    _ = self.shutdown_token.cancelled() => {
                        debug!("chunk {} cancelled while waiting for a permit", chunk_index);
                        return Ok(());
                    }
                }
            }
        };

        self.fetch_with_retry(chunk_index).await
    }

    async fn fetch_with_retry(&self, chunk_index: usize) -> Result<()> {
        let start = self.cache.chunk_start(chunk_index);
        let end = start + self.cache.chunk_len(chunk_index) as u64 - 1;

        for attempt in 0..=self.max_retries {
            if self.shutdown_token.is_cancelled() {
                debug!("chunk {} cancelled before fetch", chunk_index);
                return Ok(());
            }
            if self.cache.has_chunk(chunk_index) {
                return Ok(());
            }

            let fetched = tokio::select! {
                fetched = self.source.fetch_range(start, end) => fetched,
                _ = self.shutdown_token.cancelled() => return Ok(()),
            };

            match fetched {
                Ok(data) => {
                    self.cache.put_chunk(chunk_index, &data)?;
                    debug!("chunk {} downloaded ({} bytes)", chunk_index, data.len());
                    return Ok(());
                }
                Err(e) if attempt < self.max_retries => {
                    warn!(
                        "chunk {} fetch failed (attempt {}): {}",
                        chunk_index, attempt, e
                    );
                    let backoff = Duration::from_millis(500 * (attempt as u64 + 1));
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.shutdown_token.cancelled() => return Ok(()),
                    }
                }
                Err(e) => {
                    return Err(e.context(format!(
                        "chunk {} failed after {} retries",
                        chunk_index, self.max_retries
                    )));
                }
            }
        }

        Ok(())
    }

    /// Wait until the chunk is cached, fetching it urgently if needed.
    ///
    /// Returns `false` only if the fetch failed for good or the downloader was shut down.
    pub async fn wait_for_chunk(self: &Arc<Self>, chunk_index: usize) -> bool {
        if chunk_index >= self.cache.total_chunks() {
            return false;
        }

        let mut requested = false;
        loop {
            let notified = self.progress.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.cache.has_chunk(chunk_index) {
                return true;
            }
            if self.shutdown_token.is_cancelled() {
                return false;
            }
            if requested && !self.in_flight.lock()[chunk_index].any() {
                return false;
            }

            self.start_urgent(chunk_index);
            requested = true;

            notified.await;
        }
    }
}
