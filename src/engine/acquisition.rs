// Background stream start: resolve an identifier and attach it to a session.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::session::Session;
use crate::config::is_video_path;
use crate::source::traits::ContentSource;
use crate::subtitle::SubtitleRegistry;
use crate::supervisor::spawn_supervised;

pub const CONNECTING_STATUS: &str = "Connecting to content source...";
pub const FINDING_STATUS: &str = "Finding video file and subtitles...";

pub struct Acquisition {
    source: Arc<dyn ContentSource>,
    subtitles: Arc<SubtitleRegistry>,
    metadata_timeout: Duration,
}

impl Acquisition {
    pub fn new(
        source: Arc<dyn ContentSource>,
        subtitles: Arc<SubtitleRegistry>,
        metadata_timeout: Duration,
    ) -> Self {
        Self {
            source,
            subtitles,
            metadata_timeout,
        }
    }

    /// Schedule acquisition of `identifier` for `session` and return at once.
    ///
    /// Requests for one session run one at a time; a request still queued when
    /// a newer one arrives is skipped.
    pub fn start(self: &Arc<Self>, session: Arc<Session>, identifier: String) -> JoinHandle<bool> {
        let generation = session.next_generation();
        let this = Arc::clone(self);
        spawn_supervised("acquisition", async move {
            this.run(&session, &identifier, generation).await;
        })
    }

    async fn run(&self, session: &Session, identifier: &str, generation: u64) {
        let _exclusive = session.lock_acquisition().await;
        if session.is_closed() {
            return;
        }
        if !session.is_latest(generation) {
            debug!("stream request {} superseded before it started", generation);
            return;
        }

        // The previous content must be gone before the next one is resolved.
        if session.release() {
            debug!("released previous content");
        }
        session.set_status(CONNECTING_STATUS);

        let resolved = tokio::select! {
            _ = session.closed() => {
                debug!("session closed while resolving");
                return;
            }
            resolved = tokio::time::timeout(self.metadata_timeout, self.source.resolve(identifier)) => resolved,
        };

        let content = match resolved {
            Ok(Ok(content)) => content,
            Ok(Err(e)) => {
                warn!("content resolution failed: {:#}", e);
                session.set_status(format!("Error: {:#}", e));
                return;
            }
            Err(_) => {
                warn!(
                    "content metadata did not arrive within {:?}",
                    self.metadata_timeout
                );
                session.set_status(format!(
                    "Error: timed out after {}s waiting for content metadata",
                    self.metadata_timeout.as_secs()
                ));
                return;
            }
        };

        session.set_status(FINDING_STATUS);
        let items = content.items();
        // First video-like item in enumeration order wins.
        let selected = items.iter().find(|item| is_video_path(item.path())).cloned();
        if let Some(item) = &selected {
            item.download();
        }
        let tracks = self.subtitles.discover(&items);

        let status = match &selected {
            Some(_) => format!("Ready to play: {}", content.name()),
            None => {
                warn!("no video item in {}", content.name());
                format!("No video file found in {}", content.name())
            }
        };
        let track_count = tracks.len();

        if session.attach(Arc::clone(&content), selected, tracks, status) {
            info!(
                "content {} attached ({} items, {} subtitle tracks)",
                content.name(),
                items.len(),
                track_count
            );
        } else {
            debug!("session closed before attach; abandoning content");
            content.abandon();
        }
    }
}
