// Per-client session state: the active content reference, its selected item and subtitle tracks.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::source::traits::{Content, ContentItem};
use crate::subtitle::language::LanguageHint;
use crate::subtitle::SubtitleFormat;

/// Status narration of a session that has never started a stream.
pub const IDLE_STATUS: &str = "Ready to stream";

/// Opaque, unguessable client credential.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// Tokens are credentials; keep them out of logs.
impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(..)")
    }
}

/// Where a subtitle track's bytes live.
#[derive(Clone)]
pub enum TrackOrigin {
    /// An item inside the session's content set.
    Discovered(Arc<dyn ContentItem>),
    /// A sidecar file uploaded by the client.
    Uploaded(PathBuf),
}

impl fmt::Debug for TrackOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discovered(item) => f.debug_tuple("Discovered").field(&item.path()).finish(),
            Self::Uploaded(path) => f.debug_tuple("Uploaded").field(path).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubtitleTrack {
    /// Stable id used in `/api/subtitle?track=<id>`.
    pub id: String,
    pub display_name: String,
    pub access_path: String,
    pub language: LanguageHint,
    pub format: SubtitleFormat,
    pub origin: TrackOrigin,
}

impl SubtitleTrack {
    /// Delete uploaded sidecar bytes. Discovered tracks go away with their content.
    fn discard(&self) {
        if let TrackOrigin::Uploaded(path) = &self.origin {
            if let Err(e) = std::fs::remove_file(path) {
                debug!("could not remove sidecar {}: {}", path.display(), e);
            }
        }
    }
}

pub struct SessionState {
    pub content: Option<Arc<dyn Content>>,
    pub selected: Option<Arc<dyn ContentItem>>,
    pub subtitles: Vec<SubtitleTrack>,
    pub last_activity: Instant,
    pub status_message: String,
}

impl SessionState {
    fn new() -> Self {
        Self {
            content: None,
            selected: None,
            subtitles: Vec::new(),
            last_activity: Instant::now(),
            status_message: IDLE_STATUS.to_string(),
        }
    }

    fn detach(&mut self) -> Detached {
        Detached {
            content: self.content.take(),
            subtitles: std::mem::take(&mut self.subtitles),
            had_selection: self.selected.take().is_some(),
        }
    }
}

/// Everything taken out of a session by a release, disposed outside the lock.
struct Detached {
    content: Option<Arc<dyn Content>>,
    subtitles: Vec<SubtitleTrack>,
    had_selection: bool,
}

impl Detached {
    fn dispose(self) -> bool {
        for track in &self.subtitles {
            track.discard();
        }
        match self.content {
            Some(content) => {
                content.abandon();
                true
            }
            None => self.had_selection,
        }
    }
}

/// Read-only copy of a session's state for rendering.
#[derive(Clone)]
pub struct SessionSnapshot {
    pub status_message: String,
    pub identifier: Option<String>,
    pub name: Option<String>,
    pub selected: Option<Arc<dyn ContentItem>>,
    pub subtitles: Vec<SubtitleTrack>,
}

pub struct Session {
    token: SessionToken,
    /// Namespace for uploaded sidecars; deliberately not the token.
    storage_key: String,
    state: Mutex<SessionState>,
    /// Held by the acquisition task for its whole run.
    acquisition: tokio::sync::Mutex<()>,
    latest_request: AtomicU64,
    closed: CancellationToken,
}

impl Session {
    pub fn new(token: SessionToken) -> Self {
        Self {
            token,
            storage_key: Uuid::new_v4().simple().to_string(),
            state: Mutex::new(SessionState::new()),
            acquisition: tokio::sync::Mutex::new(()),
            latest_request: AtomicU64::new(0),
            closed: CancellationToken::new(),
        }
    }

    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    pub fn touch(&self) {
        self.state.lock().last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.state.lock().last_activity.elapsed()
    }

    pub fn set_status(&self, message: impl Into<String>) {
        self.state.lock().status_message = message.into();
    }

    pub fn status_message(&self) -> String {
        self.state.lock().status_message.clone()
    }

    pub fn selected_item(&self) -> Option<Arc<dyn ContentItem>> {
        self.state.lock().selected.clone()
    }

    pub fn has_content(&self) -> bool {
        self.state.lock().content.is_some()
    }

    pub fn subtitle(&self, id: &str) -> Option<SubtitleTrack> {
        self.state
            .lock()
            .subtitles
            .iter()
            .find(|track| track.id == id)
            .cloned()
    }

    pub fn subtitles(&self) -> Vec<SubtitleTrack> {
        self.state.lock().subtitles.clone()
    }

    /// Append a track, or replace the one with the same id in place. Refused
    /// once the session is closed, in which case the track is discarded.
    pub fn push_subtitle(&self, track: SubtitleTrack) -> bool {
        let mut state = self.state.lock();
        if self.closed.is_cancelled() {
            drop(state);
            track.discard();
            return false;
        }
        match state.subtitles.iter_mut().find(|t| t.id == track.id) {
            Some(existing) => *existing = track,
            None => state.subtitles.push(track),
        }
        true
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock();
        SessionSnapshot {
            status_message: state.status_message.clone(),
            identifier: state.content.as_ref().map(|c| c.identifier().to_string()),
            name: state.content.as_ref().map(|c| c.name().to_string()),
            selected: state.selected.clone(),
            subtitles: state.subtitles.clone(),
        }
    }

    /// Release the active content reference, its selected item and subtitles.
    ///
    /// Returns whether anything was attached.
    pub fn release(&self) -> bool {
        let detached = self.state.lock().detach();
        detached.dispose()
    }

    /// Attach freshly resolved content. Refused once the session is closed;
    /// the caller then owns `content` and must abandon it.
    pub fn attach(
        &self,
        content: Arc<dyn Content>,
        selected: Option<Arc<dyn ContentItem>>,
        subtitles: Vec<SubtitleTrack>,
        status: String,
    ) -> bool {
        let previous = {
            let mut state = self.state.lock();
            if self.closed.is_cancelled() {
                return false;
            }
            let previous = state.detach();
            state.content = Some(content);
            state.selected = selected;
            state.subtitles = subtitles;
            state.status_message = status;
            previous
        };
        // Acquisition releases before resolving, so this is normally empty.
        previous.dispose();
        true
    }

    /// Close the session for good: cancel any in-flight acquisition and release everything.
    pub fn close(&self) {
        self.closed.cancel();
        self.release();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the session has been closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Register a new stream-start request, returning its generation.
    pub fn next_generation(&self) -> u64 {
        self.latest_request.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Whether `generation` is still the most recent stream-start request.
    pub fn is_latest(&self, generation: u64) -> bool {
        self.latest_request.load(Ordering::SeqCst) == generation
    }

    pub(crate) async fn lock_acquisition(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.acquisition.lock().await
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("storage_key", &self.storage_key)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::memory::{MemoryItem, MemorySource};
    use crate::source::traits::ContentSource;

    #[test]
    fn test_new_session_is_idle() {
        let session = Session::new(SessionToken::generate());
        assert_eq!(session.status_message(), IDLE_STATUS);
        assert!(session.selected_item().is_none());
        assert!(!session.has_content());
        assert!(!session.release());
    }

    #[test]
    fn test_tokens_are_unique_and_hidden_from_debug() {
        let a = SessionToken::generate();
        let b = SessionToken::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(!format!("{:?}", a).contains(a.as_str()));
    }

    #[test]
    fn test_track_debug_names_its_origin() {
        let item: Arc<dyn ContentItem> = Arc::new(MemoryItem::new("Movie/movie.en.srt", Vec::<u8>::new()));
        let track = SubtitleTrack {
            id: "item:Movie/movie.en.srt".into(),
            display_name: "movie.en.srt".into(),
            access_path: "/api/subtitle?track=x".into(),
            language: LanguageHint::Code("en".into()),
            format: SubtitleFormat::SubRip,
            origin: TrackOrigin::Discovered(item),
        };
        let rendered = format!("{:?}", track);
        assert!(rendered.contains("Discovered(\"Movie/movie.en.srt\")"));

        let uploaded = TrackOrigin::Uploaded(PathBuf::from("/tmp/a.vtt"));
        assert!(format!("{:?}", uploaded).contains("a.vtt"));
    }

    #[tokio::test]
    async fn test_attach_after_close_is_refused() {
        let source = MemorySource::new();
        source.insert("id", "set", vec![MemoryItem::complete("a.mp4", vec![0u8; 4])]);

        let session = Session::new(SessionToken::generate());
        session.close();
        let content = source.resolve("id").await.unwrap();
        assert!(!session.attach(content.clone(), None, Vec::new(), "x".into()));
        content.abandon();
        assert_eq!(source.live_handles(), 0);
    }

    #[tokio::test]
    async fn test_release_abandons_content() {
        let source = MemorySource::new();
        source.insert("id", "set", vec![MemoryItem::complete("a.mp4", vec![0u8; 4])]);

        let session = Session::new(SessionToken::generate());
        let content = source.resolve("id").await.unwrap();
        let item = content.items().remove(0);
        assert!(session.attach(content, Some(item), Vec::new(), "Ready".into()));
        assert!(session.selected_item().is_some());

        assert!(session.release());
        assert!(session.selected_item().is_none());
        assert_eq!(source.live_handles(), 0);
    }
}
