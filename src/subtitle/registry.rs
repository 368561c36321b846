// Per-session subtitle tracks: discovered in content or uploaded, served as WebVTT.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info};

use super::codec::{CodecError, SubtitleCodec};
use super::language::LanguageDetector;
use super::SubtitleFormat;
use crate::config::{extension_of, is_subtitle_path, STREAM_READ_BYTES, SUBTITLE_EXTENSIONS};
use crate::engine::session::{Session, SubtitleTrack, TrackOrigin};
use crate::source::traits::{read_to_end, ContentItem};

/// Route that converts a track to WebVTT on the fly.
pub const NORMALISE_ROUTE: &str = "/api/subtitle";

/// Route prefix under which uploaded sidecars are served directly.
pub const SIDECAR_ROUTE: &str = "/subtitles";

#[derive(Debug, Error)]
pub enum SubtitleError {
    #[error("unsupported subtitle format '{0}', expected one of: {exts}", exts = SUBTITLE_EXTENSIONS.join(", "))]
    UnsupportedFormat(String),
    #[error("subtitle file is {size} bytes, the limit is {limit} bytes")]
    TooLarge { size: usize, limit: usize },
    #[error("failed to parse subtitle: {0}")]
    Parse(#[from] CodecError),
    #[error("subtitle storage error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot read subtitle from content: {0}")]
    Content(String),
    #[error("session was closed")]
    SessionClosed,
}

pub struct SubtitleRegistry {
    dir: PathBuf,
    codec: Arc<dyn SubtitleCodec>,
    detector: Arc<dyn LanguageDetector>,
    max_upload: usize,
}

impl SubtitleRegistry {
    pub fn new(
        dir: impl Into<PathBuf>,
        codec: Arc<dyn SubtitleCodec>,
        detector: Arc<dyn LanguageDetector>,
        max_upload: usize,
    ) -> Self {
        Self {
            dir: dir.into(),
            codec,
            detector,
            max_upload,
        }
    }

    /// Directory holding uploaded sidecars.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn codec(&self) -> &Arc<dyn SubtitleCodec> {
        &self.codec
    }

    /// Build tracks for every subtitle item of a content set and start fetching them.
    pub fn discover(&self, items: &[Arc<dyn ContentItem>]) -> Vec<SubtitleTrack> {
        items
            .iter()
            .filter(|item| is_subtitle_path(item.path()))
            .filter_map(|item| {
                let format = SubtitleFormat::from_path(item.path())?;
                item.download();

                let display_name = file_name(item.path()).to_string();
                let id = format!("item:{}", item.path());
                debug!("discovered subtitle {}", display_name);
                Some(SubtitleTrack {
                    access_path: normalise_path(&id),
                    language: self.detector.detect(&display_name),
                    display_name,
                    id,
                    format,
                    origin: TrackOrigin::Discovered(Arc::clone(item)),
                })
            })
            .collect()
    }

    /// Validate and store an uploaded sidecar, then register it on `session`.
    ///
    /// Nothing is written unless the extension and size are acceptable.
    pub async fn upload(
        &self,
        session: &Session,
        data: &[u8],
        original_name: &str,
    ) -> Result<SubtitleTrack, SubtitleError> {
        let name = sanitise_file_name(original_name);
        let format = SubtitleFormat::from_path(&name).ok_or_else(|| {
            SubtitleError::UnsupportedFormat(extension_of(&name).unwrap_or_else(|| name.clone()))
        })?;
        if data.len() > self.max_upload {
            return Err(SubtitleError::TooLarge {
                size: data.len(),
                limit: self.max_upload,
            });
        }

        let stored = format!("{}_{}", session.storage_key(), name);
        let path = self.dir.join(&stored);
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&path, data).await?;

        let id = format!("upload:{}", stored);
        let access_path = if format.is_wire_format() {
            format!("{}/{}", SIDECAR_ROUTE, stored)
        } else {
            normalise_path(&id)
        };
        let track = SubtitleTrack {
            id,
            language: self.detector.detect(&name),
            display_name: original_name.to_string(),
            access_path,
            format,
            origin: TrackOrigin::Uploaded(path),
        };

        if !session.push_subtitle(track.clone()) {
            return Err(SubtitleError::SessionClosed);
        }
        info!("stored uploaded subtitle ({} bytes, {:?})", data.len(), format);
        Ok(track)
    }

    /// Bytes of `track` in WebVTT. Tracks already in WebVTT are returned verbatim.
    pub async fn serve(&self, track: &SubtitleTrack) -> Result<Bytes, SubtitleError> {
        let raw = match &track.origin {
            TrackOrigin::Uploaded(path) => tokio::fs::read(path).await?,
            TrackOrigin::Discovered(item) => {
                let mut cursor = item.open_cursor();
                read_to_end(cursor.as_mut(), STREAM_READ_BYTES)
                    .await
                    .map_err(|e| SubtitleError::Content(format!("{:#}", e)))?
            }
        };

        if track.format.is_wire_format() {
            return Ok(Bytes::from(raw));
        }
        let vtt = self.codec.to_webvtt(track.format, &raw)?;
        Ok(Bytes::from(vtt))
    }
}

fn normalise_path(id: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(id.as_bytes()).collect();
    format!("{}?track={}", NORMALISE_ROUTE, encoded)
}

fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Reduce a client-supplied name to a safe single path component.
fn sanitise_file_name(name: &str) -> String {
    let cleaned: String = file_name(name)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "subtitle".to_string()
    } else {
        cleaned.to_string()
    }
}
