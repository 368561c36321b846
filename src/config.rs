use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::Deserialize;

/// Interval between idle-session sweeps (10 minutes).
pub const SESSION_SWEEP_INTERVAL_SECS: u64 = 10 * 60;

/// Sessions idle for longer than this are evicted (30 minutes).
pub const SESSION_IDLE_TIMEOUT_SECS: u64 = 30 * 60;

/// Interval of the observability-only health check.
pub const HEALTH_CHECK_INTERVAL_SECS: u64 = 30;

/// How long stream start waits for content metadata before giving up.
pub const METADATA_TIMEOUT_SECS: u64 = 30;

/// Process-level restart budget.
pub const MAX_RESTARTS: u32 = 5;

/// Fixed delay before each process-level restart.
pub const RESTART_BACKOFF_SECS: u64 = 5;

/// Largest subtitle file accepted by the upload endpoint (5 MB).
pub const MAX_SUBTITLE_UPLOAD_BYTES: usize = 5 * 1024 * 1024;

/// Slack on top of the upload limit for multipart framing.
pub const UPLOAD_BODY_OVERHEAD_BYTES: usize = 64 * 1024;

/// Upper bound for a single body frame when streaming video (256 KB).
pub const STREAM_READ_BYTES: usize = 256 * 1024;

/// Number of tail chunks fetched right after the head chunk.
pub const TAIL_PREFETCH_CHUNKS: usize = 4;

/// Cookie carrying the per-client session token.
pub const SESSION_COOKIE: &str = "ts_session_id";

/// Lifetime of the session cookie (1 day).
pub const SESSION_COOKIE_MAX_AGE_SECS: u64 = 60 * 60 * 24;

/// Pseudo-filename handed to the video response; only its extension matters.
pub const VIDEO_PSEUDO_NAME: &str = "video.mp4";

/// Extensions (lower case, no dot) treated as playable video.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "mov", "webm", "flv", "wmv"];

/// Extensions (lower case, no dot) treated as subtitle sidecars.
pub const SUBTITLE_EXTENSIONS: &[&str] = &["srt", "vtt", "ass", "ssa", "sub"];

/// Configuration of the HTTP-backed content source.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Size of each download chunk in bytes.
    pub chunk_size: u64,
    /// Maximum number of concurrent chunk fetches per item.
    pub max_concurrency: u32,
    /// Retries per chunk before the fetch is reported as failed.
    pub max_retries: u32,
    /// Directory used for on-disk cache files.
    pub cache_dir: PathBuf,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            chunk_size: 2 * 1024 * 1024, // 2 MB
            max_concurrency: 6,
            max_retries: 3,
            cache_dir: std::env::temp_dir().join("stream-bridge"),
        }
    }
}

/// Top-level configuration of the service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Where uploaded subtitle sidecars are stored.
    pub subtitle_dir: PathBuf,
    pub sweep_interval_secs: u64,
    pub idle_timeout_secs: u64,
    pub health_interval_secs: u64,
    pub metadata_timeout_secs: u64,
    pub max_upload_bytes: usize,
    pub source: SourceConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            subtitle_dir: PathBuf::from("subtitles"),
            sweep_interval_secs: SESSION_SWEEP_INTERVAL_SECS,
            idle_timeout_secs: SESSION_IDLE_TIMEOUT_SECS,
            health_interval_secs: HEALTH_CHECK_INTERVAL_SECS,
            metadata_timeout_secs: METADATA_TIMEOUT_SECS,
            max_upload_bytes: MAX_SUBTITLE_UPLOAD_BYTES,
            source: SourceConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }

    /// Reject values the background tasks and the cache cannot run with.
    /// A zero idle timeout is allowed: every sweep then evicts idle sessions.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("health_interval_secs", self.health_interval_secs),
            ("metadata_timeout_secs", self.metadata_timeout_secs),
            ("max_upload_bytes", self.max_upload_bytes as u64),
            ("source.chunk_size", self.source.chunk_size),
            ("source.max_concurrency", u64::from(self.source.max_concurrency)),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                bail!("{} must be greater than zero", name);
            }
        }
        Ok(())
    }
}

/// Lower-cased extension of `path` without the dot.
pub fn extension_of(path: &str) -> Option<String> {
    std::path::Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
}

pub fn is_video_path(path: &str) -> bool {
    extension_of(path).is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.as_str()))
}

pub fn is_subtitle_path(path: &str) -> bool {
    extension_of(path).is_some_and(|ext| SUBTITLE_EXTENSIONS.contains(&ext.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_classification() {
        assert!(is_video_path("Movie/Movie.2019.MKV"));
        assert!(is_subtitle_path("Movie/movie.en.srt"));
        assert!(!is_video_path("readme.txt"));
        assert!(!is_subtitle_path("no_extension"));
        assert_eq!(extension_of("a/b.tar.gz").as_deref(), Some("gz"));
    }

    #[test]
    fn test_server_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.idle_timeout(), Duration::from_secs(1800));
        assert_eq!(config.sweep_interval(), Duration::from_secs(600));
        assert_eq!(config.metadata_timeout(), Duration::from_secs(30));
        assert_eq!(config.source.chunk_size, 2 * 1024 * 1024);
    }

    #[test]
    fn test_server_config_partial_json() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"idle_timeout_secs": 5, "source": {"chunk_size": 1024}}"#)
                .unwrap();
        assert_eq!(config.idle_timeout_secs, 5);
        assert_eq!(config.source.chunk_size, 1024);
        assert_eq!(config.source.max_concurrency, 6);
        assert_eq!(config.health_interval_secs, HEALTH_CHECK_INTERVAL_SECS);
    }

    #[test]
    fn test_validate_rejects_zero_intervals_and_sizes() {
        assert!(ServerConfig::default().validate().is_ok());

        let idle: ServerConfig = serde_json::from_str(r#"{"idle_timeout_secs": 0}"#).unwrap();
        assert!(idle.validate().is_ok());

        for raw in [
            r#"{"sweep_interval_secs": 0}"#,
            r#"{"health_interval_secs": 0}"#,
            r#"{"metadata_timeout_secs": 0}"#,
            r#"{"max_upload_bytes": 0}"#,
            r#"{"source": {"chunk_size": 0}}"#,
            r#"{"source": {"max_concurrency": 0}}"#,
        ] {
            let config: ServerConfig = serde_json::from_str(raw).unwrap();
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("greater than zero"), "{}", raw);
        }
    }
}
