// HTTP surface: router, shared state and the serving routine.

pub mod error;
pub mod handler;
pub mod identity;
pub mod range;
pub mod video;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use crate::config::{ServerConfig, UPLOAD_BODY_OVERHEAD_BYTES};
use crate::engine::acquisition::Acquisition;
use crate::engine::reaper::{spawn_health_check, spawn_reaper};
use crate::engine::store::SessionStore;
use crate::source::http_content::HttpContentSource;
use crate::source::traits::ContentSource;
use crate::subtitle::registry::SIDECAR_ROUTE;
use crate::subtitle::{BuiltinCodec, FilenameHeuristic, SubtitleRegistry};
use crate::supervisor::request_containment;

/// How long shutdown waits for open connections to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionStore>,
    pub subtitles: Arc<SubtitleRegistry>,
    pub acquisition: Arc<Acquisition>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Wire the components together around `source`.
    pub fn new(config: ServerConfig, source: Arc<dyn ContentSource>) -> Self {
        let subtitles = Arc::new(SubtitleRegistry::new(
            config.subtitle_dir.clone(),
            Arc::new(BuiltinCodec),
            Arc::new(FilenameHeuristic),
            config.max_upload_bytes,
        ));
        let acquisition = Arc::new(Acquisition::new(
            source,
            Arc::clone(&subtitles),
            config.metadata_timeout(),
        ));
        Self {
            sessions: Arc::new(SessionStore::new()),
            subtitles,
            acquisition,
            config: Arc::new(config),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let upload_limit = state.config.max_upload_bytes + UPLOAD_BODY_OVERHEAD_BYTES;
    let sidecars = ServeDir::new(state.subtitles.dir());

    let api = Router::new()
        .route("/stream", post(handler::stream))
        .route("/status", get(handler::status))
        .route("/progress", get(handler::progress))
        .route("/video", get(video::video))
        .route("/subtitle", get(handler::subtitle))
        .route(
            "/upload-subtitle",
            post(handler::upload_subtitle).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/reset-session", post(handler::reset_session))
        .route("/health", get(handler::health));

    Router::new()
        .nest("/api", api)
        .nest_service(SIDECAR_ROUTE, sidecars)
        .layer(CorsLayer::permissive())
        .layer(request_containment())
        .with_state(state)
}

pub struct AppServer {
    addr: SocketAddr,
    state: AppState,
    stop: CancellationToken,
    serve_task: Option<JoinHandle<std::io::Result<()>>>,
    background: Vec<JoinHandle<bool>>,
}

impl AppServer {
    /// Bind `state.config.bind`, spawn the reaper and health check, and start serving.
    pub async fn start(state: AppState) -> Result<Self> {
        let config = Arc::clone(&state.config);
        config.validate()?;
        tokio::fs::create_dir_all(&config.subtitle_dir)
            .await
            .with_context(|| {
                format!("cannot create subtitle dir {}", config.subtitle_dir.display())
            })?;

        let listener = TcpListener::bind(config.bind)
            .await
            .with_context(|| format!("cannot bind {}", config.bind))?;
        let addr = listener.local_addr()?;

        let stop = CancellationToken::new();
        let background = vec![
            spawn_reaper(
                Arc::clone(&state.sessions),
                config.sweep_interval(),
                config.idle_timeout(),
                stop.clone(),
            ),
            spawn_health_check(
                Arc::clone(&state.sessions),
                config.health_interval(),
                stop.clone(),
            ),
        ];

        let app = router(state.clone());
        let shutdown = stop.clone();
        let serve_task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        });

        info!("stream bridge listening on http://{}", addr);
        Ok(Self {
            addr,
            state,
            stop,
            serve_task: Some(serve_task),
            background,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Absolute URL for `path` on this server.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve until `stop` fires or the server fails, then shut down.
    pub async fn run_until(mut self, stop: CancellationToken) -> Result<()> {
        let Some(mut serve_task) = self.serve_task.take() else {
            return Ok(());
        };

        let (outcome, finished) = tokio::select! {
            _ = stop.cancelled() => {
                info!("shutdown requested");
                (Ok(()), false)
            }
            served = &mut serve_task => {
                let outcome = match served {
                    Ok(Ok(())) => Err(anyhow::anyhow!("server stopped unexpectedly")),
                    Ok(Err(e)) => Err(anyhow::Error::new(e).context("server failed")),
                    Err(e) => Err(anyhow::Error::new(e).context("server task failed")),
                };
                (outcome, true)
            }
        };

        if !finished {
            self.serve_task = Some(serve_task);
        }
        self.shutdown().await;
        outcome
    }

    /// Stop serving and background tasks, then release every session.
    pub async fn shutdown(mut self) {
        self.stop.cancel();

        let sessions = self.state.sessions.drain();
        let count = sessions.len();
        for session in sessions {
            session.close();
        }
        debug!("released {} sessions at shutdown", count);

        if let Some(mut task) = self.serve_task.take() {
            // Open video responses may be parked on bytes that will never arrive.
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!("server task ended abnormally: {}", e),
                Err(_) => {
                    warn!("connections still open after {:?}; aborting", SHUTDOWN_GRACE);
                    task.abort();
                }
            }
        }
        for task in self.background.drain(..) {
            let _ = task.await;
        }
    }
}

/// One run of the service: build the content source, serve until `stop`.
pub async fn run(config: ServerConfig, stop: CancellationToken) -> Result<()> {
    let source = HttpContentSource::new(config.source.clone())?;
    let state = AppState::new(config, Arc::new(source));
    let server = AppServer::start(state).await?;
    server.run_until(stop).await
}
