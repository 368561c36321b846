// JSON API handlers: stream start, status, progress, subtitles and session reset.

use axum::body::Bytes;
use axum::extract::multipart::MultipartRejection;
use axum::extract::{Multipart, Query, State};
use axum::http::header::{self, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::error::{ok, ApiError, ApiResult, Envelope};
use super::identity::{clear_cookie, presented_token, ClientSession};
use super::AppState;
use crate::config::extension_of;
use crate::engine::progress::{self, Phase};
use crate::engine::session::SubtitleTrack;
use crate::subtitle::LanguageHint;

/// Multipart field carrying an uploaded subtitle.
pub const UPLOAD_FIELD: &str = "subtitle";

/// Path of the video endpoint, as advertised in status responses.
pub const VIDEO_URL: &str = "/api/video";

#[derive(Debug, Deserialize)]
struct StreamRequest {
    #[serde(alias = "identifier")]
    magnet: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStarted {
    pub identifier: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct TrackView {
    pub id: String,
    pub name: String,
    pub path: String,
    pub lang: LanguageHint,
}

impl From<&SubtitleTrack> for TrackView {
    fn from(track: &SubtitleTrack) -> Self {
        Self {
            id: track.id.clone(),
            name: track.display_name.clone(),
            path: track.access_path.clone(),
            lang: track.language.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub status: String,
    pub identifier: Option<String>,
    pub name: Option<String>,
    pub video_available: bool,
    pub video_url: Option<String>,
    pub progress: f64,
    pub phase: Phase,
    pub file_size: u64,
    pub file_size_label: String,
    pub file_type: String,
    pub subtitles: Vec<TrackView>,
}

/// Human-readable byte count, e.g. `1.5 MB`.
pub fn format_file_size(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{} B", bytes);
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let prefix = ['K', 'M', 'G', 'T', 'P', 'E'][exp];
    format!("{:.1} {}B", bytes as f64 / div as f64, prefix)
}

/// `POST /api/stream`: start acquiring `{"magnet": "..."}` and return immediately.
pub async fn stream(
    State(state): State<AppState>,
    client: ClientSession,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    let result = parse_stream_request(content_type, &body)
        .and_then(|request| start_stream(&state, &client, request));
    client.respond(result)
}

/// Decode a stream request from a form-encoded or JSON body. Anything that is
/// not declared as a form is read as JSON.
fn parse_stream_request(content_type: Option<&str>, body: &[u8]) -> ApiResult<StreamRequest> {
    let is_form = content_type.is_some_and(|value| {
        value
            .split(';')
            .next()
            .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/x-www-form-urlencoded"))
    });
    if !is_form {
        return serde_json::from_slice(body)
            .map_err(|e| ApiError::BadRequest(format!("invalid request body: {}", e)));
    }

    url::form_urlencoded::parse(body)
        .find(|(key, _)| key == "magnet" || key == "identifier")
        .map(|(_, value)| StreamRequest {
            magnet: value.into_owned(),
        })
        .ok_or_else(|| ApiError::BadRequest("invalid request body: missing field `magnet`".into()))
}

fn start_stream(
    state: &AppState,
    client: &ClientSession,
    request: StreamRequest,
) -> ApiResult<impl IntoResponse> {
    let identifier = request.magnet.trim().to_string();
    if identifier.is_empty() {
        return Err(ApiError::BadRequest("missing content identifier".into()));
    }
    url::Url::parse(&identifier)
        .map_err(|e| ApiError::BadRequest(format!("malformed content identifier: {}", e)))?;

    info!("stream requested");
    let _task = state
        .acquisition
        .start(client.session.clone(), identifier.clone());
    Ok(ok(StreamStarted {
        identifier,
        status: "accepted".into(),
    }))
}

/// `GET /api/status`
pub async fn status(client: ClientSession) -> Response {
    let snapshot = client.session.snapshot();
    let progress = progress::compute_item(snapshot.selected.as_deref());

    let (file_size, file_type) = match &snapshot.selected {
        Some(item) => (
            item.length(),
            extension_of(item.path()).unwrap_or_else(|| "file".into()),
        ),
        None => (0, "file".into()),
    };
    let video_available = snapshot.selected.is_some();

    let view = StatusView {
        status: snapshot.status_message,
        identifier: snapshot.identifier,
        name: snapshot.name,
        video_available,
        video_url: video_available.then(|| VIDEO_URL.to_string()),
        progress: progress.progress,
        phase: progress.phase,
        file_size,
        file_size_label: format_file_size(file_size),
        file_type,
        subtitles: snapshot.subtitles.iter().map(TrackView::from).collect(),
    };
    client.respond(ok(view))
}

/// `GET /api/progress`
pub async fn progress(client: ClientSession) -> Response {
    let progress = progress::compute(&client.session);
    client.respond(ok(progress))
}

#[derive(Debug, Deserialize)]
pub struct TrackQuery {
    track: Option<String>,
}

/// `GET /api/subtitle?track=<id>`: the track as WebVTT.
pub async fn subtitle(
    State(state): State<AppState>,
    client: ClientSession,
    Query(query): Query<TrackQuery>,
) -> Response {
    let result = serve_track(&state, &client, query.track).await;
    client.respond(result)
}

async fn serve_track(
    state: &AppState,
    client: &ClientSession,
    id: Option<String>,
) -> ApiResult<Response> {
    let id = id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing track parameter".into()))?;
    let track = client
        .session
        .subtitle(&id)
        .ok_or_else(|| ApiError::NotFound(format!("unknown subtitle track {}", id)))?;
    debug!("serving subtitle {}", track.display_name);

    let body = state.subtitles.serve(&track).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/vtt; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        body,
    )
        .into_response())
}

/// `POST /api/upload-subtitle`: multipart with a `subtitle` file field.
pub async fn upload_subtitle(
    State(state): State<AppState>,
    client: ClientSession,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let result = store_upload(&state, &client, multipart).await;
    client.respond(result)
}

async fn store_upload(
    state: &AppState,
    client: &ClientSession,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Json<Envelope<TrackView>>> {
    let mut multipart =
        multipart.map_err(|e| ApiError::BadRequest(format!("expected multipart form: {}", e)))?;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let name = field.file_name().unwrap_or_default().to_string();
        let data = field.bytes().await.map_err(multipart_error)?;
        let track = state.subtitles.upload(&client.session, &data, &name).await?;
        return Ok(ok(TrackView::from(&track)));
    }
    Err(ApiError::BadRequest(format!(
        "no '{}' file in upload",
        UPLOAD_FIELD
    )))
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge("upload exceeds the size limit".into())
    } else {
        ApiError::BadRequest(err.body_text())
    }
}

#[derive(Debug, Serialize)]
pub struct ResetView {
    pub reset: bool,
}

/// `POST /api/reset-session`: release the caller's session and clear its cookie.
/// Never allocates a session.
pub async fn reset_session(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let reset = presented_token(&headers)
        .map(|token| state.sessions.reset(&token))
        .unwrap_or(false);
    if reset {
        info!("session reset ({} live)", state.sessions.len());
    }

    let mut response = ok(ResetView { reset }).into_response();
    if let Ok(value) = HeaderValue::from_str(&clear_cookie()) {
        response.headers_mut().append(SET_COOKIE, value);
    }
    response
}

#[derive(Debug, Serialize)]
pub struct HealthView {
    pub status: &'static str,
    pub sessions: usize,
}

/// `GET /api/health`
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    ok(HealthView {
        status: "ok",
        sessions: state.sessions.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_file_size() {
        assert_eq!(format_file_size(512), "512 B");
        assert_eq!(format_file_size(1536), "1.5 KB");
        assert_eq!(format_file_size(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_file_size(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn test_stream_request_accepts_alias() {
        let req: StreamRequest = serde_json::from_str(r#"{"identifier": "x"}"#).unwrap();
        assert_eq!(req.magnet, "x");
        let req: StreamRequest = serde_json::from_str(r#"{"magnet": "y"}"#).unwrap();
        assert_eq!(req.magnet, "y");
    }

    #[test]
    fn test_parse_stream_request_by_content_type() {
        let form = Some("application/x-www-form-urlencoded; charset=UTF-8");
        let req = parse_stream_request(form, b"magnet=magnet%3A%3Fxt%3Durn%3Abtih%3Aabc&x=1").unwrap();
        assert_eq!(req.magnet, "magnet:?xt=urn:btih:abc");
        let req = parse_stream_request(form, b"identifier=http%3A%2F%2Fhost%2Fa.mkv").unwrap();
        assert_eq!(req.magnet, "http://host/a.mkv");
        assert!(parse_stream_request(form, b"other=1").is_err());

        let req = parse_stream_request(Some("application/json"), br#"{"magnet": "z"}"#).unwrap();
        assert_eq!(req.magnet, "z");
        let req = parse_stream_request(None, br#"{"magnet": "z"}"#).unwrap();
        assert_eq!(req.magnet, "z");
        assert!(parse_stream_request(None, b"magnet=z").is_err());
    }
}
