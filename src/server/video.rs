// Video endpoint: serves the selected item with range support while it downloads.

use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::error::ApiError;
use super::identity::ClientSession;
use super::range::{negotiate, RangeOutcome};
use crate::config::{extension_of, STREAM_READ_BYTES, VIDEO_PSEUDO_NAME};
use crate::source::traits::ContentItem;
use crate::supervisor::spawn_supervised;

/// Frames buffered between the cursor task and the response body.
const BODY_BUFFER_FRAMES: usize = 4;

const NO_CACHE: &str = "no-store, no-cache, must-revalidate";

/// MIME type inferred from a file name's extension.
pub fn content_type_for(name: &str) -> &'static str {
    match extension_of(name).as_deref() {
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        _ => "application/octet-stream",
    }
}

fn http_date_now() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// Stream bytes `[start, end)` of `item` through a fresh cursor.
///
/// Reads past the download frontier wait for the bytes to arrive. The cursor
/// is dropped as soon as the returned stream is, or when the range ends.
pub fn body_stream(
    item: Arc<dyn ContentItem>,
    start: u64,
    end: u64,
) -> ReceiverStream<io::Result<Bytes>> {
    let (tx, rx) = mpsc::channel(BODY_BUFFER_FRAMES);
    spawn_supervised("video-body", async move {
        let mut cursor = item.open_cursor();
        cursor.seek(start);

        let mut pos = start;
        while pos < end {
            let want = (end - pos).min(STREAM_READ_BYTES as u64) as usize;
            let read = tokio::select! {
                _ = tx.closed() => {
                    debug!("client went away at byte {}", pos);
                    return;
                }
                read = cursor.read(want) => read,
            };

            let frame = match read {
                Ok(frame) if frame.is_empty() => {
                    warn!("item ended at byte {} before {}", pos, end);
                    let _ = tx
                        .send(Err(io::Error::new(io::ErrorKind::UnexpectedEof, "item ended early")))
                        .await;
                    return;
                }
                Ok(frame) => frame,
                Err(e) => {
                    warn!("cursor read failed at byte {}: {:#}", pos, e);
                    let _ = tx.send(Err(io::Error::other(format!("{:#}", e)))).await;
                    return;
                }
            };

            pos += frame.len() as u64;
            if tx.send(Ok(frame)).await.is_err() {
                return;
            }
        }
    });
    ReceiverStream::new(rx)
}

/// `GET|HEAD /api/video`
pub async fn video(client: ClientSession, method: Method, headers: HeaderMap) -> Response {
    let Some(item) = client.session.selected_item() else {
        return client.respond(ApiError::NotFound("no video available yet".into()));
    };

    let total = item.length();
    let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    let outcome = negotiate(range, total);

    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, content_type_for(VIDEO_PSEUDO_NAME))
        .header(header::LAST_MODIFIED, http_date_now())
        .header(header::CACHE_CONTROL, NO_CACHE)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));

    let (start, end) = match outcome {
        RangeOutcome::Unsatisfiable => {
            let response = builder
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(header::CONTENT_RANGE, format!("bytes */{}", total))
                .body(Body::empty());
            return client.respond(response_or_500(response));
        }
        RangeOutcome::Full => {
            builder = builder.status(StatusCode::OK);
            (0, total)
        }
        RangeOutcome::Partial { start, end } => {
            builder = builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end - 1, total));
            (start, end)
        }
    };

    debug!(
        "video {} [{}, {}) of {} ({} bytes available)",
        method,
        start,
        end,
        total,
        item.bytes_completed()
    );

    let builder = builder.header(header::CONTENT_LENGTH, end - start);
    let body = if method == Method::HEAD || start == end {
        Body::empty()
    } else {
        Body::from_stream(body_stream(item, start, end))
    };
    client.respond(response_or_500(builder.body(body)))
}

fn response_or_500(response: Result<Response<Body>, axum::http::Error>) -> Response {
    response.unwrap_or_else(|e| {
        ApiError::Internal(anyhow::Error::new(e).context("building video response")).into_response()
    })
}
