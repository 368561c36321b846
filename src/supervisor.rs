// Fault containment for requests, background tasks and the serving routine.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use anyhow::{anyhow, Result};
use axum::body::Body;
use axum::http::{header, Response, StatusCode};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{error, info, warn};

use crate::config::{MAX_RESTARTS, RESTART_BACKOFF_SECS};

/// Render a panic payload for logging.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Spawn a background task whose panic is logged and contained.
///
/// Resolves to `true` if the task ran to completion.
pub fn spawn_supervised<F>(name: &'static str, task: F) -> JoinHandle<bool>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        match AssertUnwindSafe(task).catch_unwind().await {
            Ok(()) => true,
            Err(payload) => {
                error!("task '{}' panicked: {}", name, panic_message(payload.as_ref()));
                false
            }
        }
    })
}

fn panic_response(payload: Box<dyn Any + Send + 'static>) -> Response<Body> {
    error!("request handler panicked: {}", panic_message(payload.as_ref()));
    let body = serde_json::json!({
        "success": false,
        "error": "internal server error",
    });
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// Layer converting a handler panic into a generic 500 JSON envelope.
pub fn request_containment(
) -> CatchPanicLayer<fn(Box<dyn Any + Send + 'static>) -> Response<Body>> {
    CatchPanicLayer::custom(panic_response as fn(Box<dyn Any + Send + 'static>) -> Response<Body>)
}

#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    /// Restarts allowed after the first run fails.
    pub max_restarts: u32,
    pub backoff: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: MAX_RESTARTS,
            backoff: Duration::from_secs(RESTART_BACKOFF_SECS),
        }
    }
}

/// Run `routine` until it returns `Ok`, restarting it after an error or a
/// panic. Gives up once the restart budget is spent and returns the last fault.
pub async fn run_with_restarts<F, Fut>(policy: RestartPolicy, mut routine: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut attempt: u32 = 0;
    loop {
        let fault = match AssertUnwindSafe(routine()).catch_unwind().await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e,
            Err(payload) => anyhow!("panic: {}", panic_message(payload.as_ref())),
        };

        if attempt >= policy.max_restarts {
            error!(
                "service failed {} times, giving up: {:#}",
                attempt + 1,
                fault
            );
            return Err(fault.context(format!("gave up after {} restarts", attempt)));
        }
        attempt += 1;
        warn!(
            "service failed: {:#}; restart {}/{} in {:?}",
            fault, attempt, policy.max_restarts, policy.backoff
        );
        tokio::time::sleep(policy.backoff).await;
        info!("restarting service");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick(max_restarts: u32) -> RestartPolicy {
        RestartPolicy {
            max_restarts,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        let result = run_with_restarts(quick(5), || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("bind failed"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(runs.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_recovers_from_panic() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        let result = run_with_restarts(quick(5), || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    panic!("boom");
                }
                Ok(())
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_spawn_supervised_contains_panic() {
        let ok = spawn_supervised("fine", async {}).await.unwrap();
        let broken = spawn_supervised("broken", async {
            panic!("task fault");
        });
        let failed = broken.await.unwrap();
        assert!(ok);
        assert!(!failed);
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_500() {
        use axum::routing::get;

        async fn faulty() -> &'static str {
            panic!("handler fault")
        }

        let app = axum::Router::new()
            .route("/boom", get(faulty))
            .route("/fine", get(|| async { "fine" }))
            .layer(request_containment());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let resp = reqwest::get(format!("http://{}/boom", addr)).await.unwrap();
        assert_eq!(resp.status().as_u16(), 500);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "internal server error");

        // The process keeps serving.
        let resp = reqwest::get(format!("http://{}/fine", addr)).await.unwrap();
        assert_eq!(resp.text().await.unwrap(), "fine");
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(payload.as_ref()), "static str");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
