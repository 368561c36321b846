// Cookie-borne session identity.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};

use super::AppState;
use crate::config::{SESSION_COOKIE, SESSION_COOKIE_MAX_AGE_SECS};
use crate::engine::session::Session;

/// Value of the session cookie in `headers`, if any.
pub fn presented_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string())
}

pub fn issue_cookie(token: &str) -> String {
    format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        SESSION_COOKIE, token, SESSION_COOKIE_MAX_AGE_SECS
    )
}

pub fn clear_cookie() -> String {
    format!("{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0", SESSION_COOKIE)
}

/// The caller's session, allocated on first contact and touched on every request.
pub struct ClientSession {
    pub session: Arc<Session>,
    issued: bool,
}

impl ClientSession {
    /// Attach the session cookie to `response` when the client does not hold it yet.
    pub fn respond(&self, response: impl IntoResponse) -> Response {
        let mut response = response.into_response();
        if self.issued {
            if let Ok(value) = HeaderValue::from_str(&issue_cookie(self.session.token().as_str())) {
                response.headers_mut().append(SET_COOKIE, value);
            }
        }
        response
    }
}

impl FromRequestParts<AppState> for ClientSession {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let presented = presented_token(&parts.headers);
        let resolved = state.sessions.resolve(presented.as_deref());
        Ok(Self {
            session: resolved.session,
            issued: resolved.issued,
        })
    }
}
