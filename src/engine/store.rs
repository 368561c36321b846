// Session registry keyed by opaque client token.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::session::{Session, SessionToken};

/// Presented tokens longer than this are ignored rather than looked up.
pub const MAX_TOKEN_LEN: usize = 128;

/// Outcome of [`SessionStore::resolve`].
pub struct Resolved {
    pub session: Arc<Session>,
    /// The client must be handed `session.token()` because it did not present it.
    pub issued: bool,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<String, Arc<Session>>,
    /// Unknown token presented by a client -> token issued in its place.
    rebinds: HashMap<String, String>,
}

impl Registry {
    fn lookup(&self, token: &str) -> Option<(Arc<Session>, bool)> {
        if let Some(session) = self.sessions.get(token) {
            return Some((Arc::clone(session), false));
        }
        let fresh = self.rebinds.get(token)?;
        self.sessions
            .get(fresh)
            .map(|session| (Arc::clone(session), true))
    }

    fn remove(&mut self, token: &str) -> Option<Arc<Session>> {
        let key = if self.sessions.contains_key(token) {
            token.to_string()
        } else {
            self.rebinds.get(token)?.clone()
        };
        let session = self.sessions.remove(&key)?;
        self.rebinds.retain(|_, fresh| *fresh != key);
        Some(session)
    }
}

/// All sessions, behind one mutual-exclusion domain. The lock is never held
/// across I/O or while releasing content.
#[derive(Default)]
pub struct SessionStore {
    inner: Mutex<Registry>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the session for `presented`, allocating a fresh one under a new
    /// token when the token is absent or unknown.
    ///
    /// Concurrent calls presenting the same unknown token all land on the
    /// same freshly allocated session. The returned session's activity time is
    /// refreshed under the registry lock.
    pub fn resolve(&self, presented: Option<&str>) -> Resolved {
        let presented = presented.filter(|t| !t.is_empty() && t.len() <= MAX_TOKEN_LEN);

        let mut registry = self.inner.lock();
        if let Some(token) = presented {
            if let Some((session, rebound)) = registry.lookup(token) {
                session.touch();
                return Resolved {
                    session,
                    issued: rebound,
                };
            }
        }

        let session = Arc::new(Session::new(SessionToken::generate()));
        let fresh = session.token().as_str().to_string();
        registry.sessions.insert(fresh.clone(), Arc::clone(&session));
        if let Some(token) = presented {
            registry.rebinds.insert(token.to_string(), fresh);
        }
        debug!("allocated session ({} live)", registry.sessions.len());
        Resolved {
            session,
            issued: true,
        }
    }

    /// Look up a session without allocating.
    pub fn get(&self, token: &str) -> Option<Arc<Session>> {
        self.inner.lock().lookup(token).map(|(session, _)| session)
    }

    /// Refresh `session` outside of `resolve`, taking the registry lock the
    /// same way so it cannot interleave with a sweep.
    pub fn touch(&self, session: &Session) {
        let _registry = self.inner.lock();
        session.touch();
    }

    /// Release and remove the session behind `token`. Unknown tokens are a no-op.
    pub fn reset(&self, token: &str) -> bool {
        let removed = self.inner.lock().remove(token);
        match removed {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    /// Remove every session idle for longer than `threshold`, handing each to
    /// `release` after the lock is dropped. Returns the number removed.
    pub fn sweep_expired<F>(&self, threshold: Duration, mut release: F) -> usize
    where
        F: FnMut(Arc<Session>),
    {
        let expired: Vec<Arc<Session>> = {
            let mut registry = self.inner.lock();
            let tokens: Vec<String> = registry
                .sessions
                .iter()
                .filter(|(_, session)| session.idle_for() > threshold)
                .map(|(token, _)| token.clone())
                .collect();
            tokens
                .iter()
                .filter_map(|token| registry.remove(token))
                .collect()
        };

        let count = expired.len();
        for session in expired {
            release(session);
        }
        count
    }

    /// Remove every session, returning them for release.
    pub fn drain(&self) -> Vec<Arc<Session>> {
        let mut registry = self.inner.lock();
        registry.rebinds.clear();
        registry.sessions.drain().map(|(_, session)| session).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_without_token_allocates() {
        let store = SessionStore::new();
        let a = store.resolve(None);
        let b = store.resolve(None);
        assert!(a.issued && b.issued);
        assert_ne!(a.session.token(), b.session.token());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_resolve_known_token_returns_same_session() {
        let store = SessionStore::new();
        let first = store.resolve(None);
        let again = store.resolve(Some(first.session.token().as_str()));
        assert!(!again.issued);
        assert!(Arc::ptr_eq(&first.session, &again.session));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_concurrent_unknown_token_yields_one_session() {
        let store = SessionStore::new();
        let sessions: Vec<Arc<Session>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| scope.spawn(|| store.resolve(Some("stale-token")).session))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(store.len(), 1);
        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
        assert_ne!(sessions[0].token().as_str(), "stale-token");
    }

    #[test]
    fn test_oversized_token_is_treated_as_absent() {
        let store = SessionStore::new();
        let long = "x".repeat(MAX_TOKEN_LEN + 1);
        let a = store.resolve(Some(&long));
        let b = store.resolve(Some(&long));
        assert!(!Arc::ptr_eq(&a.session, &b.session));
    }

    #[test]
    fn test_reset_is_idempotent() {
        let store = SessionStore::new();
        let resolved = store.resolve(Some("old"));
        let token = resolved.session.token().as_str().to_string();

        assert!(store.reset(&token));
        assert!(resolved.session.is_closed());
        assert!(store.is_empty());
        assert!(!store.reset(&token));
        assert!(!store.reset("never-issued"));

        // The rebinding went away with its session.
        let fresh = store.resolve(Some("old"));
        assert!(!Arc::ptr_eq(&fresh.session, &resolved.session));
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let store = SessionStore::new();
        store.resolve(None);
        store.resolve(None);

        let mut released = 0;
        assert_eq!(store.sweep_expired(Duration::from_secs(3600), |_| released += 1), 0);
        assert_eq!(released, 0);

        std::thread::sleep(Duration::from_millis(5));
        let removed = store.sweep_expired(Duration::ZERO, |session| {
            session.close();
            released += 1;
        });
        assert_eq!(removed, 2);
        assert_eq!(released, 2);
        assert!(store.is_empty());
    }

    #[test]
    fn test_resolve_refreshes_activity() {
        let store = SessionStore::new();
        let active = store.resolve(None).session;
        let rebound = store.resolve(Some("stale-token")).session;
        store.resolve(None);

        std::thread::sleep(Duration::from_millis(30));
        assert!(active.idle_for() >= Duration::from_millis(30));

        let again = store.resolve(Some(active.token().as_str()));
        assert!(again.session.idle_for() < Duration::from_millis(20));
        store.resolve(Some("stale-token"));
        assert!(rebound.idle_for() < Duration::from_millis(20));

        let removed = store.sweep_expired(Duration::from_millis(20), |s| s.close());
        assert_eq!(removed, 1);
        assert!(store.get(active.token().as_str()).is_some());
        assert!(store.get("stale-token").is_some());
    }

    #[test]
    fn test_touch_keeps_session_alive() {
        let store = SessionStore::new();
        let active = store.resolve(None).session;
        store.resolve(None);

        std::thread::sleep(Duration::from_millis(30));
        store.touch(&active);
        let removed = store.sweep_expired(Duration::from_millis(20), |s| s.close());
        assert_eq!(removed, 1);
        assert!(store.get(active.token().as_str()).is_some());
    }
}
