// Download progress of a session's selected item.

use serde::Serialize;

use super::session::Session;
use crate::source::traits::ContentItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Downloading,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Progress {
    pub progress: f64,
    pub phase: Phase,
}

impl Progress {
    pub const IDLE: Progress = Progress {
        progress: 0.0,
        phase: Phase::Idle,
    };
}

/// Percent complete of `item`, clamped to `[0, 100]`. Zero while the length is unknown.
pub fn percent_of(item: &dyn ContentItem) -> f64 {
    let total = item.length();
    if total == 0 {
        return 0.0;
    }
    let percent = item.bytes_completed() as f64 * 100.0 / total as f64;
    percent.clamp(0.0, 100.0)
}

pub fn compute_item(item: Option<&dyn ContentItem>) -> Progress {
    let Some(item) = item else {
        return Progress::IDLE;
    };
    let progress = percent_of(item);
    // An item selected but not yet started still counts as downloading.
    let phase = if progress >= 100.0 {
        Phase::Completed
    } else {
        Phase::Downloading
    };
    Progress { progress, phase }
}

/// Pure read; safe to call from any number of pollers.
pub fn compute(session: &Session) -> Progress {
    let selected = session.selected_item();
    compute_item(selected.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::session::SessionToken;
    use crate::source::memory::{MemoryItem, MemorySource};
    use crate::source::traits::ContentSource;
    use std::sync::Arc;

    struct FixedItem {
        length: u64,
        completed: u64,
    }

    impl ContentItem for FixedItem {
        fn path(&self) -> &str {
            "fixed.mp4"
        }
        fn length(&self) -> u64 {
            self.length
        }
        fn bytes_completed(&self) -> u64 {
            self.completed
        }
        fn download(&self) {}
        fn open_cursor(&self) -> Box<dyn crate::source::traits::ItemCursor> {
            MemoryItem::new("fixed.mp4", Vec::new()).open_cursor()
        }
    }

    #[test]
    fn test_idle_without_item() {
        assert_eq!(compute_item(None), Progress::IDLE);
        let session = Session::new(SessionToken::generate());
        assert_eq!(compute(&session), Progress::IDLE);
    }

    #[test]
    fn test_zero_length_is_zero_percent() {
        let item = FixedItem {
            length: 0,
            completed: 10,
        };
        let p = compute_item(Some(&item));
        assert_eq!(p.progress, 0.0);
        assert_eq!(p.phase, Phase::Downloading);
    }

    #[test]
    fn test_over_report_is_clamped() {
        let item = FixedItem {
            length: 100,
            completed: 150,
        };
        let p = compute_item(Some(&item));
        assert_eq!(p.progress, 100.0);
        assert_eq!(p.phase, Phase::Completed);
    }

    #[test]
    fn test_phase_serialises_lowercase() {
        let json = serde_json::to_value(Progress::IDLE).unwrap();
        assert_eq!(json["phase"], "idle");
        assert_eq!(json["progress"], 0.0);
    }

    #[tokio::test]
    async fn test_monotonic_under_concurrent_polling() {
        let item = MemoryItem::new("movie.mp4", vec![0u8; 1000]);
        let source = MemorySource::new();
        source.insert("id", "movie", vec![item.clone()]);
        let content = source.resolve("id").await.unwrap();
        let selected = content.items().remove(0);

        let session = Arc::new(Session::new(SessionToken::generate()));
        assert!(session.attach(content, Some(selected), Vec::new(), "Ready".into()));

        let pollers: Vec<_> = (0..4)
            .map(|_| {
                let session = Arc::clone(&session);
                tokio::spawn(async move {
                    let mut last = 0.0;
                    loop {
                        let p = compute(&session);
                        assert!(p.progress >= last, "{} < {}", p.progress, last);
                        last = p.progress;
                        if p.phase == Phase::Completed {
                            return;
                        }
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        for upto in (0..=1000).step_by(50) {
            item.deliver(upto);
            tokio::task::yield_now().await;
        }
        for poller in pollers {
            poller.await.unwrap();
        }
        assert_eq!(compute(&session).phase, Phase::Completed);
    }
}
