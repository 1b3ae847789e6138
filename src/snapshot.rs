use tracing::warn;

use crate::config::AgentConfig;
use crate::driver::BrowserSession;

pub const TRUNCATION_MARKER: &str = "\n...[truncated]...";

/// Cut `text` to at most `limit` characters, appending [`TRUNCATION_MARKER`] when cut.
pub fn truncate_text(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        None => text.to_string(),
        Some((end, _)) => format!("{}{}", &text[..end], TRUNCATION_MARKER),
    }
}

/// Size-bounded page content for the planner. Empty when disabled or unavailable.
pub async fn capture_page_snapshot(session: &mut dyn BrowserSession, config: &AgentConfig) -> String {
    if !config.capture_dom_snapshot {
        return String::new();
    }
    match session.content().await {
        Ok(html) => truncate_text(&html, config.snapshot_max_chars),
        Err(e) => {
            warn!(error = %e, "page snapshot unavailable");
            String::new()
        }
    }
}

/// Current URL and title; each falls back to a placeholder when the page will not say.
pub async fn page_location(session: &mut dyn BrowserSession) -> (String, String) {
    let url = session.url().await.unwrap_or_else(|e| {
        warn!(error = %e, "page url unavailable");
        "unknown".to_string()
    });
    let title = session.title().await.unwrap_or_else(|e| {
        warn!(error = %e, "page title unavailable");
        "untitled".to_string()
    });
    (url, title)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSession;

    #[test]
    fn short_text_is_untouched() {
        assert_eq!(truncate_text("hello", 8), "hello");
        assert_eq!(truncate_text("hello", 5), "hello");
    }

    #[test]
    fn long_text_is_cut_on_char_boundaries() {
        let cut = truncate_text("héllo wörld", 4);
        assert_eq!(cut, format!("héll{TRUNCATION_MARKER}"));
    }

    #[tokio::test]
    async fn snapshot_is_bounded() {
        let mut session = FakeSession::new();
        session.state().content = "x".repeat(50);
        let config = AgentConfig {
            snapshot_max_chars: 10,
            ..AgentConfig::default()
        };

        let snapshot = capture_page_snapshot(&mut session, &config).await;
        assert_eq!(snapshot, format!("{}{}", "x".repeat(10), TRUNCATION_MARKER));
    }

    #[tokio::test]
    async fn snapshot_failure_yields_empty() {
        let mut session = FakeSession::new();
        session.state().fail_content = true;

        let snapshot = capture_page_snapshot(&mut session, &AgentConfig::default()).await;
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn disabled_snapshot_skips_the_page() {
        let mut session = FakeSession::new();
        let config = AgentConfig {
            capture_dom_snapshot: false,
            ..AgentConfig::default()
        };

        assert!(capture_page_snapshot(&mut session, &config).await.is_empty());
        assert!(session.calls().is_empty());
    }
}
