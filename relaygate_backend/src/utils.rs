//! Shared helpers and constants.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::future::Future;
use std::time::Duration;

pub const APP_NAME: &str = "relaygate_backend";

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Current unix time in seconds.
pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}

/// Time remaining until the next UTC midnight, which is when the store
/// provider resets its daily quota.
pub fn until_next_utc_midnight(now: DateTime<Utc>) -> Duration {
    let tomorrow = now.date_naive() + ChronoDuration::days(1);
    let midnight = tomorrow
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(now + ChronoDuration::days(1));
    (midnight - now)
        .to_std()
        .unwrap_or_else(|_| Duration::from_secs(24 * 60 * 60))
}

/// Truncates `text` to at most `max_chars` characters without splitting a
/// code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Runs work that the triggering request does not wait on. Failures are
/// logged and otherwise dropped.
pub fn spawn_background<F, E>(label: &'static str, fut: F)
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: std::fmt::Debug + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = fut.await {
            tracing::warn!(task = label, error = ?err, "background task failed");
        }
    });
}
