use std::{cmp::Ordering, future::Future, time::Duration};

use crate::{Error, Result};

// ============== Deadlines ==============

/// Run an external call with a deadline.
pub async fn bounded<T, F>(timeout: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(Error::Timeout {
            what: what.to_string(),
            secs: timeout.as_secs(),
        }),
    }
}

// ============== Text Helpers ==============

pub const REPLY_ELLIPSIS: &str = "...";

/// Enforce the hard reply cap.
///
/// Text within `max_chars` is returned unchanged. Longer text keeps its first
/// `keep_chars` characters followed by `...`.
pub fn enforce_reply_cap(text: &str, max_chars: usize, keep_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(keep_chars).collect();
    out.push_str(REPLY_ELLIPSIS);
    out
}

/// Shorten text for log lines.
pub fn preview(s: &str, max_chars: usize) -> String {
    let one_line = s.replace('\n', " ");
    if one_line.chars().count() <= max_chars {
        return one_line;
    }
    let mut out: String = one_line.chars().take(max_chars).collect();
    out.push('…');
    out
}

/// Order post ids numerically; falls back to length-then-lexicographic order.
pub fn cmp_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u128>(), b.parse::<u128>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => (a.len(), a).cmp(&(b.len(), b)),
    }
}
