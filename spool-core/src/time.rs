// ABOUTME: Millisecond timestamp helpers shared by every table in the store.
// ABOUTME: Timestamps are persisted as UTC epoch milliseconds so range queries stay numeric.

use chrono::{DateTime, Utc};

/// Convert a UTC instant to epoch milliseconds for storage
pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Convert stored epoch milliseconds back to a UTC instant
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub fn from_millis_opt(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_millis)
}

/// Truncate text to at most `max` characters, appending an ellipsis when cut
pub fn preview(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push('…');
    out
}
