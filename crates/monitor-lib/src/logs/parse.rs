//! Line parsing helpers for the log collector

use crate::models::LogLevel;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

const FALLBACK_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Split a runtime-timestamped line into its timestamp and message.
///
/// Lines without a parseable leading RFC 3339 timestamp keep the whole
/// text as the message and are stamped with `now`.
pub fn split_timestamped_line(line: &str, now: DateTime<Utc>) -> (DateTime<Utc>, &str) {
    let Some((prefix, rest)) = line.split_once(' ') else {
        return (now, line);
    };
    match DateTime::parse_from_rfc3339(prefix) {
        Ok(ts) => (ts.with_timezone(&Utc), rest.trim_start()),
        Err(_) => (now, line),
    }
}

/// Case-insensitive prefix match against the fixed level vocabulary
pub fn infer_level(message: &str) -> Option<LogLevel> {
    let lower = message.trim().to_ascii_lowercase();
    [
        ("error", LogLevel::Error),
        ("warn", LogLevel::Warn),
        ("info", LogLevel::Info),
        ("debug", LogLevel::Debug),
        ("fatal", LogLevel::Fatal),
    ]
    .into_iter()
    .find(|(prefix, _)| lower.starts_with(prefix))
    .map(|(_, level)| level)
}

/// `base` shifted by a uniform offset in `[-jitter, +jitter]`, never negative
pub fn with_jitter(base: Duration, jitter: Duration) -> Duration {
    let base = if base.is_zero() {
        FALLBACK_RECONNECT_DELAY
    } else {
        base
    };
    let jitter_ms = jitter.as_millis() as i64;
    if jitter_ms == 0 {
        return base;
    }
    let offset = rand::thread_rng().gen_range(-jitter_ms..=jitter_ms);
    let millis = (base.as_millis() as i64 + offset).max(0);
    Duration::from_millis(millis as u64)
}
