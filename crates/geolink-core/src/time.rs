//! UTC time helpers: ISO-8601 with trailing `Z`, epoch-millisecond
//! conversions, and alignment-interval parsing.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

/// Current UTC instant as ISO-8601 with a trailing `Z`.
pub fn utc_now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Compact run identifier, e.g. `20200101_000000`.
pub fn utc_run_id() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Parse an ISO-8601 UTC timestamp into epoch milliseconds.
pub fn parse_utc_ms(text: &str) -> Result<i64> {
    let parsed = DateTime::parse_from_rfc3339(text.trim())
        .with_context(|| format!("parsing UTC timestamp '{text}'"))?;
    Ok(parsed.with_timezone(&Utc).timestamp_millis())
}

/// Epoch milliseconds to ISO-8601 UTC with a trailing `Z`.
pub fn ms_to_iso(ts_ms: i64) -> String {
    match Utc.timestamp_millis_opt(ts_ms).single() {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => format!("invalid({ts_ms})"),
    }
}

/// Epoch milliseconds to a UTC calendar date `YYYY-MM-DD`.
pub fn ms_to_date(ts_ms: i64) -> String {
    match Utc.timestamp_millis_opt(ts_ms).single() {
        Some(dt) => dt.format("%Y-%m-%d").to_string(),
        None => "unknown".to_string(),
    }
}

/// Parse an alignment interval like `1min`, `30s`, `2h`, or a bare number
/// of seconds, into milliseconds.
pub fn parse_interval_ms(rule: &str) -> Result<i64> {
    let trimmed = rule.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("alignment interval cannot be empty"));
    }
    let split = trimmed
        .find(|ch: char| ch.is_ascii_alphabetic())
        .unwrap_or(trimmed.len());
    let (value_str, unit) = trimmed.split_at(split);
    let value: i64 = value_str
        .trim()
        .parse()
        .with_context(|| format!("parsing interval duration '{rule}'"))?;
    let multiplier_ms = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "s" | "sec" => 1_000,
        "ms" => 1,
        "m" | "min" => 60_000,
        "h" | "hr" => 3_600_000,
        other => {
            return Err(anyhow!(
                "unsupported interval unit '{other}'; expected ms/s/min/h"
            ));
        }
    };
    let interval = value * multiplier_ms;
    if interval <= 0 {
        return Err(anyhow!("alignment interval must be positive, got '{rule}'"));
    }
    Ok(interval)
}
