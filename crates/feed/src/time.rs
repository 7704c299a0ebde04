use chrono::{DateTime, TimeZone, Utc};

/// Coarse "how long ago" label. Anything older than a week shows its date.
#[must_use]
pub fn relative_time_label(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = now.signed_duration_since(then);
    let minutes = elapsed.num_minutes();
    if minutes < 1 {
        return "just now".to_string();
    }
    if minutes < 60 {
        return format!("{minutes}m ago");
    }
    let hours = elapsed.num_hours();
    if hours < 24 {
        return format!("{hours}h ago");
    }
    let days = elapsed.num_days();
    if days < 7 {
        return format!("{days}d ago");
    }
    then.format("%b %-d, %Y").to_string()
}

/// Record timestamp: the author's `createdAt` when it parses, otherwise when
/// the record was indexed.
#[must_use]
pub fn record_timestamp(created_at: Option<&str>, indexed_at_ms: u64) -> DateTime<Utc> {
    created_at
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .or_else(|| {
            i64::try_from(indexed_at_ms)
                .ok()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        })
        .unwrap_or_default()
}
