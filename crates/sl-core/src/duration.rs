//! ISO-8601 durations (`P1D`, `PT12H`, `P1Y2M3DT4H5M6S`, `P2W`) and the
//! human wording used in notices ("1 day and 2 hours").
//!
//! Years count as 365 days and months as 30 days; thresholds are compared
//! against absolute timestamps so calendar precision is not needed.

use chrono::Duration;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("not an ISO-8601 duration: {0:?}")]
pub struct DurationError(pub String);

static ISO_DURATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^P(?:(\d+)Y)?(?:(\d+)M)?(?:(\d+)W)?(?:(\d+)D)?(?:T(?:(\d+)H)?(?:(\d+)M)?(?:(\d+(?:\.\d+)?)S)?)?$",
    )
    .expect("duration pattern is valid")
});

pub fn parse_iso8601(raw: &str) -> Result<Duration, DurationError> {
    let text = raw.trim().to_ascii_uppercase();
    let invalid = || DurationError(raw.to_string());

    let caps = ISO_DURATION.captures(&text).ok_or_else(invalid)?;
    // "P" and "PT" match the pattern but carry no component.
    if caps.iter().skip(1).all(|c| c.is_none()) || text.ends_with('T') {
        return Err(invalid());
    }

    let unit = |idx: usize| -> Result<i64, DurationError> {
        caps.get(idx)
            .map(|m| m.as_str().parse::<i64>().map_err(|_| invalid()))
            .transpose()
            .map(|v| v.unwrap_or(0))
    };

    let days = [(unit(1)?, 365), (unit(2)?, 30), (unit(3)?, 7), (unit(4)?, 1)]
        .into_iter()
        .try_fold(0i64, |total, (count, per)| {
            count.checked_mul(per).and_then(|d| total.checked_add(d))
        })
        .ok_or_else(invalid)?;
    let seconds = caps
        .get(7)
        .map(|m| m.as_str().parse::<f64>().map_err(|_| invalid()))
        .transpose()?
        .unwrap_or(0.0);

    let (hours, minutes) = (unit(5)?, unit(6)?);
    let millis = (seconds * 1000.0).round();
    if !millis.is_finite() || millis >= i64::MAX as f64 {
        return Err(invalid());
    }
    let millis = millis as i64;

    Duration::try_days(days)
        .zip(Duration::try_hours(hours))
        .and_then(|(d, h)| d.checked_add(&h))
        .zip(Duration::try_minutes(minutes))
        .and_then(|(d, m)| d.checked_add(&m))
        .zip(Duration::try_milliseconds(millis))
        .and_then(|(d, ms)| d.checked_add(&ms))
        .ok_or_else(invalid)
}

/// Renders a span the way notices word it: up to three units, largest first.
pub fn humanize(span: Duration) -> String {
    let mut secs = span.num_seconds().abs();
    if secs == 0 {
        return "a moment".to_string();
    }

    const UNITS: [(&str, i64); 6] = [
        ("year", 365 * 86_400),
        ("month", 30 * 86_400),
        ("day", 86_400),
        ("hour", 3_600),
        ("minute", 60),
        ("second", 1),
    ];

    let mut parts = Vec::new();
    for (name, size) in UNITS {
        let count = secs / size;
        if count > 0 {
            secs -= count * size;
            let plural = if count == 1 { "" } else { "s" };
            parts.push(format!("{count} {name}{plural}"));
        }
        if parts.len() == 3 {
            break;
        }
    }

    match parts.len() {
        1 => parts.remove(0),
        _ => {
            let last = parts.pop().unwrap_or_default();
            format!("{} and {last}", parts.join(", "))
        }
    }
}
