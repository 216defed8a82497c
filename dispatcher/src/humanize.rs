//! Short human-readable renderings of latencies for log lines.

use chrono::Duration;

/// `850.25ms`, or seconds once past one second.
pub fn millis(ms: f64) -> String {
    if ms > 1000.0 {
        format!("{}s", round2(ms / 1000.0))
    } else {
        format!("{}ms", round2(ms))
    }
}

/// `640us`, or milliseconds once past one millisecond.
pub fn micros(us: f64) -> String {
    if us > 1000.0 {
        format!("{}ms", round2(us / 1000.0))
    } else {
        format!("{}us", us)
    }
}

pub fn duration(d: Duration) -> String {
    let ms = d
        .num_microseconds()
        .map(|us| us as f64 / 1000.0)
        .unwrap_or_else(|| d.num_milliseconds() as f64);
    millis(ms)
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
