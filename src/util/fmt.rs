//! Human-readable durations for status output.

/// Formats an uptime: `"2h 5m 3s"`, `"5m 3s"` or `"3s"`.
pub fn format_uptime(secs: i64) -> String {
    let secs = secs.max(0);
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Formats the age of an event: `"12s ago"`, `"4m ago"`, `"3h ago"`.
pub fn format_ago(secs: i64) -> String {
    let secs = secs.max(0);
    if secs < 60 {
        format!("{}s ago", secs)
    } else if secs < 3600 {
        format!("{}m ago", secs / 60)
    } else {
        format!("{}h ago", secs / 3600)
    }
}
