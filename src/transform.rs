//! Merges exporter outputs into one snapshot.

use chrono::{SecondsFormat, Utc};

use crate::model::{GpuMetrics, NodeMetrics, SystemMetrics};

/// Builds a snapshot from whatever the exporters produced this cycle.
///
/// Missing node facts become zero-valued CPU/memory and an empty disk list.
/// A missing GPU stays `None`: "no GPU" is not the same as "GPU idle".
/// Timestamp and hostname are taken now, not at scrape time.
pub fn transform_metrics(node: Option<NodeMetrics>, gpu: Option<GpuMetrics>) -> SystemMetrics {
    let node = node.unwrap_or_default();

    SystemMetrics {
        timestamp: current_timestamp(),
        hostname: current_hostname(),
        cpu: node.cpu,
        memory: node.memory,
        disks: node.disks,
        gpu,
    }
}

/// Current UTC time in RFC 3339 form, e.g. `2026-10-19T08:30:00.123456+00:00`.
pub fn current_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// System hostname, or `"unknown"` if it cannot be determined.
pub fn current_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}
