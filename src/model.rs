//! Snapshot types exchanged with the remote collector.
//!
//! Optional fields are skipped when absent rather than serialized as `null`;
//! the receiving side relies on that.

use serde::{Deserialize, Serialize};

/// CPU facts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuMetrics {
    pub usage_percent: f64,
    pub load_1m: f64,
    pub load_5m: f64,
    pub load_15m: f64,
    pub cores: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_celsius: Option<f64>,
}

/// Memory facts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryMetrics {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub usage_percent: f64,
}

/// Per-mount filesystem facts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskMetrics {
    pub mountpoint: String,
    pub device: String,
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub usage_percent: f64,
}

/// Facts for the first reported GPU.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuMetrics {
    pub utilization_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub memory_usage_percent: f64,
    pub temperature_celsius: f64,
    pub power_watts: f64,
}

/// Everything the node exporter contributes to a snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeMetrics {
    pub cpu: CpuMetrics,
    pub memory: MemoryMetrics,
    /// Sorted by mountpoint.
    pub disks: Vec<DiskMetrics>,
}

/// One collection cycle, as sent to the endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    /// RFC 3339 timestamp in UTC.
    pub timestamp: String,
    pub hostname: String,
    pub cpu: CpuMetrics,
    pub memory: MemoryMetrics,
    pub disks: Vec<DiskMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<GpuMetrics>,
}

impl SystemMetrics {
    /// Serializes the snapshot to a JSON value.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Computes `used / total * 100`, or 0 when `total` is 0.
pub fn usage_percent(total: u64, available: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (total as f64 - available as f64) / total as f64 * 100.0
}

/// Rounds `value` to `places` decimal places.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(gpu: Option<GpuMetrics>, temperature: Option<f64>) -> SystemMetrics {
        SystemMetrics {
            timestamp: "2026-01-01T00:00:00+00:00".to_string(),
            hostname: "kiosk-01".to_string(),
            cpu: CpuMetrics {
                usage_percent: 12.5,
                cores: 4,
                temperature_celsius: temperature,
                ..CpuMetrics::default()
            },
            memory: MemoryMetrics::default(),
            disks: vec![DiskMetrics {
                mountpoint: "/".to_string(),
                device: "/dev/sda1".to_string(),
                total_bytes: 100,
                available_bytes: 25,
                usage_percent: 75.0,
            }],
            gpu,
        }
    }

    #[test]
    fn test_absent_gpu_is_omitted() {
        let json = serde_json::to_string(&snapshot(None, Some(40.0))).unwrap();
        assert!(!json.contains("\"gpu\""));
        assert!(json.contains("\"temperature_celsius\":40.0"));
    }

    #[test]
    fn test_absent_cpu_temperature_is_omitted() {
        let value = snapshot(Some(GpuMetrics::default()), None).to_json();
        assert!(value["cpu"].get("temperature_celsius").is_none());
        assert!(value.get("gpu").is_some());
        assert_eq!(value["gpu"]["temperature_celsius"], 0.0);
    }

    #[test]
    fn test_json_shape() {
        let value = snapshot(None, None).to_json();
        assert_eq!(value["hostname"], "kiosk-01");
        assert_eq!(value["cpu"]["cores"], 4);
        assert_eq!(value["disks"][0]["mountpoint"], "/");
        assert_eq!(value["disks"][0]["available_bytes"], 25);
        assert!(value["memory"].get("total_bytes").is_some());
    }

    #[test]
    fn test_usage_percent() {
        assert_eq!(usage_percent(0, 0), 0.0);
        assert_eq!(usage_percent(200, 50), 75.0);
        assert_eq!(usage_percent(100, 100), 0.0);
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(33.33333, 2), 33.33);
        assert_eq!(round_to(52.04, 1), 52.0);
    }
}
