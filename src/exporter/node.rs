//! Node exporter client: scrapes the local exposition endpoint and derives
//! CPU, memory and disk facts.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use tracing::{debug, warn};

use crate::exporter::Exporter;
use crate::exporter::rates::{CPU_SECONDS_METRIC, CpuRateState};
use crate::model::{
    CpuMetrics, DiskMetrics, MemoryMetrics, NodeMetrics, round_to, usage_percent,
};
use crate::parser::{Sample, SampleSet, parse_exposition};

/// Filesystem types that never represent real storage.
const PSEUDO_FILESYSTEMS: &[&str] = &["tmpfs", "devtmpfs", "squashfs", "overlay", "devfs", "nullfs"];

/// Mountpoint prefixes reserved by the OS.
const SYSTEM_MOUNT_PREFIXES: &[&str] = &["/sys", "/proc", "/dev", "/run", "/snap"];

/// Chip names of common CPU temperature drivers.
const CPU_SENSOR_CHIPS: &[&str] = &["coretemp", "k10temp"];

/// Client for a node exporter `/metrics` endpoint.
pub struct NodeExporter {
    url: String,
    timeout: Duration,
    client: Option<Client>,
    cpu_rate: CpuRateState,
}

impl NodeExporter {
    /// Creates a client for `url`. The HTTP client is built on first use.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
            client: None,
            cpu_rate: CpuRateState::new(),
        }
    }

    fn client(&mut self) -> Result<&Client, reqwest::Error> {
        let client = match self.client.take() {
            Some(client) => client,
            None => Client::builder().timeout(self.timeout).build()?,
        };
        Ok(self.client.insert(client))
    }

    /// Fetches and parses the endpoint. Any failure yields `None`.
    pub fn scrape(&mut self) -> Option<SampleSet> {
        let url = self.url.clone();
        let result = self
            .client()
            .and_then(|client| client.get(&url).send())
            .and_then(|response| response.error_for_status())
            .and_then(|response| response.text());

        match result {
            Ok(text) => Some(parse_exposition(&text)),
            Err(e) => {
                debug!("Scrape of {} failed: {}", url, e);
                None
            }
        }
    }

    /// Derives all node facts from a scrape, advancing the CPU rate state.
    pub fn derive(&mut self, samples: &SampleSet) -> NodeMetrics {
        let usage = self.cpu_rate.update(samples);
        NodeMetrics {
            cpu: cpu_metrics(samples, usage),
            memory: memory_metrics(samples),
            disks: disk_metrics(samples),
        }
    }
}

impl Exporter for NodeExporter {
    type Metrics = NodeMetrics;

    fn name(&self) -> &str {
        "node_exporter"
    }

    fn is_available(&mut self) -> bool {
        let url = self.url.clone();
        match self.client().and_then(|client| client.get(&url).send()) {
            Ok(response) => response.status() == StatusCode::OK,
            Err(e) => {
                debug!("Node exporter at {} unavailable: {}", url, e);
                false
            }
        }
    }

    fn fetch_metrics(&mut self) -> Option<NodeMetrics> {
        let Some(samples) = self.scrape() else {
            warn!("Failed to collect metrics from node exporter at {}", self.url);
            return None;
        };
        Some(self.derive(&samples))
    }
}

/// Builds CPU facts from a scrape and an already computed usage percentage.
pub fn cpu_metrics(samples: &SampleSet, usage: f64) -> CpuMetrics {
    let load = |name| samples.metric_value(name).unwrap_or(0.0);

    CpuMetrics {
        usage_percent: round_to(usage, 2),
        load_1m: round_to(load("node_load1"), 2),
        load_5m: round_to(load("node_load5"), 2),
        load_15m: round_to(load("node_load15"), 2),
        cores: core_count(samples),
        temperature_celsius: cpu_temperature(samples).map(|t| round_to(t, 1)),
    }
}

/// Number of distinct `cpu` labels on the CPU counter, at least 1.
pub fn core_count(samples: &SampleSet) -> u32 {
    let mut ids: Vec<&str> = samples
        .metrics_by_name(CPU_SECONDS_METRIC)
        .filter_map(|s| s.label("cpu"))
        .collect();
    ids.sort_unstable();
    ids.dedup();
    (ids.len() as u32).max(1)
}

/// Picks a CPU temperature from hwmon samples.
///
/// A sensor whose chip or sensor name looks CPU-related wins; otherwise the
/// first hwmon reading is used, whatever it measures.
pub fn cpu_temperature(samples: &SampleSet) -> Option<f64> {
    let readings: Vec<&Sample> = samples.metrics_by_name("node_hwmon_temp_celsius").collect();

    readings
        .iter()
        .find(|s| {
            let chip = s.label("chip").unwrap_or("");
            let sensor = s.label("sensor").unwrap_or("").to_lowercase();
            CPU_SENSOR_CHIPS.iter().any(|c| chip.contains(c)) || sensor.contains("cpu")
        })
        .or_else(|| readings.first())
        .map(|s| s.value)
}

pub fn memory_metrics(samples: &SampleSet) -> MemoryMetrics {
    let total = to_bytes(samples.metric_value("node_memory_MemTotal_bytes").unwrap_or(0.0));
    let available = to_bytes(
        samples
            .metric_value("node_memory_MemAvailable_bytes")
            .unwrap_or(0.0),
    );

    MemoryMetrics {
        total_bytes: total,
        available_bytes: available,
        usage_percent: round_to(usage_percent(total, available), 2),
    }
}

/// Per-mount disk facts, skipping pseudo filesystems and OS mounts, sorted by
/// mountpoint.
pub fn disk_metrics(samples: &SampleSet) -> Vec<DiskMetrics> {
    // mountpoint → (device, total)
    let mut mounts: HashMap<&str, (&str, u64)> = HashMap::new();

    for (labels, size) in samples.all_values("node_filesystem_size_bytes") {
        let mountpoint = labels.get("mountpoint").map(String::as_str).unwrap_or("");
        let device = labels.get("device").map(String::as_str).unwrap_or("");
        let fstype = labels.get("fstype").map(String::as_str).unwrap_or("");

        if PSEUDO_FILESYSTEMS.contains(&fstype) {
            continue;
        }
        if SYSTEM_MOUNT_PREFIXES.iter().any(|p| mountpoint.starts_with(p)) {
            continue;
        }
        if mountpoint.is_empty() || size.is_nan() || size <= 0.0 {
            continue;
        }
        mounts.insert(mountpoint, (device, to_bytes(size)));
    }

    let mut available: HashMap<&str, u64> = HashMap::new();
    for (labels, avail) in samples.all_values("node_filesystem_avail_bytes") {
        if let Some(mountpoint) = labels.get("mountpoint") {
            available.insert(mountpoint.as_str(), to_bytes(avail));
        }
    }

    let mut disks: Vec<DiskMetrics> = mounts
        .into_iter()
        .map(|(mountpoint, (device, total))| {
            let avail = available.get(mountpoint).copied().unwrap_or(0);
            DiskMetrics {
                mountpoint: mountpoint.to_string(),
                device: device.to_string(),
                total_bytes: total,
                available_bytes: avail,
                usage_percent: round_to(usage_percent(total, avail), 2),
            }
        })
        .collect();
    disks.sort_by(|a, b| a.mountpoint.cmp(&b.mountpoint));
    disks
}

/// Converts a gauge value to whole bytes; negative and NaN become 0.
fn to_bytes(value: f64) -> u64 {
    if value.is_nan() || value <= 0.0 {
        0
    } else {
        value as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::mock::{TYPICAL_NODE_SCRAPE, TestServer, refused_url};

    fn typical() -> SampleSet {
        parse_exposition(TYPICAL_NODE_SCRAPE)
    }

    #[test]
    fn test_cpu_metrics_from_typical_scrape() {
        let cpu = cpu_metrics(&typical(), 0.0);
        assert_eq!(cpu.cores, 2);
        assert_eq!(cpu.load_1m, 1.5);
        assert_eq!(cpu.load_5m, 1.2);
        assert_eq!(cpu.load_15m, 0.9);
        assert_eq!(cpu.temperature_celsius, Some(52.0));
    }

    #[test]
    fn test_core_count_defaults_to_one() {
        assert_eq!(core_count(&parse_exposition("node_load1 1\n")), 1);
    }

    #[test]
    fn test_temperature_falls_back_to_first_reading() {
        let samples = parse_exposition(
            "node_hwmon_temp_celsius{chip=\"nvme\",sensor=\"temp1\"} 41\n\
             node_hwmon_temp_celsius{chip=\"acpitz\",sensor=\"temp2\"} 45\n",
        );
        assert_eq!(cpu_temperature(&samples), Some(41.0));
    }

    #[test]
    fn test_temperature_matches_cpu_sensor_name() {
        let samples = parse_exposition(
            "node_hwmon_temp_celsius{chip=\"nvme\",sensor=\"temp1\"} 41\n\
             node_hwmon_temp_celsius{chip=\"thermal\",sensor=\"CPU_Package\"} 60\n",
        );
        assert_eq!(cpu_temperature(&samples), Some(60.0));
    }

    #[test]
    fn test_temperature_absent_without_hwmon() {
        assert_eq!(cpu_temperature(&parse_exposition("node_load1 1\n")), None);
        assert_eq!(cpu_metrics(&parse_exposition(""), 0.0).temperature_celsius, None);
    }

    #[test]
    fn test_memory_metrics() {
        let memory = memory_metrics(&typical());
        assert_eq!(memory.total_bytes, 17179869184);
        assert_eq!(memory.available_bytes, 8589934592);
        assert_eq!(memory.usage_percent, 50.0);

        let empty = memory_metrics(&parse_exposition(""));
        assert_eq!(empty.usage_percent, 0.0);
    }

    #[test]
    fn test_disk_metrics_filter_and_sort() {
        let disks = disk_metrics(&typical());
        let mounts: Vec<&str> = disks.iter().map(|d| d.mountpoint.as_str()).collect();
        assert_eq!(mounts, vec!["/", "/home"]);
        assert_eq!(disks[0].device, "/dev/sda1");
        assert_eq!(disks[0].usage_percent, 50.0);
    }

    #[test]
    fn test_disk_without_available_sample_reports_zero() {
        let samples = parse_exposition(
            "node_filesystem_size_bytes{device=\"/dev/sdb1\",fstype=\"xfs\",mountpoint=\"/data\"} 1000\n",
        );
        let disks = disk_metrics(&samples);
        assert_eq!(disks.len(), 1);
        assert_eq!(disks[0].available_bytes, 0);
        assert_eq!(disks[0].usage_percent, 100.0);
    }

    #[test]
    fn test_disk_skips_system_mounts() {
        let samples = parse_exposition(
            "node_filesystem_size_bytes{device=\"/dev/loop0\",fstype=\"ext4\",mountpoint=\"/snap/core/1\"} 1000\n\
             node_filesystem_size_bytes{device=\"sysfs\",fstype=\"ext4\",mountpoint=\"/sys/fs\"} 1000\n\
             node_filesystem_size_bytes{device=\"/dev/sdc\",fstype=\"ext4\",mountpoint=\"\"} 1000\n\
             node_filesystem_size_bytes{device=\"/dev/sdd\",fstype=\"ext4\",mountpoint=\"/empty\"} 0\n",
        );
        assert!(disk_metrics(&samples).is_empty());
    }

    #[test]
    fn test_disk_skips_non_numeric_size() {
        let samples = parse_exposition(
            "node_filesystem_size_bytes{device=\"/dev/sde\",fstype=\"ext4\",mountpoint=\"/nan\"} NaN\n\
             node_filesystem_size_bytes{device=\"/dev/sdf\",fstype=\"ext4\",mountpoint=\"/neg\"} -Inf\n",
        );
        assert!(disk_metrics(&samples).is_empty());
    }

    #[test]
    fn test_derive_tracks_rate_across_polls() {
        let mut exporter = NodeExporter::new("http://unused", Duration::from_secs(1));
        let first = exporter.derive(&typical());
        assert_eq!(first.cpu.usage_percent, 0.0);

        let second = parse_exposition(
            "node_cpu_seconds_total{cpu=\"0\",mode=\"idle\"} 10010.5\n\
             node_cpu_seconds_total{cpu=\"0\",mode=\"system\"} 510.2\n\
             node_cpu_seconds_total{cpu=\"0\",mode=\"user\"} 1500.3\n\
             node_cpu_seconds_total{cpu=\"1\",mode=\"idle\"} 9810.1\n\
             node_cpu_seconds_total{cpu=\"1\",mode=\"system\"} 610.4\n\
             node_cpu_seconds_total{cpu=\"1\",mode=\"user\"} 1700.5\n",
        );
        let next = exporter.derive(&second);
        assert_eq!(next.cpu.usage_percent, 50.0);
    }

    #[test]
    fn test_fetch_metrics_over_http() {
        let server = TestServer::start(200, TYPICAL_NODE_SCRAPE);
        let mut exporter = NodeExporter::new(server.url.clone(), Duration::from_secs(2));

        assert!(exporter.is_available());
        let metrics = exporter.fetch_metrics().unwrap();
        assert_eq!(metrics.cpu.cores, 2);
        assert_eq!(metrics.disks.len(), 2);
    }

    #[test]
    fn test_unavailable_endpoint_is_not_an_error() {
        let mut exporter = NodeExporter::new(refused_url(), Duration::from_secs(1));
        assert!(!exporter.is_available());
        assert!(exporter.fetch_metrics().is_none());
    }

    #[test]
    fn test_non_200_status() {
        let server = TestServer::start(503, "down");
        let mut exporter = NodeExporter::new(server.url.clone(), Duration::from_secs(2));
        assert!(!exporter.is_available());
        assert!(exporter.fetch_metrics().is_none());
    }
}
