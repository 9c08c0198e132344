//! GPU facts from `nvidia-smi`.
//!
//! Works with any NVIDIA board the driver supports. Only the first device in
//! the output is reported.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::exporter::Exporter;
use crate::model::{GpuMetrics, round_to};
use crate::util::{CommandError, find_in_path, run_with_timeout};

/// Fields requested from `--query-gpu`, in output order.
pub const QUERY_FIELDS: [&str; 5] = [
    "utilization.gpu", // %
    "memory.used",     // MiB
    "memory.total",    // MiB
    "temperature.gpu", // °C
    "power.draw",      // W
];

const BINARY_NAME: &str = "nvidia-smi";
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);
const MIB: f64 = 1024.0 * 1024.0;

/// Collects GPU metrics by invoking `nvidia-smi`.
pub struct NvidiaExporter {
    enabled: bool,
    binary: Option<PathBuf>,
    /// Probe result, computed once per exporter lifetime.
    available: Option<bool>,
}

impl NvidiaExporter {
    /// Creates an exporter. With `binary` unset the tool is looked up on `PATH`.
    pub fn new(binary: Option<PathBuf>, enabled: bool) -> Self {
        let binary = binary.or_else(|| if enabled { find_in_path(BINARY_NAME) } else { None });
        Self {
            enabled,
            binary,
            available: None,
        }
    }

    fn probe(&self) -> bool {
        let Some(binary) = self.binary.as_deref() else {
            debug!("{} not found on PATH", BINARY_NAME);
            return false;
        };
        match run_with_timeout(binary, &["--query-gpu=name", "--format=csv,noheader"], PROBE_TIMEOUT) {
            Ok(_) => true,
            Err(e) => {
                debug!("{} probe failed: {}", binary.display(), e);
                false
            }
        }
    }

    fn query(&self, binary: &Path) -> Option<GpuMetrics> {
        let query = format!("--query-gpu={}", QUERY_FIELDS.join(","));
        match run_with_timeout(binary, &[&query, "--format=csv,noheader,nounits"], QUERY_TIMEOUT) {
            Ok(output) => {
                let metrics = parse_output(&output.stdout);
                if metrics.is_none() {
                    warn!("Unexpected {} output: {}", BINARY_NAME, output.stdout.trim());
                }
                metrics
            }
            Err(CommandError::Timeout(_)) => {
                warn!("{} timed out", BINARY_NAME);
                None
            }
            Err(e) => {
                warn!("{} failed: {}", BINARY_NAME, e);
                None
            }
        }
    }
}

impl Exporter for NvidiaExporter {
    type Metrics = GpuMetrics;

    fn name(&self) -> &str {
        BINARY_NAME
    }

    fn is_available(&mut self) -> bool {
        if !self.enabled {
            return false;
        }
        if let Some(available) = self.available {
            return available;
        }
        let available = self.probe();
        self.available = Some(available);
        available
    }

    fn fetch_metrics(&mut self) -> Option<GpuMetrics> {
        if !self.enabled || !self.is_available() {
            return None;
        }
        let binary = self.binary.clone()?;
        self.query(&binary)
    }
}

/// Parses `--format=csv,noheader,nounits` output, first line only.
///
/// Returns `None` if the first line has fewer than five fields.
pub fn parse_output(output: &str) -> Option<GpuMetrics> {
    let first = output.trim().lines().next()?.trim();
    if first.is_empty() {
        return None;
    }

    let values: Vec<&str> = first.split(',').map(str::trim).collect();
    if values.len() < QUERY_FIELDS.len() {
        return None;
    }

    let utilization = parse_field(values[0], 0.0);
    let memory_used = (parse_field(values[1], 0.0) * MIB) as u64;
    let memory_total = (parse_field(values[2], 0.0) * MIB) as u64;
    let temperature = parse_field(values[3], 0.0);
    let power = parse_field(values[4], 0.0);

    let memory_usage = if memory_total > 0 {
        memory_used as f64 / memory_total as f64 * 100.0
    } else {
        0.0
    };

    Some(GpuMetrics {
        utilization_percent: round_to(utilization, 2),
        memory_used_bytes: memory_used,
        memory_total_bytes: memory_total,
        memory_usage_percent: round_to(memory_usage, 2),
        temperature_celsius: round_to(temperature, 1),
        power_watts: round_to(power, 2),
    })
}

/// Parses one numeric field, returning `default` for `[N/A]`-style markers
/// and anything else that is not a finite number.
pub fn parse_field(value: &str, default: f64) -> f64 {
    match value.trim() {
        "" | "N/A" | "[N/A]" | "[Not Supported]" => default,
        v => v.parse::<f64>().ok().filter(|f| f.is_finite()).unwrap_or(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_output_converts_mib() {
        let gpu = parse_output("35, 4096, 8192, 48, 120.5\n").unwrap();
        assert_eq!(gpu.utilization_percent, 35.0);
        assert_eq!(gpu.memory_used_bytes, 4096 * 1024 * 1024);
        assert_eq!(gpu.memory_total_bytes, 8192 * 1024 * 1024);
        assert_eq!(gpu.memory_usage_percent, 50.0);
        assert_eq!(gpu.temperature_celsius, 48.0);
        assert_eq!(gpu.power_watts, 120.5);
    }

    #[test]
    fn test_parse_output_uses_first_device_only() {
        let gpu = parse_output("10, 100, 1000, 40, 50\n90, 900, 1000, 80, 250\n").unwrap();
        assert_eq!(gpu.utilization_percent, 10.0);
        assert_eq!(gpu.temperature_celsius, 40.0);
    }

    #[test]
    fn test_not_applicable_fields_fall_back() {
        let gpu = parse_output("[N/A], 512, 0, N/A, [N/A]").unwrap();
        assert_eq!(gpu.utilization_percent, 0.0);
        assert_eq!(gpu.memory_used_bytes, 512 * 1024 * 1024);
        assert_eq!(gpu.memory_total_bytes, 0);
        assert_eq!(gpu.memory_usage_percent, 0.0);
        assert_eq!(gpu.power_watts, 0.0);
    }

    #[test]
    fn test_short_line_is_no_result() {
        assert!(parse_output("35, 4096, 8192, 48").is_none());
        assert!(parse_output("").is_none());
        assert!(parse_output("\n\n").is_none());
    }

    #[test]
    fn test_parse_field() {
        assert_eq!(parse_field(" 12.5 ", 0.0), 12.5);
        assert_eq!(parse_field("garbage", 7.0), 7.0);
        assert_eq!(parse_field("inf", 1.0), 1.0);
        assert_eq!(parse_field("[N/A]", 2.0), 2.0);
    }

    #[test]
    fn test_disabled_exporter_never_invokes() {
        let mut exporter = NvidiaExporter::new(Some(PathBuf::from("/nonexistent/nvidia-smi")), false);
        assert!(!exporter.is_available());
        assert!(exporter.fetch_metrics().is_none());
    }

    #[test]
    fn test_missing_binary_is_unavailable() {
        let mut exporter = NvidiaExporter::new(Some(PathBuf::from("/nonexistent/nvidia-smi")), true);
        assert!(!exporter.is_available());
        assert!(exporter.fetch_metrics().is_none());
    }

    #[cfg(unix)]
    mod fake_binary {
        use super::*;
        use std::fs;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        /// Writes an executable shell script standing in for `nvidia-smi`.
        fn fake_smi(dir: &TempDir, body: &str) -> PathBuf {
            let path = dir.path().join("nvidia-smi");
            fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        #[test]
        fn test_fetch_from_fake_binary() {
            let dir = TempDir::new().unwrap();
            let script = r#"case "$1" in
  --query-gpu=name) echo "NVIDIA GeForce RTX 3080" ;;
  *) echo "35, 4096, 8192, 48, 120.5" ;;
esac"#;
            let mut exporter = NvidiaExporter::new(Some(fake_smi(&dir, script)), true);

            assert!(exporter.is_available());
            let gpu = exporter.fetch_metrics().unwrap();
            assert_eq!(gpu.memory_total_bytes, 8192 * 1024 * 1024);
        }

        #[test]
        fn test_nonzero_exit_yields_no_result() {
            let dir = TempDir::new().unwrap();
            let script = r#"case "$1" in
  --query-gpu=name) echo "GPU" ;;
  *) echo "driver mismatch" >&2; exit 9 ;;
esac"#;
            let mut exporter = NvidiaExporter::new(Some(fake_smi(&dir, script)), true);
            assert!(exporter.is_available());
            assert!(exporter.fetch_metrics().is_none());
        }

        #[test]
        fn test_availability_is_cached() {
            let dir = TempDir::new().unwrap();
            let path = fake_smi(&dir, "echo GPU");
            let mut exporter = NvidiaExporter::new(Some(path.clone()), true);
            assert!(exporter.is_available());

            fs::remove_file(&path).unwrap();
            assert!(exporter.is_available());
        }
    }
}
