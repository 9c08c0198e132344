//! CPU usage derivation from cumulative per-core counters.
//!
//! `node_cpu_seconds_total` only ever grows, so a usage percentage needs two
//! polls. The state kept here is the previous poll's per-core sums; it is
//! replaced wholesale on every update.

use std::collections::HashMap;

use crate::parser::SampleSet;

/// Counter carrying seconds spent per core and mode.
pub const CPU_SECONDS_METRIC: &str = "node_cpu_seconds_total";

/// Per-core cumulative seconds from a single scrape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuTimes {
    /// Sum over all modes, keyed by the `cpu` label.
    pub total: HashMap<String, f64>,
    /// Idle seconds, keyed by the `cpu` label.
    pub idle: HashMap<String, f64>,
}

impl CpuTimes {
    /// Sums the CPU counter per core. A missing `cpu` label counts as core "0".
    pub fn from_samples(samples: &SampleSet) -> Self {
        let mut times = CpuTimes::default();
        for sample in samples.metrics_by_name(CPU_SECONDS_METRIC) {
            let cpu = sample.label("cpu").unwrap_or("0");
            let mode = sample.label("mode").unwrap_or("");

            *times.total.entry(cpu.to_string()).or_insert(0.0) += sample.value;
            let idle = times.idle.entry(cpu.to_string()).or_insert(0.0);
            if mode == "idle" {
                *idle += sample.value;
            }
        }
        times
    }

    pub fn is_empty(&self) -> bool {
        self.total.is_empty()
    }
}

/// Rate state retained between polls.
#[derive(Debug, Default)]
pub struct CpuRateState {
    prev: Option<CpuTimes>,
}

impl CpuRateState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` once a previous poll has been recorded.
    pub fn is_seeded(&self) -> bool {
        self.prev.is_some()
    }

    /// Computes usage since the previous poll and stores `samples` as the new
    /// baseline.
    ///
    /// The first poll only seeds the state and reports 0. A scrape without any
    /// CPU counter reports 0 and leaves the state untouched.
    pub fn update(&mut self, samples: &SampleSet) -> f64 {
        let current = CpuTimes::from_samples(samples);
        if current.is_empty() {
            return 0.0;
        }

        let Some(prev) = self.prev.replace(current.clone()) else {
            return 0.0;
        };

        let mut total_delta = 0.0;
        let mut idle_delta = 0.0;
        for (cpu, total) in &current.total {
            let Some(prev_total) = prev.total.get(cpu) else {
                continue;
            };
            total_delta += total - prev_total;
            idle_delta += current.idle.get(cpu).copied().unwrap_or(0.0)
                - prev.idle.get(cpu).copied().unwrap_or(0.0);
        }

        usage_from_deltas(total_delta, idle_delta)
    }
}

/// `(Δtotal − Δidle) / Δtotal × 100`, clamped to `[0, 100]`; 0 when
/// `Δtotal ≤ 0`.
pub fn usage_from_deltas(total_delta: f64, idle_delta: f64) -> f64 {
    if total_delta <= 0.0 {
        return 0.0;
    }
    ((total_delta - idle_delta) / total_delta * 100.0).clamp(0.0, 100.0)
}
