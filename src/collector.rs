//! Collection orchestrator: poll, transform, send, sleep.
//!
//! # Architecture
//!
//! ```text
//!              ┌──────────────── MetricsCollector::run ────────────────┐
//!              │                                                       │
//!  interval ──►│  NodeExporter ──┐                                     │
//!              │                 ├──► transform_metrics ──► MetricsSender ──► endpoint
//!              │  NvidiaExporter ┘                                     │
//!              │                                                       │
//!              │  ShutdownToken::sleep(interval)  (100ms steps)        │
//!              └───────────────────────────────────────────────────────┘
//! ```
//!
//! Iterations never overlap. A panic inside one iteration is logged and the
//! loop resumes after a one second pause.

use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::daemon::{DaemonError, DaemonManager};
use crate::exporter::{Exporter, NodeExporter, NvidiaExporter};
use crate::model::{GpuMetrics, NodeMetrics, SystemMetrics};
use crate::sender::{ConnectionStatus, MetricsSender};
use crate::shutdown::ShutdownToken;
use crate::transform::transform_metrics;
use crate::util::format_ago;

/// Pause after an iteration that panicked.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Owns the exporters, the sender and the PID file of one agent instance.
pub struct MetricsCollector<N = NodeExporter, G = NvidiaExporter> {
    config: Config,
    node_exporter: N,
    gpu_exporter: G,
    sender: MetricsSender,
    daemon: DaemonManager,
    last_collect: Option<Instant>,
}

impl MetricsCollector {
    /// Builds the production exporters from `config`.
    pub fn from_config(config: Config) -> Self {
        let node = &config.exporters.node_exporter;
        let node_exporter = NodeExporter::new(node.url.clone(), Duration::from_secs(node.timeout));

        let nvidia = &config.exporters.nvidia_smi;
        let gpu_exporter = NvidiaExporter::new(nvidia.nvidia_smi_path.clone(), nvidia.enabled);

        Self::with_exporters(config, node_exporter, gpu_exporter)
    }
}

impl<N, G> MetricsCollector<N, G>
where
    N: Exporter<Metrics = NodeMetrics>,
    G: Exporter<Metrics = GpuMetrics>,
{
    pub fn with_exporters(config: Config, node_exporter: N, gpu_exporter: G) -> Self {
        let sender = MetricsSender::new(config.endpoint.clone())
            .with_timeout(config.delivery.timeout())
            .with_retries(config.delivery.max_retries, config.delivery.retry_delay());
        let daemon = DaemonManager::new(config.daemon.pid_file.clone());

        Self {
            config,
            node_exporter,
            gpu_exporter,
            sender,
            daemon,
            last_collect: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn daemon_manager(&mut self) -> &mut DaemonManager {
        &mut self.daemon
    }

    /// Polls every enabled exporter once and builds a snapshot.
    ///
    /// A failing or panicking exporter leaves its part of the snapshot at
    /// defaults without affecting the other one.
    pub fn collect_once(&mut self) -> SystemMetrics {
        let node = if self.config.exporters.node_exporter.enabled {
            fetch_guarded(&mut self.node_exporter)
        } else {
            None
        };

        let gpu = if self.config.exporters.nvidia_smi.enabled {
            fetch_guarded(&mut self.gpu_exporter)
        } else {
            None
        };

        let snapshot = transform_metrics(node, gpu);
        self.last_collect = Some(Instant::now());
        snapshot
    }

    /// Collects one snapshot and delivers it. Returns `false` if delivery failed.
    pub fn collect_and_send(&mut self) -> bool {
        let snapshot = self.collect_once();
        let sent = self.sender.send(&snapshot);
        if sent {
            info!("Metrics collected and sent successfully");
        } else {
            error!("Failed to send metrics to {}", self.config.endpoint);
        }
        sent
    }

    /// Runs collection cycles until `token` is cancelled.
    pub fn run(&mut self, token: &ShutdownToken) {
        let interval = Duration::from_secs(self.config.interval);
        info!(
            "Starting collection loop (interval: {}s, endpoint: {})",
            self.config.interval, self.config.endpoint
        );

        while !token.is_cancelled() {
            match panic::catch_unwind(AssertUnwindSafe(|| self.collect_and_send())) {
                Ok(_) => {
                    token.sleep(interval);
                }
                Err(payload) => {
                    error!("Error in collection loop: {}", panic_message(payload.as_ref()));
                    token.sleep(ERROR_BACKOFF);
                }
            }
        }

        info!("Collection loop stopped");
    }

    /// Runs in the current process, tracking it in the PID file.
    ///
    /// Failing to write the PID file is logged and does not stop the run.
    pub fn run_foreground(&mut self, token: &ShutdownToken) {
        match self.daemon.write_pid() {
            Ok(()) => {}
            Err(e) if e.is_permission_denied() => {
                warn!("Cannot write PID file (permission denied)");
            }
            Err(e) => warn!("Cannot write PID file: {}", e),
        }

        self.run(token);

        info!("Stopping collector");
        self.daemon.cleanup_pid_file();
    }

    /// Detaches into the background and runs there.
    ///
    /// `after_detach` runs in the daemon process before the loop starts; it
    /// is the place to set up logging and signal handling. Returns
    /// [`DaemonError::AlreadyRunning`] without forking if an instance is
    /// already recorded in the PID file.
    pub fn run_daemon<F: FnOnce()>(
        &mut self,
        token: &ShutdownToken,
        after_detach: F,
    ) -> Result<(), DaemonError> {
        if let Some(pid) = self.daemon.get_pid() {
            return Err(DaemonError::AlreadyRunning(pid));
        }
        // Errors after the fork have nowhere to go.
        self.daemon.check_writable()?;

        self.daemon.daemonize()?;
        after_detach();
        info!("Collector daemon started (PID: {})", std::process::id());

        self.run(token);

        info!("Collector daemon stopping");
        self.daemon.cleanup_pid_file();
        Ok(())
    }

    /// Availability of (node exporter, GPU tool). Disabled sources report `false`.
    pub fn check_exporters(&mut self) -> (bool, bool) {
        let node_ok = self.config.exporters.node_exporter.enabled && self.node_exporter.is_available();
        let gpu_ok = self.config.exporters.nvidia_smi.enabled && self.gpu_exporter.is_available();
        (node_ok, gpu_ok)
    }

    pub fn test_connection(&mut self) -> ConnectionStatus {
        self.sender.test_connection()
    }

    /// Time since the last collection, e.g. `12s ago`.
    pub fn last_collect_ago(&self) -> Option<String> {
        let elapsed = self.last_collect?.elapsed().as_secs();
        Some(format_ago(elapsed as i64))
    }
}

/// Runs one exporter poll, turning a panic into a missing result.
fn fetch_guarded<E: Exporter>(exporter: &mut E) -> Option<E::Metrics> {
    match panic::catch_unwind(AssertUnwindSafe(|| exporter.fetch_metrics())) {
        Ok(Some(metrics)) => Some(metrics),
        Ok(None) => {
            debug!("No result from {} this cycle", exporter.name());
            None
        }
        Err(payload) => {
            error!("{} failed: {}", exporter.name(), panic_message(payload.as_ref()));
            None
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
