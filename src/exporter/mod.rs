//! Metric sources polled by the collector.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐     ┌──────────────────────────┐
//! │       NodeExporter       │     │      NvidiaExporter      │
//! │  GET /metrics (reqwest)  │     │  nvidia-smi --query-gpu  │
//! │  parser → CpuRateState   │     │  CSV line → GpuMetrics   │
//! └────────────┬─────────────┘     └────────────┬─────────────┘
//!              │           Exporter (trait)      │
//!              └───────────────┬─────────────────┘
//!                              ▼
//!                     transform::transform_metrics
//! ```
//!
//! Both sources fail independently. A failed poll is logged and reported as
//! `None`; it is never turned into an error for the caller.

#[cfg(test)]
pub mod mock;
mod node;
mod nvidia;
pub mod rates;

pub use node::NodeExporter;
pub use nvidia::{NvidiaExporter, QUERY_FIELDS};

/// A pollable metric source.
pub trait Exporter {
    /// Typed facts produced by one successful poll.
    type Metrics;

    /// Short name used in log messages.
    fn name(&self) -> &str;

    /// Returns `true` if the source can currently be reached.
    ///
    /// Transport failures count as unavailable; they are never raised.
    fn is_available(&mut self) -> bool;

    /// Polls the source once. `None` means "no result this cycle".
    fn fetch_metrics(&mut self) -> Option<Self::Metrics>;
}
