//! # Internal Metrics Module
//!
//! Metrics about the agent itself, exposed for Prometheus.
//!
//! ## Components:
//!
//! - **`MetricsBuilder`**: installs the Prometheus recorder, binds the
//!   `/metrics` listener and constructs the `Metrics` handle.
//!
//! - **`Metrics`**: a cloneable handle the pipeline uses to update the
//!   predefined agent metrics.
//!
//! - **`MetricsServer`**: (Defined in `server.rs`) the `axum` server behind
//!   the `/metrics` endpoint.
//!
//! - **`SystemCollector`**: (Defined in `system.rs`) a background task that
//!   samples the agent's own CPU and memory usage.

use crate::config::MetricsConfig;
use crate::internal_metrics::server::MetricsServer;
use crate::internal_metrics::system::SystemCollector;
use crate::task_manager::TaskManager;
use metrics::{Counter, Histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::error;

pub mod server;
pub mod system;

/// The public API for the metrics system.
#[derive(Clone)]
pub struct Metrics {
    pub reports_enqueued_total: Counter,
    pub reports_dropped_total: Counter,
    pub reports_sent_total: Counter,
    pub report_failures_total: Counter,
    pub sample_pass_duration_seconds: Histogram,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Registers descriptions for every agent metric with the global recorder
    /// and returns handles to them.
    pub fn new() -> Self {
        metrics::describe_counter!("reports_enqueued_total", Unit::Count, "Reports accepted by the report queue.");
        metrics::describe_counter!("reports_dropped_total", Unit::Count, "Reports dropped because the report queue was full.");
        metrics::describe_counter!("reports_sent_total", Unit::Count, "Reports accepted by the collector.");
        metrics::describe_counter!("report_failures_total", Unit::Count, "Reports the collector rejected or that could not be delivered.");
        metrics::describe_gauge!("tracked_processes", Unit::Count, "Processes currently matched to a monitored name.");
        metrics::describe_gauge!("tracked_tasks", Unit::Count, "Threads currently polled for accounting.");
        metrics::describe_histogram!("sample_pass_duration_seconds", Unit::Seconds, "Time taken by one pass over every tracked process.");
        metrics::describe_gauge!("process_cpu_usage_percent", Unit::Percent, "CPU usage of the `procmon` process.");
        metrics::describe_gauge!("process_memory_usage_bytes", Unit::Bytes, "Resident set size of the `procmon` process, in bytes.");

        Self {
            reports_enqueued_total: metrics::counter!("reports_enqueued_total"),
            reports_dropped_total: metrics::counter!("reports_dropped_total"),
            reports_sent_total: metrics::counter!("reports_sent_total"),
            report_failures_total: metrics::counter!("report_failures_total"),
            sample_pass_duration_seconds: metrics::histogram!("sample_pass_duration_seconds"),
        }
    }

    /// Handles that record nothing, for when metrics are disabled.
    pub fn disabled() -> Self {
        Self {
            reports_enqueued_total: Counter::noop(),
            reports_dropped_total: Counter::noop(),
            reports_sent_total: Counter::noop(),
            report_failures_total: Counter::noop(),
            sample_pass_duration_seconds: Histogram::noop(),
        }
    }

    pub fn set_tracked_processes(&self, count: usize) {
        metrics::gauge!("tracked_processes").set(count as f64);
    }

    pub fn set_tracked_tasks(&self, count: usize) {
        metrics::gauge!("tracked_tasks").set(count as f64);
    }
}

/// Builder for the metrics system.
pub struct MetricsBuilder {
    config: MetricsConfig,
}

impl MetricsBuilder {
    pub fn new(config: MetricsConfig) -> Self {
        Self { config }
    }

    /// Initializes the metrics system and returns a `Metrics` handle and an
    /// optional `MetricsServer` with the address it is bound to.
    ///
    /// If metrics are disabled, or the recorder cannot be installed, the
    /// handle is a disabled one and no server is returned.
    pub fn build(self, task_manager: &TaskManager) -> (Metrics, Option<(MetricsServer, SocketAddr)>) {
        if !self.config.enabled {
            return (Metrics::disabled(), None);
        }

        let builder = match PrometheusBuilder::new().set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
        ) {
            Ok(builder) => builder,
            Err(e) => {
                error!("Failed to configure Prometheus buckets: {}", e);
                return (Metrics::disabled(), None);
            }
        };
        let recorder = builder.build_recorder();
        let handle = recorder.handle();

        let listener = match bind(self.config.listen_address) {
            Ok(listener) => listener,
            Err(e) => {
                error!(
                    "Failed to bind metrics server to {}: {}",
                    self.config.listen_address, e
                );
                return (Metrics::disabled(), None);
            }
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!("Failed to get local address for metrics server: {}", e);
                return (Metrics::disabled(), None);
            }
        };

        if let Err(e) = metrics::set_global_recorder(recorder) {
            error!("Failed to install Prometheus recorder: {}", e);
            return (Metrics::disabled(), None);
        }

        let metrics = Metrics::new();
        let server = MetricsServer::new(listener, handle, task_manager.get_shutdown_rx());

        if self.config.system_metrics_enabled {
            let collector = SystemCollector::new();
            task_manager.spawn("SystemCollector", collector.run(task_manager.get_shutdown_rx()));
        }

        (metrics, Some((server, addr)))
    }
}

fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let listener = std::net::TcpListener::bind(addr)?;
    // Tokio requires a non-blocking socket.
    listener.set_nonblocking(true)?;
    TcpListener::from_std(listener)
}
