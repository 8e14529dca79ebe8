//! # System Metrics Collector
//!
//! Periodically samples the agent's own CPU and memory usage via `sysinfo`
//! and publishes them as gauges. Also home to the hostname lookup used to
//! label reports.

use std::time::Duration;
use sysinfo::System;
use tokio::sync::watch;
use tokio::time;
use tracing::{error, trace};

const SYSTEM_METRICS_COLLECTION_INTERVAL: Duration = Duration::from_secs(10);

/// The host name reports are labelled with when none is configured.
pub fn hostname() -> String {
    System::host_name().unwrap_or_else(|| "unknown".to_string())
}

/// A collector for the agent's own resource usage.
pub struct SystemCollector {
    system: System,
}

impl Default for SystemCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemCollector {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Runs the collection loop until shutdown or until the agent's own
    /// process can no longer be found.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut interval = time::interval(SYSTEM_METRICS_COLLECTION_INTERVAL);
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => pid,
            Err(e) => {
                error!("Failed to get current PID: {}", e);
                return;
            }
        };

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    trace!("System collector received shutdown signal.");
                    break;
                }
                _ = interval.tick() => {}
            }

            self.system.refresh_cpu();
            if !self.system.refresh_process(pid) {
                error!(%pid, "SystemCollector: own process no longer found; stopping.");
                break;
            }
            if let Some(process) = self.system.process(pid) {
                metrics::gauge!("process_cpu_usage_percent").set(process.cpu_usage() as f64);
                metrics::gauge!("process_memory_usage_bytes").set(process.memory() as f64);
            }
        }
    }
}
