#![allow(dead_code)]
//! Test helpers for running the full application against a fake `/proc`
//! tree, a fake accounting source and a static process listing.

use anyhow::Result;
use procmon::{
    app::App,
    config::Config,
    core::Reporter,
    discovery::test_utils::StaticProcessLister,
    internal_metrics::Metrics,
    monitor::ProcessMonitor,
    procfs::fixtures::{stat_line, write_process},
    taskstats::test_utils::FakeAccountingSource,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::{sync::watch, task::JoinHandle, time::timeout};

/// Pid the fake agent runs as; never matched.
pub const AGENT_PID: u32 = 1;

/// A running application instance.
pub struct TestApp {
    pub shutdown_tx: watch::Sender<bool>,
    pub app_handle: Option<JoinHandle<Result<()>>>,
    pub monitor: Arc<ProcessMonitor>,
    pub source: Arc<FakeAccountingSource>,
    pub proc_dir: TempDir,
    metrics_addr: Option<SocketAddr>,
}

impl TestApp {
    pub fn metrics_addr(&self) -> SocketAddr {
        self.metrics_addr
            .expect("Metrics must be enabled to get the address")
    }

    pub fn tracked_pids(&self) -> Vec<u32> {
        self.monitor.state().lock().unwrap().tracked_pids()
    }

    /// Shuts the application down and waits for it to terminate.
    pub async fn shutdown(mut self, timeout_duration: Duration) -> Result<()> {
        self.shutdown_tx.send(true).ok();
        match self.app_handle.take() {
            Some(handle) => match timeout(timeout_duration, handle).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(anyhow::anyhow!("App failed to shut down within the timeout")),
            },
            None => Ok(()),
        }
    }

    /// Waits for the application to stop on its own and returns its result.
    pub async fn join(mut self, timeout_duration: Duration) -> Result<()> {
        let handle = self.app_handle.take().expect("app is not running");
        timeout(timeout_duration, handle)
            .await
            .map_err(|_| anyhow::anyhow!("App did not stop within the timeout"))??
    }
}

/// A builder for `TestApp`s.
pub struct TestAppBuilder {
    pub config: Config,
    source: Arc<FakeAccountingSource>,
    listing: Vec<(u32, String)>,
    reporter: Option<Arc<dyn Reporter>>,
    proc_dir: TempDir,
    metrics: Option<Metrics>,
}

impl TestAppBuilder {
    pub fn new() -> Self {
        let proc_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.monitor.process_names = vec!["svc".to_string()];
        config.monitor.sample_interval_seconds = 2;
        config.monitor.proc_root = proc_dir.path().to_path_buf();
        config.monitor.page_size_bytes = Some(4096);
        config.host = Some("test-host".to_string());

        Self {
            config,
            source: Arc::new(FakeAccountingSource::new()),
            listing: vec![(AGENT_PID, "procmon svc".to_string())],
            reporter: None,
            proc_dir,
            metrics: Some(Metrics::disabled()),
        }
    }

    /// Adds a process to the listing and the fake `/proc`, with every thread
    /// reporting zero I/O.
    pub fn with_process(mut self, pid: u32, cmdline: &str, tids: &[u32]) -> Self {
        let stat = stat_line(pid, "fake", 0, 0, tids.len() as u64, 1 << 20, 16);
        write_process(self.proc_dir.path(), pid, cmdline, tids, &stat);
        for tid in tids {
            self.source.set_io(*tid, 0, 0);
        }
        self.listing.push((pid, cmdline.to_string()));
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Lets `MetricsBuilder` set up metrics from the configuration.
    pub fn with_configured_metrics(mut self) -> Self {
        self.metrics = None;
        self
    }

    pub fn with_config_modifier(mut self, modifier: impl FnOnce(&mut Config)) -> Self {
        modifier(&mut self.config);
        self
    }

    pub fn source(&self) -> Arc<FakeAccountingSource> {
        self.source.clone()
    }

    /// Builds the application and spawns `App::run`.
    pub async fn start(self) -> Result<TestApp> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pairs: Vec<(u32, &str)> = self
            .listing
            .iter()
            .map(|(pid, line)| (*pid, line.as_str()))
            .collect();

        let mut builder = App::builder(self.config)
            .lister_override(Arc::new(StaticProcessLister::from_pairs(&pairs)))
            .accounting_override(self.source.clone())
            .self_pid_override(AGENT_PID);
        if let Some(reporter) = self.reporter {
            builder = builder.reporter_override(reporter);
        }
        if let Some(metrics) = self.metrics {
            builder = builder.metrics_override(metrics);
        }

        let app = builder.build(shutdown_rx).await?;
        let metrics_addr = app.metrics_addr();
        let monitor = app.monitor();
        let app_handle = tokio::spawn(app.run());

        Ok(TestApp {
            shutdown_tx,
            app_handle: Some(app_handle),
            monitor,
            source: self.source,
            proc_dir: self.proc_dir,
            metrics_addr,
        })
    }
}
