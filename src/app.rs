//! The main application logic, decoupled from the entry point.

use crate::{
    config::{Config, ListerKind},
    core::{AccountingSource, ProcessLister, Reporter},
    discovery::{ProcfsProcessLister, PsProcessLister},
    internal_metrics::{system::hostname, Metrics, MetricsBuilder},
    monitor::{run_reporter, MonitorError, MonitorState, ProcessMonitor, ReportQueue},
    procfs::{system_page_size, ProcFs},
    reporting,
    task_manager::TaskManager,
    taskstats::{self, NetlinkSession},
};
use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument};

/// A handle to the running application.
pub struct App {
    task_manager: TaskManager,
    metrics_addr: Option<SocketAddr>,
    monitor: Arc<ProcessMonitor>,
    fatal_rx: mpsc::UnboundedReceiver<MonitorError>,
}

impl App {
    pub fn builder(config: Config) -> AppBuilder {
        AppBuilder::new(config)
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_addr
    }

    pub fn monitor(&self) -> Arc<ProcessMonitor> {
        self.monitor.clone()
    }

    /// Runs until the shutdown signal fires, then waits for every task.
    ///
    /// A fatal monitor error (an unusable accounting session) aborts every
    /// task and is returned.
    pub async fn run(mut self) -> Result<()> {
        let mut shutdown_rx = self.task_manager.get_shutdown_rx();
        tokio::select! {
            _ = shutdown_rx.changed() => {
                info!("Shutdown signal received. Waiting for tasks to complete...");
                self.task_manager.shutdown().await;
                info!("All tasks shut down.");
                Ok(())
            }
            Some(err) = self.fatal_rx.recv() => {
                error!(error = %err, "Monitor stopped on a fatal error.");
                self.task_manager.abort_all().await;
                Err(err.into())
            }
        }
    }
}

/// Builder for the main application.
///
/// Every external dependency can be overridden, which is how the tests run
/// the full pipeline without netlink, `ps` or a collector.
pub struct AppBuilder {
    config: Config,
    lister_override: Option<Arc<dyn ProcessLister>>,
    accounting_override: Option<Arc<dyn AccountingSource>>,
    reporter_override: Option<Arc<dyn Reporter>>,
    metrics_override: Option<Metrics>,
    self_pid_override: Option<u32>,
}

impl AppBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            lister_override: None,
            accounting_override: None,
            reporter_override: None,
            metrics_override: None,
            self_pid_override: None,
        }
    }

    /// Overrides process discovery.
    pub fn lister_override(mut self, lister: Arc<dyn ProcessLister>) -> Self {
        self.lister_override = Some(lister);
        self
    }

    /// Overrides the netlink accounting session.
    pub fn accounting_override(mut self, source: Arc<dyn AccountingSource>) -> Self {
        self.accounting_override = Some(source);
        self
    }

    /// Overrides the configured reporter.
    pub fn reporter_override(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter_override = Some(reporter);
        self
    }

    /// Overrides the metrics system.
    pub fn metrics_override(mut self, metrics: Metrics) -> Self {
        self.metrics_override = Some(metrics);
        self
    }

    /// Overrides the pid excluded from matching (normally our own).
    pub fn self_pid_override(mut self, pid: u32) -> Self {
        self.self_pid_override = Some(pid);
        self
    }

    /// Builds every component, performs the first process scan and spawns
    /// the refresher, sampler and reporter.
    #[instrument(skip_all)]
    pub async fn build(self, shutdown_rx: watch::Receiver<bool>) -> Result<App> {
        let config = self.config;
        let task_manager = TaskManager::new(shutdown_rx);

        // =========================================================================
        // 1. Initialize Metrics
        // =========================================================================
        let (metrics, metrics_server_info) = match self.metrics_override {
            Some(m) => (m, None),
            None => MetricsBuilder::new(config.metrics.clone()).build(&task_manager),
        };
        let metrics = Arc::new(metrics);
        let metrics_addr = metrics_server_info.map(|(server, addr)| {
            task_manager.spawn("MetricsServer", server.run());
            info!(%addr, "Serving metrics.");
            addr
        });

        // =========================================================================
        // 2. Kernel Accounting
        // =========================================================================
        let self_pid = self.self_pid_override.unwrap_or_else(std::process::id);
        let source: Arc<dyn AccountingSource> = match self.accounting_override {
            Some(source) => source,
            None => {
                let session = NetlinkSession::open(config.taskstats.receive_timeout())
                    .context("failed to open the taskstats netlink session (CAP_NET_ADMIN is required)")?;
                debug!(family_id = session.family_id(), "Resolved taskstats family.");
                Arc::new(session)
            }
        };
        let probe_source = source.clone();
        let delay_accounting = tokio::task::spawn_blocking(move || {
            taskstats::probe_delay_accounting(probe_source.as_ref(), self_pid)
        })
        .await
        .context("delay accounting probe failed")?;
        debug!(delay_accounting, "Delay accounting probed.");

        // =========================================================================
        // 3. Discovery, Reporting and the Queue Between Them
        // =========================================================================
        let page_size = config.monitor.page_size_bytes.unwrap_or_else(system_page_size);
        let procfs = ProcFs::new(config.monitor.proc_root.clone(), page_size);

        let lister: Arc<dyn ProcessLister> = match self.lister_override {
            Some(lister) => lister,
            None => match config.monitor.lister {
                ListerKind::Ps => Arc::new(PsProcessLister),
                ListerKind::Procfs => Arc::new(ProcfsProcessLister::new(procfs.clone())),
            },
        };
        let reporter = match self.reporter_override {
            Some(reporter) => reporter,
            None => reporting::from_config(&config.report)?,
        };
        let host = config.host.clone().unwrap_or_else(hostname);
        let (queue, reports_rx) = ReportQueue::bounded(config.monitor.queue_capacity, metrics.clone());

        // =========================================================================
        // 4. Monitor
        // =========================================================================
        let state = MonitorState::new(
            config.monitor.process_names.clone(),
            procfs,
            source,
            config.monitor.duration_averaging,
        );
        let monitor = Arc::new(ProcessMonitor::new(
            state,
            lister,
            queue,
            host.clone(),
            self_pid,
            metrics.clone(),
        ));
        monitor.refresh().await.context("initial process scan failed")?;

        // =========================================================================
        // 5. Spawn the Loops
        // =========================================================================
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        task_manager.spawn(
            "Reporter",
            run_reporter(reports_rx, reporter, metrics.clone(), task_manager.get_shutdown_rx()),
        );
        task_manager.spawn(
            "Refresher",
            forward_fatal(
                "Refresher",
                fatal_tx.clone(),
                monitor
                    .clone()
                    .run_refresher(config.monitor.refresh_interval(), task_manager.get_shutdown_rx()),
            ),
        );
        task_manager.spawn(
            "Sampler",
            forward_fatal(
                "Sampler",
                fatal_tx,
                monitor
                    .clone()
                    .run_sampler(config.monitor.sample_interval(), task_manager.get_shutdown_rx()),
            ),
        );

        info!(
            host = %host,
            names = ?config.monitor.process_names,
            sample_interval_secs = config.monitor.sample_interval_seconds,
            "procmon initialized."
        );

        Ok(App {
            task_manager,
            metrics_addr,
            monitor,
            fatal_rx,
        })
    }
}

/// Runs a monitor loop and forwards its error, if any, to `App::run`.
async fn forward_fatal(
    name: &'static str,
    fatal_tx: mpsc::UnboundedSender<MonitorError>,
    task: impl Future<Output = Result<(), MonitorError>>,
) {
    if let Err(e) = task.await {
        error!(task_name = name, error = %e, "Monitor loop failed.");
        fatal_tx.send(e).ok();
    }
}
