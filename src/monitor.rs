//! The process monitor: which pids belong to which name, per-pid counters,
//! and the loops that refresh, sample and report them.
//!
//! - **`MonitorState`**: name/pid maps plus one `ProcessCounter` per pid.
//!   Everything that touches the kernel or `/proc` happens under one lock,
//!   inside `spawn_blocking`.
//! - **`NameBundle`**: the per-name fold of process samples.
//! - **`ReportQueue`**: the bounded, never-blocking hand-off from the sampler
//!   to the reporter.
//! - **`ProcessMonitor`**: owns the above and runs the refresher and sampler
//!   loops. `run_reporter` drains the queue.

use crate::core::{
    AccountingSource, ProcessLister, ProcessMatch, ProcessSample, Report, Reporter, ServiceData,
    ServiceReport,
};
use crate::counter::ProcessCounter;
use crate::discovery::match_processes;
use crate::internal_metrics::Metrics;
use crate::procfs::ProcFs;
use crate::taskstats::{AccountingRecord, Sign, TaskstatsError};
use async_channel::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, trace, warn};

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("accounting session failed: {0}")]
    Taskstats(#[from] TaskstatsError),

    #[error("process listing failed: {0:#}")]
    Listing(anyhow::Error),

    #[error("blocking monitor task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("monitor state lock poisoned")]
    Poisoned,
}

impl MonitorError {
    /// Whether the monitor can no longer produce meaningful reports.
    ///
    /// A failed listing keeps the previous pid set and is retried on the next
    /// refresh.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, MonitorError::Listing(_))
    }
}

/// How the intervals of several same-named processes are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationAveraging {
    /// Arithmetic mean over every folded process.
    #[default]
    Mean,
    /// `(trunc(previous) + next) / 2` at each fold. Later processes weigh
    /// more; kept for compatibility with existing dashboards.
    Pairwise,
}

/// Everything sampled for one monitored name in one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct NameBundle {
    pub name: String,
    pub accounting: AccountingRecord,
    pub duration_secs: f64,
    pub vm_bytes: u64,
    pub rss_bytes: u64,
    pub cpu_usage: f64,
    pub num_threads: u64,
    pub num_processes: u64,
}

impl NameBundle {
    pub fn from_sample(name: &str, sample: &ProcessSample) -> Self {
        Self {
            name: name.to_string(),
            accounting: sample.accounting,
            duration_secs: sample.duration_secs as f64,
            vm_bytes: sample.vm_bytes,
            rss_bytes: sample.rss_bytes,
            cpu_usage: sample.cpu_usage,
            num_threads: sample.num_threads,
            num_processes: 1,
        }
    }

    /// Adds another process of the same name.
    pub fn fold(&mut self, sample: &ProcessSample, averaging: DurationAveraging) {
        self.accounting.accumulate(&sample.accounting, Sign::Plus);
        self.vm_bytes = self.vm_bytes.saturating_add(sample.vm_bytes);
        self.rss_bytes = self.rss_bytes.saturating_add(sample.rss_bytes);
        self.cpu_usage += sample.cpu_usage;
        self.num_threads += sample.num_threads;

        let next = sample.duration_secs as f64;
        self.duration_secs = match averaging {
            DurationAveraging::Mean => {
                let n = self.num_processes as f64;
                (self.duration_secs * n + next) / (n + 1.0)
            }
            DurationAveraging::Pairwise => (self.duration_secs.trunc() + next) / 2.0,
        };
        self.num_processes += 1;
    }

    /// Converts the interval totals into per-second rates.
    pub fn to_service_report(&self) -> ServiceReport {
        let rate = |bytes: u64| {
            if self.duration_secs > 0.0 {
                (bytes as f64 / self.duration_secs) as u64
            } else {
                0
            }
        };
        ServiceReport {
            service: self.name.clone(),
            data: ServiceData {
                read_bytes: rate(self.accounting.read_bytes),
                write_bytes: rate(self.accounting.write_bytes),
                rss: self.rss_bytes,
                vm: self.vm_bytes,
                cpu_usage: self.cpu_usage,
                num_threads: self.num_threads,
                num_processes: self.num_processes,
            },
        }
    }
}

/// Builds the report for one pass, or `None` if nothing survived.
pub fn build_report(host: &str, bundles: &[NameBundle]) -> Option<Report> {
    if bundles.is_empty() {
        return None;
    }
    Some(Report {
        host: host.to_string(),
        list: bundles.iter().map(NameBundle::to_service_report).collect(),
    })
}

/// Counts of pids gained and lost by one refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub added: usize,
    pub removed: usize,
    pub tracked: usize,
}

/// The monitor's shared maps and per-pid counters.
#[derive(Debug)]
pub struct MonitorState {
    names: Vec<String>,
    name_pids: BTreeMap<String, Vec<u32>>,
    pid_name: HashMap<u32, String>,
    counters: BTreeMap<u32, ProcessCounter>,
    procfs: ProcFs,
    source: Arc<dyn AccountingSource>,
    averaging: DurationAveraging,
}

impl MonitorState {
    pub fn new(
        names: Vec<String>,
        procfs: ProcFs,
        source: Arc<dyn AccountingSource>,
        averaging: DurationAveraging,
    ) -> Self {
        Self {
            names,
            name_pids: BTreeMap::new(),
            pid_name: HashMap::new(),
            counters: BTreeMap::new(),
            procfs,
            source,
            averaging,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Pids currently attributed to `name`.
    pub fn pids_for(&self, name: &str) -> &[u32] {
        self.name_pids.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn name_of(&self, pid: u32) -> Option<&str> {
        self.pid_name.get(&pid).map(String::as_str)
    }

    /// Pids with a live counter, ascending.
    pub fn tracked_pids(&self) -> Vec<u32> {
        self.counters.keys().copied().collect()
    }

    pub fn tracked_tasks(&self) -> usize {
        self.counters.values().map(ProcessCounter::task_count).sum()
    }

    /// Replaces the name/pid maps with `matches` and brings the counters in
    /// line: new pids get a counter whose threads start their first interval
    /// at `now`, vanished pids lose theirs.
    pub fn apply_matches(&mut self, matches: Vec<ProcessMatch>, now: Instant) -> RefreshSummary {
        self.name_pids.clear();
        self.pid_name.clear();
        for m in matches {
            self.name_pids.entry(m.name.clone()).or_default().push(m.pid);
            self.pid_name.insert(m.pid, m.name);
        }

        let before = self.counters.len();
        let pid_name = &self.pid_name;
        self.counters.retain(|pid, _| pid_name.contains_key(pid));
        let removed = before - self.counters.len();

        let mut new_pids: Vec<u32> = self
            .pid_name
            .keys()
            .filter(|pid| !self.counters.contains_key(*pid))
            .copied()
            .collect();
        new_pids.sort_unstable();
        for pid in &new_pids {
            let mut counter = ProcessCounter::new(*pid, self.procfs.clone(), self.source.clone(), now);
            counter.reconcile_tasks(now);
            self.counters.insert(*pid, counter);
        }

        RefreshSummary {
            added: new_pids.len(),
            removed,
            tracked: self.counters.len(),
        }
    }

    /// Samples every tracked process for the interval ending at `now` and
    /// folds the results per name, ordered by name.
    ///
    /// Processes still on their baseline interval or whose interval
    /// truncates to zero seconds are left out, and names with nothing left
    /// are absent from the result.
    pub fn sample_at(&mut self, now: Instant) -> Result<Vec<NameBundle>, TaskstatsError> {
        let mut bundles: BTreeMap<&str, NameBundle> = BTreeMap::new();
        for (pid, counter) in self.counters.iter_mut() {
            let Some(name) = self.pid_name.get(pid) else {
                continue;
            };
            let Some(sample) = counter.sample(now)? else {
                trace!(pid, "No sample this pass.");
                continue;
            };
            if sample.warming_up {
                trace!(pid, "Baseline interval; sample dropped.");
                continue;
            }
            if sample.duration_secs == 0 {
                trace!(pid, "Interval too short; sample dropped.");
                continue;
            }
            match bundles.get_mut(name.as_str()) {
                Some(bundle) => bundle.fold(&sample, self.averaging),
                None => {
                    bundles.insert(name.as_str(), NameBundle::from_sample(name, &sample));
                }
            }
        }
        Ok(bundles.into_values().collect())
    }
}

/// Result of offering a report to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Queued,
    /// The queue was full (or closed); the report is gone.
    Dropped,
}

/// Producer side of the bounded report queue.
#[derive(Debug, Clone)]
pub struct ReportQueue {
    tx: Sender<Report>,
    metrics: Arc<Metrics>,
}

impl ReportQueue {
    /// Creates the queue and the receiver the reporter drains.
    pub fn bounded(capacity: usize, metrics: Arc<Metrics>) -> (Self, Receiver<Report>) {
        let (tx, rx) = async_channel::bounded(capacity);
        (Self { tx, metrics }, rx)
    }

    /// Enqueues `report` without waiting. A full queue drops it.
    pub fn offer(&self, report: Report) -> Offer {
        match self.tx.try_send(report) {
            Ok(()) => {
                self.metrics.reports_enqueued_total.increment(1);
                Offer::Queued
            }
            Err(TrySendError::Full(_)) => {
                warn!(capacity = ?self.tx.capacity(), "Report queue full; dropping report.");
                self.metrics.reports_dropped_total.increment(1);
                Offer::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Report queue closed; dropping report.");
                self.metrics.reports_dropped_total.increment(1);
                Offer::Dropped
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

/// Owns the shared state and runs the refresh and sampling loops.
pub struct ProcessMonitor {
    state: Arc<Mutex<MonitorState>>,
    lister: Arc<dyn ProcessLister>,
    queue: ReportQueue,
    host: String,
    self_pid: u32,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for ProcessMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessMonitor")
            .field("lister", &self.lister.name())
            .field("host", &self.host)
            .field("self_pid", &self.self_pid)
            .finish_non_exhaustive()
    }
}

impl ProcessMonitor {
    pub fn new(
        state: MonitorState,
        lister: Arc<dyn ProcessLister>,
        queue: ReportQueue,
        host: String,
        self_pid: u32,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            lister,
            queue,
            host,
            self_pid,
            metrics,
        }
    }

    /// Shared handle to the state, for inspection.
    pub fn state(&self) -> Arc<Mutex<MonitorState>> {
        self.state.clone()
    }

    /// Re-lists processes and reconciles the counters with the result.
    pub async fn refresh(&self) -> Result<RefreshSummary, MonitorError> {
        let listing = self.lister.list().await.map_err(MonitorError::Listing)?;

        let state = self.state.clone();
        let self_pid = self.self_pid;
        let (summary, tasks) = tokio::task::spawn_blocking(move || -> Result<_, MonitorError> {
            let mut state = state.lock().map_err(|_| MonitorError::Poisoned)?;
            let matches = match_processes(&listing, state.names(), self_pid);
            Ok((state.apply_matches(matches, Instant::now()), state.tracked_tasks()))
        })
        .await??;

        self.metrics.set_tracked_processes(summary.tracked);
        self.metrics.set_tracked_tasks(tasks);
        if summary.added > 0 || summary.removed > 0 {
            info!(
                lister = self.lister.name(),
                added = summary.added,
                removed = summary.removed,
                tracked = summary.tracked,
                "Process set changed."
            );
        } else {
            debug!(tracked = summary.tracked, "Process set unchanged.");
        }
        Ok(summary)
    }

    /// Runs one sampling pass and returns the report it produced, if any.
    pub async fn sample(&self) -> Result<Option<Report>, MonitorError> {
        let state = self.state.clone();
        let started = Instant::now();
        let (bundles, tasks) = tokio::task::spawn_blocking(move || -> Result<_, MonitorError> {
            let mut state = state.lock().map_err(|_| MonitorError::Poisoned)?;
            let bundles = state.sample_at(Instant::now())?;
            Ok((bundles, state.tracked_tasks()))
        })
        .await??;
        self.metrics.sample_pass_duration_seconds.record(started.elapsed().as_secs_f64());
        self.metrics.set_tracked_tasks(tasks);

        debug!(names = bundles.len(), tasks, "Sampling pass complete.");
        Ok(build_report(&self.host, &bundles))
    }

    /// Samples and offers the resulting report to the queue.
    pub async fn sample_and_enqueue(&self) -> Result<Option<Offer>, MonitorError> {
        Ok(self.sample().await?.map(|report| self.queue.offer(report)))
    }

    /// Refreshes every `period` until shutdown. Listing failures are logged
    /// and retried on the next tick.
    #[instrument(skip_all, fields(period_secs = period.as_secs()))]
    pub async fn run_refresher(
        self: Arc<Self>,
        period: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), MonitorError> {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    info!("Refresher received shutdown signal.");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }
            match self.refresh().await {
                Ok(_) => {}
                Err(e) if !e.is_fatal() => warn!(error = %e, "Refresh failed; keeping previous process set."),
                Err(e) => return Err(e),
            }
        }
    }

    /// Samples every `period` until shutdown or a fatal accounting error.
    #[instrument(skip_all, fields(period_secs = period.as_secs()))]
    pub async fn run_sampler(
        self: Arc<Self>,
        period: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), MonitorError> {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    info!("Sampler received shutdown signal.");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }
            match self.sample_and_enqueue().await? {
                Some(offer) => trace!(?offer, "Report offered."),
                None => debug!("Nothing to report this pass."),
            }
        }
    }
}

/// Hands queued reports to `reporter` one at a time until shutdown or until
/// every producer is gone. Failed reports are not retried.
#[instrument(skip_all, fields(reporter = reporter.name()))]
pub async fn run_reporter(
    rx: Receiver<Report>,
    reporter: Arc<dyn Reporter>,
    metrics: Arc<Metrics>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let report = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                info!("Reporter received shutdown signal.");
                break;
            }
            res = rx.recv() => match res {
                Ok(report) => report,
                Err(_) => {
                    info!("Report queue closed; reporter shutting down.");
                    break;
                }
            },
        };

        match reporter.report(&report).await {
            Ok(()) => {
                metrics.reports_sent_total.increment(1);
                debug!(services = report.list.len(), "Report delivered.");
            }
            Err(e) => {
                metrics.report_failures_total.increment(1);
                error!(error = %e, "Failed to deliver report.");
            }
        }
    }
}
