//! Core domain types and service traits for procmon
//!
//! This module defines the data that flows between the sampling pipeline
//! and its collaborators, and the trait contracts those collaborators
//! implement.

use crate::taskstats::{AccountingRecord, TaskstatsError};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result of asking the kernel for one task's accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The task's current cumulative counters.
    Record(AccountingRecord),
    /// The task no longer exists.
    Gone,
    /// Nothing usable this time (short or incomplete reply, timeout).
    NoData,
}

/// One line of a process listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedProcess {
    pub pid: u32,
    /// The full listing line (or command line) the configured names are
    /// matched against.
    pub line: String,
}

/// A process listing line attributed to one monitored name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessMatch {
    pub pid: u32,
    pub name: String,
}

/// One process's contribution for one sampling interval.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSample {
    /// Sum of the per-thread accounting deltas.
    pub accounting: AccountingRecord,
    /// Mean per-thread interval, truncated to whole seconds.
    pub duration_secs: u64,
    pub vm_bytes: u64,
    pub rss_bytes: u64,
    /// Fraction of one core.
    pub cpu_usage: f64,
    pub num_threads: u64,
    /// Every thread was still establishing its baseline, so `accounting` is
    /// zero for lack of history rather than lack of I/O.
    pub warming_up: bool,
}

/// Metrics for one service inside a report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServiceData {
    /// Bytes per second read from storage over the interval.
    pub read_bytes: u64,
    /// Bytes per second written to storage over the interval.
    pub write_bytes: u64,
    pub rss: u64,
    pub vm: u64,
    pub cpu_usage: f64,
    pub num_threads: u64,
    pub num_processes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServiceReport {
    pub service: String,
    pub data: ServiceData,
}

/// The document shipped to the collector once per sampling interval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Report {
    pub host: String,
    pub list: Vec<ServiceReport>,
}

impl Report {
    pub fn service(&self, name: &str) -> Option<&ServiceData> {
        self.list
            .iter()
            .find(|s| s.service == name)
            .map(|s| &s.data)
    }
}

// =============================================================================
// Service Traits
// =============================================================================

/// Supplies per-task accounting records.
///
/// Implementations block until the kernel answers (or a timeout passes) and
/// must be safe to share between threads.
pub trait AccountingSource: Send + Sync {
    /// Fetches the current cumulative record for `tid`.
    ///
    /// # Returns
    /// * `Ok(PollOutcome)` for a record or a non-fatal absence of data
    /// * `Err` when the session itself is unusable
    fn fetch(&self, tid: u32) -> Result<PollOutcome, TaskstatsError>;
}

impl std::fmt::Debug for dyn AccountingSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccountingSource")
    }
}

/// Enumerates the processes running on the host.
#[async_trait]
pub trait ProcessLister: Send + Sync {
    /// A short name for logs ("ps", "procfs").
    fn name(&self) -> &str;

    /// Lists every process currently visible.
    async fn list(&self) -> Result<Vec<ListedProcess>>;
}

/// Delivers reports to their destination.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// A unique, descriptive name for the reporter (e.g., "http", "stdout").
    fn name(&self) -> &str;

    /// Sends one report.
    ///
    /// # Returns
    /// * `Ok(())` if the report was accepted
    /// * `Err` on transport or server failure; the report is not retried
    async fn report(&self, report: &Report) -> Result<()>;
}
