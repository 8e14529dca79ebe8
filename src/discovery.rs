//! Finding the processes that belong to each monitored name.

use crate::core::{ListedProcess, ProcessLister, ProcessMatch};
use crate::procfs::{ProcError, ProcFs};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, trace};

/// Attributes listing lines to monitored names.
///
/// A line matches a name when it contains it as a substring. Names are tried
/// in configuration order and the first hit wins, so a line mentioning two
/// monitored names is counted once. `self_pid` is never matched, since the
/// agent's own command line usually carries every name it watches.
pub fn match_processes(listing: &[ListedProcess], names: &[String], self_pid: u32) -> Vec<ProcessMatch> {
    listing
        .iter()
        .filter(|p| p.pid != self_pid)
        .filter_map(|p| {
            names
                .iter()
                .find(|name| p.line.contains(name.as_str()))
                .map(|name| ProcessMatch {
                    pid: p.pid,
                    name: name.clone(),
                })
        })
        .collect()
}

/// Parses `ps -ef` output: a header line, then the pid in the second column.
pub fn parse_ps_output(output: &str) -> Vec<ListedProcess> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let pid = line.split_whitespace().nth(1)?.parse().ok()?;
            Some(ListedProcess {
                pid,
                line: line.to_string(),
            })
        })
        .collect()
}

/// Lists processes by running `ps -ef`.
#[derive(Debug, Default)]
pub struct PsProcessLister;

#[async_trait]
impl ProcessLister for PsProcessLister {
    fn name(&self) -> &str {
        "ps"
    }

    async fn list(&self) -> Result<Vec<ListedProcess>> {
        let output = Command::new("ps")
            .arg("-ef")
            .output()
            .await
            .context("failed to run `ps -ef`")?;
        if !output.status.success() {
            bail!("`ps -ef` exited with {}", output.status);
        }
        let listing = parse_ps_output(&String::from_utf8_lossy(&output.stdout));
        debug!(processes = listing.len(), "Listed processes via ps.");
        Ok(listing)
    }
}

/// Lists processes by reading every `/proc/<pid>/cmdline`.
#[derive(Debug, Clone)]
pub struct ProcfsProcessLister {
    procfs: ProcFs,
}

impl ProcfsProcessLister {
    pub fn new(procfs: ProcFs) -> Self {
        Self { procfs }
    }
}

#[async_trait]
impl ProcessLister for ProcfsProcessLister {
    fn name(&self) -> &str {
        "procfs"
    }

    async fn list(&self) -> Result<Vec<ListedProcess>> {
        let procfs = self.procfs.clone();
        let listing = tokio::task::spawn_blocking(move || -> Result<Vec<ListedProcess>> {
            let pids = procfs
                .list_pids()
                .with_context(|| format!("failed to read {}", procfs.root().display()))?;
            let mut listing = Vec::with_capacity(pids.len());
            for pid in pids {
                match procfs.read_command_line(pid) {
                    Ok(line) => listing.push(ListedProcess { pid, line }),
                    Err(ProcError::NotFound(_)) => trace!(pid, "Process exited while listing."),
                    Err(e) => trace!(pid, error = %e, "Skipping unreadable process."),
                }
            }
            Ok(listing)
        })
        .await??;
        debug!(processes = listing.len(), "Listed processes via procfs.");
        Ok(listing)
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use super::*;
    use std::sync::Mutex;

    /// A lister returning whatever listing was last set.
    #[derive(Debug, Default)]
    pub struct StaticProcessLister {
        listing: Mutex<Vec<ListedProcess>>,
    }

    impl StaticProcessLister {
        pub fn new(listing: Vec<ListedProcess>) -> Self {
            Self {
                listing: Mutex::new(listing),
            }
        }

        /// Builds a listing from `(pid, line)` pairs.
        pub fn from_pairs(pairs: &[(u32, &str)]) -> Self {
            Self::new(listed(pairs))
        }

        pub fn set(&self, pairs: &[(u32, &str)]) {
            *self.listing.lock().unwrap() = listed(pairs);
        }
    }

    pub fn listed(pairs: &[(u32, &str)]) -> Vec<ListedProcess> {
        pairs
            .iter()
            .map(|(pid, line)| ListedProcess {
                pid: *pid,
                line: line.to_string(),
            })
            .collect()
    }

    #[async_trait]
    impl ProcessLister for StaticProcessLister {
        fn name(&self) -> &str {
            "static"
        }

        async fn list(&self) -> Result<Vec<ListedProcess>> {
            Ok(self.listing.lock().unwrap().clone())
        }
    }
}
