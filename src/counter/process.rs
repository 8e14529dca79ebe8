use super::TaskCounter;
use crate::core::{AccountingSource, ProcessSample};
use crate::procfs::{ProcFs, ProcHeadline};
use crate::taskstats::{AccountingRecord, Sign, TaskAccountingClient, TaskstatsError};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Accounting state for one process and all of its threads.
#[derive(Debug)]
pub struct ProcessCounter {
    pid: u32,
    procfs: ProcFs,
    source: Arc<dyn AccountingSource>,
    tasks: BTreeMap<u32, TaskCounter>,
    previous: Option<(ProcHeadline, Instant)>,
}

impl ProcessCounter {
    /// Starts tracking `pid`. The current stat line becomes the CPU baseline
    /// if the process is still readable.
    pub fn new(pid: u32, procfs: ProcFs, source: Arc<dyn AccountingSource>, now: Instant) -> Self {
        let previous = procfs.read_headline(pid).ok().map(|h| (h, now));
        Self {
            pid,
            procfs,
            source,
            tasks: BTreeMap::new(),
            previous,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Thread ids currently tracked.
    pub fn task_ids(&self) -> Vec<u32> {
        self.tasks.keys().copied().collect()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Brings the tracked threads in line with `/proc/<pid>/task`.
    pub fn reconcile_tasks(&mut self, now: Instant) {
        let live: BTreeSet<u32> = self.procfs.list_thread_ids(self.pid).into_iter().collect();

        let before = self.tasks.len();
        self.tasks.retain(|tid, _| live.contains(tid));
        let removed = before - self.tasks.len();

        let mut added = 0;
        for tid in live {
            if !self.tasks.contains_key(&tid) {
                let client = TaskAccountingClient::new(tid, self.source.clone());
                self.tasks.insert(tid, TaskCounter::new(client, now));
                added += 1;
            }
        }
        if added > 0 || removed > 0 {
            debug!(pid = self.pid, added, removed, "Reconciled threads.");
        }
    }

    /// Produces this process's sample for the interval ending at `now`.
    ///
    /// Returns `None` when the process has no live threads or its stat line
    /// can no longer be read.
    pub fn sample(&mut self, now: Instant) -> Result<Option<ProcessSample>, TaskstatsError> {
        self.reconcile_tasks(now);
        if self.tasks.is_empty() {
            return Ok(None);
        }

        let mut accounting = AccountingRecord::zero();
        let mut total_duration = Duration::ZERO;
        let mut warming_up = true;
        for task in self.tasks.values_mut() {
            let delta = task.update(now)?;
            accounting.accumulate(&delta, Sign::Plus);
            total_duration += task.duration();
            warming_up &= task.warming_up();
        }

        let headline = match self.procfs.read_headline(self.pid) {
            Ok(headline) => headline,
            Err(e) => {
                debug!(pid = self.pid, error = %e, "Stat unreadable; skipping sample.");
                return Ok(None);
            }
        };

        let cpu_usage = match self.previous {
            Some((before, at)) => cpu_usage(&before, &headline, now.saturating_duration_since(at)),
            None => 0.0,
        };
        self.previous = Some((headline, now));

        let duration_secs = (total_duration.as_secs_f64() / self.tasks.len() as f64) as u64;

        Ok(Some(ProcessSample {
            accounting,
            duration_secs,
            vm_bytes: headline.vm_bytes,
            rss_bytes: headline.rss_bytes,
            cpu_usage,
            num_threads: headline.num_threads,
            warming_up,
        }))
    }
}

/// CPU seconds consumed per wall-clock second between two stat reads.
fn cpu_usage(before: &ProcHeadline, after: &ProcHeadline, wall: Duration) -> f64 {
    let wall = wall.as_secs_f64();
    if wall <= 0.0 {
        return 0.0;
    }
    let busy = (after.stime_secs - before.stime_secs) + (after.utime_secs - before.utime_secs);
    (busy / wall).max(0.0)
}
