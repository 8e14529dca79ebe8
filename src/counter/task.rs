use crate::core::PollOutcome;
use crate::taskstats::{AccountingRecord, TaskAccountingClient, TaskstatsError};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Accounting state for a single thread.
#[derive(Debug)]
pub struct TaskCounter {
    client: TaskAccountingClient,
    baseline: Option<AccountingRecord>,
    last_delta: AccountingRecord,
    last_poll: Instant,
    duration: Duration,
    warming_up: bool,
}

impl TaskCounter {
    /// Starts tracking a thread; `now` is the start of its first interval.
    pub fn new(client: TaskAccountingClient, now: Instant) -> Self {
        Self {
            client,
            baseline: None,
            last_delta: AccountingRecord::zero(),
            last_poll: now,
            duration: Duration::ZERO,
            warming_up: true,
        }
    }

    pub fn tid(&self) -> u32 {
        self.client.tid()
    }

    /// Length of the interval covered by the last `update`.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn last_delta(&self) -> &AccountingRecord {
        &self.last_delta
    }

    /// True while the last `update` had no baseline to compare against, so
    /// its zero delta says nothing about the thread's I/O.
    pub fn warming_up(&self) -> bool {
        self.warming_up
    }

    /// Polls the kernel and returns the growth of every counter since the
    /// previous successful poll.
    ///
    /// The first record only establishes a baseline, so the first delta is
    /// always zero and `warming_up` stays set. A regression starts a new
    /// baseline the same way. When no record arrives the baseline is kept and
    /// the interval contributes zero.
    pub fn update(&mut self, now: Instant) -> Result<AccountingRecord, TaskstatsError> {
        self.duration = now.saturating_duration_since(self.last_poll);
        self.last_poll = now;

        let delta = match self.client.poll()? {
            PollOutcome::Record(current) => {
                let delta = match &self.baseline {
                    None => None,
                    Some(previous) if current.regressed_from(previous) => {
                        debug!(tid = self.tid(), "Accounting counters went backwards; resetting baseline.");
                        None
                    }
                    Some(previous) => Some(current.delta_from(previous)),
                };
                self.baseline = Some(current);
                self.warming_up = delta.is_none();
                delta.unwrap_or_default()
            }
            outcome => {
                trace!(tid = self.tid(), ?outcome, "No accounting record this interval.");
                self.warming_up = self.baseline.is_none();
                AccountingRecord::zero()
            }
        };
        self.last_delta = delta;
        Ok(delta)
    }
}
