//! Per-task delay and I/O accounting read from the kernel's taskstats
//! interface over generic netlink.
//!
//! - **`codec`**: pure encode/decode of the netlink envelope and of the
//!   fixed-offset `struct taskstats` payload.
//! - **`client`**: the shared netlink session and the per-tid
//!   `TaskAccountingClient` built on top of it.

pub mod client;
pub mod codec;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use std::sync::OnceLock;
use thiserror::Error;
use tracing::{info, warn};

pub use client::{NetlinkSession, TaskAccountingClient};
pub use codec::DecodeError;
pub use crate::core::{AccountingSource, PollOutcome};

/// Minimum `struct taskstats` version whose layout matches the offsets below.
pub const MIN_TASKSTATS_VERSION: u16 = 4;

/// Minimum payload length covering every decoded field.
pub const MIN_TASKSTATS_LEN: usize = 272;

/// Direction of an element-wise `accumulate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sign {
    Plus,
    Minus,
}

/// The subset of `struct taskstats` the agent tracks.
///
/// All counters are cumulative for the lifetime of the task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountingRecord {
    pub blkio_delay_total: u64,
    pub swapin_delay_total: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub cancelled_write_bytes: u64,
}

impl AccountingRecord {
    /// Byte offsets of each counter inside `struct taskstats` (version >= 4).
    pub const FIELD_OFFSETS: [(&'static str, usize); 5] = [
        ("blkio_delay_total", 40),
        ("swapin_delay_total", 56),
        ("read_bytes", 248),
        ("write_bytes", 256),
        ("cancelled_write_bytes", 264),
    ];

    /// The all-zero record.
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        self.fields().iter().all(|v| *v == 0)
    }

    /// Adds (`Sign::Plus`) or subtracts (`Sign::Minus`) `other` into `self`,
    /// field by field. Arithmetic wraps so that adding and then subtracting
    /// the same record always restores the original.
    pub fn accumulate(&mut self, other: &AccountingRecord, sign: Sign) {
        let apply = |dst: &mut u64, src: u64| {
            *dst = match sign {
                Sign::Plus => dst.wrapping_add(src),
                Sign::Minus => dst.wrapping_sub(src),
            };
        };
        apply(&mut self.blkio_delay_total, other.blkio_delay_total);
        apply(&mut self.swapin_delay_total, other.swapin_delay_total);
        apply(&mut self.read_bytes, other.read_bytes);
        apply(&mut self.write_bytes, other.write_bytes);
        apply(&mut self.cancelled_write_bytes, other.cancelled_write_bytes);
    }

    /// `self - previous`, field by field.
    pub fn delta_from(&self, previous: &AccountingRecord) -> AccountingRecord {
        let mut delta = *self;
        delta.accumulate(previous, Sign::Minus);
        delta
    }

    /// True if any counter went backwards, i.e. the tid now names a
    /// different task than the one `previous` was read from.
    pub fn regressed_from(&self, previous: &AccountingRecord) -> bool {
        self.fields()
            .iter()
            .zip(previous.fields().iter())
            .any(|(now, before)| now < before)
    }

    fn fields(&self) -> [u64; 5] {
        [
            self.blkio_delay_total,
            self.swapin_delay_total,
            self.read_bytes,
            self.write_bytes,
            self.cancelled_write_bytes,
        ]
    }
}

/// Errors that make the shared accounting session unusable.
#[derive(Error, Debug)]
pub enum TaskstatsError {
    #[error("netlink I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("netlink error reply: errno {0}")]
    Netlink(i32),

    #[error("generic netlink family {0:?} not found")]
    FamilyNotFound(String),

    #[error("taskstats version {0} is older than the supported minimum {MIN_TASKSTATS_VERSION}")]
    UnsupportedVersion(u16),

    #[error("malformed netlink message: {0}")]
    Malformed(String),
}

static DELAY_ACCOUNTING: OnceLock<bool> = OnceLock::new();

/// Probes once whether the kernel fills in delay accounting
/// (`CONFIG_TASK_DELAY_ACCT` plus the `delayacct` boot switch).
///
/// A running task that has done any block I/O reports a non-zero
/// `blkio_delay_total` only when delay accounting is active. The result is
/// stored process-wide; later calls return the first answer.
pub fn probe_delay_accounting(source: &dyn AccountingSource, tid: u32) -> bool {
    *DELAY_ACCOUNTING.get_or_init(|| match source.fetch(tid) {
        Ok(PollOutcome::Record(record)) => {
            let enabled = record.blkio_delay_total != 0;
            if enabled {
                info!(tid, "Kernel delay accounting is enabled.");
            } else {
                warn!(tid, "blkio_delay_total is zero; kernel delay accounting looks disabled.");
            }
            enabled
        }
        Ok(outcome) => {
            warn!(tid, ?outcome, "Delay accounting probe returned no data.");
            false
        }
        Err(e) => {
            warn!(tid, error = %e, "Delay accounting probe failed.");
            false
        }
    })
}

/// The result of `probe_delay_accounting`, or `None` before the probe ran.
pub fn delay_accounting_enabled() -> Option<bool> {
    DELAY_ACCOUNTING.get().copied()
}
