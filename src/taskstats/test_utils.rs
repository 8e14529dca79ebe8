use crate::core::{AccountingSource, PollOutcome};
use crate::taskstats::{AccountingRecord, TaskstatsError};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
enum FakeReply {
    Outcome(PollOutcome),
    UnsupportedVersion(u16),
}

/// In-memory accounting source. Each tid answers with whatever was last
/// configured for it; unknown tids answer `Gone`.
#[derive(Debug, Default)]
pub struct FakeAccountingSource {
    replies: Mutex<HashMap<u32, FakeReply>>,
    calls: Mutex<Vec<u32>>,
}

impl FakeAccountingSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cumulative record `tid` reports from now on.
    pub fn set_record(&self, tid: u32, record: AccountingRecord) {
        self.set_outcome(tid, PollOutcome::Record(record));
    }

    /// Convenience for the common case of only `read_bytes`/`write_bytes`.
    pub fn set_io(&self, tid: u32, read_bytes: u64, write_bytes: u64) {
        self.set_record(
            tid,
            AccountingRecord {
                read_bytes,
                write_bytes,
                ..Default::default()
            },
        );
    }

    pub fn set_outcome(&self, tid: u32, outcome: PollOutcome) {
        self.replies
            .lock()
            .unwrap()
            .insert(tid, FakeReply::Outcome(outcome));
    }

    /// Makes `tid` answer with a record older than the supported layout.
    pub fn set_unsupported_version(&self, tid: u32, version: u16) {
        self.replies
            .lock()
            .unwrap()
            .insert(tid, FakeReply::UnsupportedVersion(version));
    }

    pub fn remove(&self, tid: u32) {
        self.replies.lock().unwrap().remove(&tid);
    }

    /// Every tid fetched so far, in order.
    pub fn calls(&self) -> Vec<u32> {
        self.calls.lock().unwrap().clone()
    }
}

impl AccountingSource for FakeAccountingSource {
    fn fetch(&self, tid: u32) -> Result<PollOutcome, TaskstatsError> {
        self.calls.lock().unwrap().push(tid);
        match self.replies.lock().unwrap().get(&tid) {
            Some(FakeReply::Outcome(outcome)) => Ok(outcome.clone()),
            Some(FakeReply::UnsupportedVersion(v)) => Err(TaskstatsError::UnsupportedVersion(*v)),
            None => Ok(PollOutcome::Gone),
        }
    }
}
