#![allow(dead_code)]
use async_trait::async_trait;
use procmon::core::{Report, Reporter};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

/// A reporter that keeps every report it receives.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<Report>>,
    notifier: Notify,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().unwrap().clone()
    }

    /// Waits until at least `count` reports have arrived and returns them.
    pub async fn wait_for_reports(&self, count: usize, timeout_duration: Duration) -> Vec<Report> {
        let wait_future = async {
            loop {
                let notified = self.notifier.notified();
                if self.reports.lock().unwrap().len() >= count {
                    break;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout_duration, wait_future)
            .await
            .expect("Timed out waiting for reports");
        self.reports()
    }
}

#[async_trait]
impl Reporter for RecordingReporter {
    fn name(&self) -> &str {
        "recording_mock"
    }

    async fn report(&self, report: &Report) -> anyhow::Result<()> {
        self.reports.lock().unwrap().push(report.clone());
        self.notifier.notify_waiters();
        Ok(())
    }
}

/// A reporter that rejects everything and counts attempts.
#[derive(Debug, Default)]
pub struct FailingReporter {
    attempts: Mutex<usize>,
    notifier: Notify,
}

impl FailingReporter {
    pub fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap()
    }

    pub async fn wait_for_attempts(&self, count: usize, timeout_duration: Duration) {
        let wait_future = async {
            loop {
                let notified = self.notifier.notified();
                if self.attempts() >= count {
                    break;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout_duration, wait_future)
            .await
            .expect("Timed out waiting for report attempts");
    }
}

#[async_trait]
impl Reporter for FailingReporter {
    fn name(&self) -> &str {
        "failing_mock"
    }

    async fn report(&self, _report: &Report) -> anyhow::Result<()> {
        *self.attempts.lock().unwrap() += 1;
        self.notifier.notify_waiters();
        anyhow::bail!("collector unavailable")
    }
}
