use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use forge::*;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Report delivery that keeps every delivered report.
#[derive(Clone, Default)]
pub struct RecordingReportSink {
    reports: Arc<Mutex<Vec<AggregatedReport>>>,
    failure: Arc<Mutex<Option<String>>>,
    delivered: Arc<Notify>,
}

impl RecordingReportSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose deliveries are recorded and then fail.
    pub fn failing(reason: impl Into<String>) -> Self {
        let sink = Self::new();
        *sink.failure.lock() = Some(reason.into());
        sink
    }

    pub fn reports(&self) -> Vec<AggregatedReport> {
        self.reports.lock().clone()
    }

    pub fn assert_report_count_eq(&self, expected: usize) {
        let count = self.reports.lock().len();
        assert_eq!(
            count, expected,
            "Expected {} delivered reports, got {}",
            expected, count
        );
    }

    /// Wait until at least `count` reports were delivered.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<AggregatedReport> {
        let wait = async {
            loop {
                let notified = self.delivered.notified();
                if self.reports.lock().len() >= count {
                    return;
                }
                notified.await;
            }
        };
        let _ = tokio::time::timeout(timeout, wait).await;
        self.reports()
    }
}

#[async_trait]
impl ReportDelivery for RecordingReportSink {
    async fn deliver(&self, report: &AggregatedReport) -> Result<(), DeliveryError> {
        self.reports.lock().push(report.clone());
        self.delivered.notify_waiters();

        match self.failure.lock().clone() {
            Some(reason) => Err(DeliveryError::Failed(reason)),
            None => Ok(()),
        }
    }
}
