//! Alert sinks for rounds that need manual reconciliation

use crate::common::traits::AlertSink;
use crate::common::types::ReconciliationAlert;
use std::sync::Mutex;

/// Emits alerts as error-level log events
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn raise(&self, alert: ReconciliationAlert) {
        tracing::error!(
            round_id = alert.round_id,
            attempts = alert.attempts,
            unpaid = alert.unpaid_credits.len(),
            reason = %alert.reason,
            "Round requires manual reconciliation"
        );
    }
}

/// Keeps every alert in memory; lets tests assert on the alerting path
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<ReconciliationAlert>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<ReconciliationAlert> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

impl AlertSink for RecordingAlertSink {
    fn raise(&self, alert: ReconciliationAlert) {
        TracingAlertSink.raise(alert.clone());
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push(alert);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink_keeps_alerts() {
        let sink = RecordingAlertSink::new();
        sink.raise(ReconciliationAlert {
            round_id: 3,
            attempts: 5,
            reason: "disk full".into(),
            unpaid_credits: vec![],
            raised_at_ms: 0,
        });
        let alerts = sink.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].round_id, 3);
    }
}
