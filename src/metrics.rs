//! Prometheus metrics for the round engine

use crate::errors::{Rejection, SpinwheelResult};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub struct EngineMetrics {
    registry: Registry,
    pub wagers_admitted: IntCounter,
    pub wagers_rejected: IntCounterVec,
    pub admission_failures: IntCounter,
    pub rounds_settled: IntCounter,
    pub rounds_voided: IntCounter,
    pub amount_wagered: IntCounter,
    pub amount_paid: IntCounter,
    pub amount_refunded: IntCounter,
    pub persistence_retries: IntCounter,
    pub credit_retries: IntCounter,
    pub reconciliation_alerts: IntCounter,
    pub current_round: IntGauge,
    pub active_wagers: IntGauge,
    pub pending_reconciliation: IntGauge,
}

impl EngineMetrics {
    pub fn new() -> SpinwheelResult<Self> {
        let registry = Registry::new_custom(Some("spinwheel".to_string()), None)?;

        let counter = |name: &str, help: &str| -> SpinwheelResult<IntCounter> {
            let c = IntCounter::new(name, help)?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let gauge = |name: &str, help: &str| -> SpinwheelResult<IntGauge> {
            let g = IntGauge::new(name, help)?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };

        let wagers_rejected = IntCounterVec::new(
            Opts::new("wagers_rejected_total", "Wagers rejected, by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(wagers_rejected.clone()))?;
        // Pre-create every label so all reasons show up at zero
        for r in Rejection::all() {
            wagers_rejected.with_label_values(&[r.code()]);
        }

        Ok(Self {
            wagers_admitted: counter("wagers_admitted_total", "Wagers admitted")?,
            wagers_rejected,
            admission_failures: counter(
                "admission_failures_total",
                "Admissions aborted by an internal error and compensated",
            )?,
            rounds_settled: counter("rounds_settled_total", "Rounds settled")?,
            rounds_voided: counter("rounds_voided_total", "Rounds voided by recovery")?,
            amount_wagered: counter("amount_wagered_total", "Minor units debited for wagers")?,
            amount_paid: counter("amount_paid_total", "Minor units credited as payouts")?,
            amount_refunded: counter("amount_refunded_total", "Minor units refunded by recovery")?,
            persistence_retries: counter(
                "persistence_retries_total",
                "Settlement writes retried after a failure",
            )?,
            credit_retries: counter("credit_retries_total", "Payout credits retried")?,
            reconciliation_alerts: counter(
                "reconciliation_alerts_total",
                "Rounds parked for manual reconciliation",
            )?,
            current_round: gauge("current_round_id", "Id of the active round")?,
            active_wagers: gauge("active_round_wagers", "Wagers admitted in the active round")?,
            pending_reconciliation: gauge(
                "pending_reconciliation_rounds",
                "Rounds waiting for settlement persistence",
            )?,
            registry,
        })
    }

    pub fn record_rejection(&self, rejection: Rejection) {
        self.wagers_rejected
            .with_label_values(&[rejection.code()])
            .inc();
    }

    pub fn rejections(&self, rejection: Rejection) -> u64 {
        self.wagers_rejected
            .with_label_values(&[rejection.code()])
            .get()
    }

    /// Prometheus text exposition format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_namespaced_metrics() {
        let metrics = EngineMetrics::new().unwrap();
        metrics.wagers_admitted.inc();
        metrics.record_rejection(Rejection::MaxBetsExceeded);
        metrics.current_round.set(7);

        let text = metrics.render();
        assert!(text.contains("spinwheel_wagers_admitted_total 1"));
        assert!(text.contains("reason=\"MAX_BETS_EXCEEDED\"} 1"));
        assert!(text.contains("reason=\"BETTING_CLOSED\"} 0"));
        assert!(text.contains("spinwheel_current_round_id 7"));
        assert_eq!(metrics.rejections(Rejection::MaxBetsExceeded), 1);
    }

    #[test]
    fn test_instances_are_independent() {
        let a = EngineMetrics::new().unwrap();
        let b = EngineMetrics::new().unwrap();
        a.rounds_settled.inc();
        assert_eq!(b.rounds_settled.get(), 0);
    }
}
