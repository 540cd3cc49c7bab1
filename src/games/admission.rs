//! Wager admission
//!
//! Called only from the engine task with exclusive access to the active round,
//! so the phase check, the debit, the insert and the journal write form one
//! unit that no phase transition can interleave with.
//!
//! A journal write that times out may still land afterwards. The compensated
//! wager is therefore kept as a REFUNDED record, written now and again with
//! the settlement batch, and its refund uses the wager's refund reference so
//! recovery never returns the stake a second time.

use crate::common::traits::{AlertSink, Ledger, RoundStore};
use crate::common::types::ReconciliationAlert;
use crate::config::GameConfig;
use crate::errors::{AdmitError, LedgerError, Rejection, SpinwheelError, SpinwheelResult, StorageError};
use crate::games::round::ActiveRound;
use crate::games::sectors::SectorTable;
use crate::games::types::{BetKind, Wager, WagerReceipt, WagerRequest, WagerStatus};
use crate::metrics::EngineMetrics;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const COMPENSATION_ATTEMPTS: u32 = 3;

/// Betting limits
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdmissionRules {
    pub min_bet: u64,
    pub max_bet: u64,
    pub max_wagers_per_player: usize,
}

impl From<&GameConfig> for AdmissionRules {
    fn from(game: &GameConfig) -> Self {
        Self {
            min_bet: game.min_bet,
            max_bet: game.max_bet,
            max_wagers_per_player: game.max_wagers_per_player,
        }
    }
}

pub struct AdmissionController {
    rules: AdmissionRules,
    table: Arc<SectorTable>,
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn RoundStore>,
    alerts: Arc<dyn AlertSink>,
    metrics: Arc<EngineMetrics>,
    store_timeout: Duration,
}

impl AdmissionController {
    pub fn new(
        rules: AdmissionRules,
        table: Arc<SectorTable>,
        ledger: Arc<dyn Ledger>,
        store: Arc<dyn RoundStore>,
        alerts: Arc<dyn AlertSink>,
        metrics: Arc<EngineMetrics>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            rules,
            table,
            ledger,
            store,
            alerts,
            metrics,
            store_timeout,
        }
    }

    /// Checks 1-4; the first failing check wins. Touches no state.
    pub fn validate(
        &self,
        active: &ActiveRound,
        request: &WagerRequest,
        now_ms: i64,
    ) -> Result<BetKind, Rejection> {
        if !active.accepts_wagers(now_ms) {
            return Err(Rejection::BettingClosed);
        }
        let kind = self
            .table
            .resolve_kind(&request.bet_kind)
            .ok_or(Rejection::InvalidBetKind)?;
        if request.amount < self.rules.min_bet || request.amount > self.rules.max_bet {
            return Err(Rejection::AmountOutOfRange);
        }
        if active.wager_count(&request.player_id) >= self.rules.max_wagers_per_player {
            return Err(Rejection::MaxBetsExceeded);
        }
        Ok(kind)
    }

    /// Validate, debit, record and journal one wager.
    ///
    /// On any error the player's balance and the admitted set are as before the call.
    pub async fn admit(
        &self,
        active: &mut ActiveRound,
        request: WagerRequest,
        now_ms: i64,
    ) -> Result<(WagerReceipt, Wager), AdmitError> {
        let round_id = active.round_id();

        let kind = match self.validate(active, &request, now_ms) {
            Ok(kind) => kind,
            Err(rejection) => return Err(self.reject(round_id, &request, rejection)),
        };

        let balance = match self.ledger.debit(&request.player_id, request.amount).await {
            Ok(balance) => balance,
            Err(LedgerError::InsufficientFunds { .. }) | Err(LedgerError::UnknownAccount(_)) => {
                return Err(self.reject(round_id, &request, Rejection::InsufficientBalance));
            }
            Err(e) => {
                warn!(round_id, player_id = %request.player_id, error = %e, "Debit failed");
                self.metrics.admission_failures.inc();
                return Err(AdmitError::Internal(e.into()));
            }
        };

        let wager = Wager {
            wager_id: Uuid::new_v4().to_string(),
            round_id,
            player_id: request.player_id,
            bet_kind: kind,
            amount: request.amount,
            status: WagerStatus::Pending,
            payout: 0,
            placed_at_ms: now_ms,
        };

        if let Err(violation) = active.insert(wager.clone()) {
            self.compensate(&wager, "admitted-set insert refused").await;
            return Err(AdmitError::Internal(violation.into()));
        }

        let journaled = self.bounded(self.journal(active, &wager)).await;

        if let Err(e) = journaled {
            let withdrawn = active.withdraw(&wager.wager_id);
            self.compensate(&wager, "wager journal write failed").await;
            if let Some(record) = withdrawn {
                self.record_withdrawal(&record).await;
            }
            error!(
                round_id,
                wager_id = %wager.wager_id,
                player_id = %wager.player_id,
                error = %e,
                "Wager journal failed; debit reversed"
            );
            return Err(AdmitError::Internal(e));
        }

        self.metrics.wagers_admitted.inc();
        self.metrics.amount_wagered.inc_by(wager.amount);
        self.metrics.active_wagers.set(active.wagers().len() as i64);

        info!(
            round_id,
            wager_id = %wager.wager_id,
            player_id = %wager.player_id,
            bet_kind = %wager.bet_kind,
            amount = wager.amount,
            balance,
            "Wager admitted"
        );

        let receipt = WagerReceipt {
            wager_id: wager.wager_id.clone(),
            round_id,
            bet_kind: wager.bet_kind.clone(),
            amount: wager.amount,
            balance,
        };
        Ok((receipt, wager))
    }

    async fn bounded(&self, op: impl std::future::Future<Output = SpinwheelResult<()>>) -> SpinwheelResult<()> {
        match tokio::time::timeout(self.store_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(SpinwheelError::Storage(StorageError::Timeout(
                self.store_timeout.as_millis() as u64,
            ))),
        }
    }

    /// Best effort; the settlement batch writes the same record again
    async fn record_withdrawal(&self, record: &Wager) {
        let written = self
            .bounded(self.store.save_wagers(std::slice::from_ref(record)))
            .await;
        if let Err(e) = written {
            warn!(wager_id = %record.wager_id, error = %e, "Refunded wager record not written");
        }
    }

    async fn journal(&self, active: &mut ActiveRound, wager: &Wager) -> SpinwheelResult<()> {
        if !active.is_journaled() {
            self.store.save_round(active.round()).await?;
            active.mark_journaled();
        }
        self.store.save_wagers(std::slice::from_ref(wager)).await
    }

    fn reject(&self, round_id: u64, request: &WagerRequest, rejection: Rejection) -> AdmitError {
        self.metrics.record_rejection(rejection);
        debug!(
            round_id,
            player_id = %request.player_id,
            bet_kind = %request.bet_kind,
            amount = request.amount,
            reason = rejection.code(),
            "Wager rejected"
        );
        AdmitError::Rejected(rejection)
    }

    /// Return a debit whose wager could not be recorded
    async fn compensate(&self, wager: &Wager, reason: &str) {
        self.metrics.admission_failures.inc();
        for attempt in 1..=COMPENSATION_ATTEMPTS {
            let reference = wager.refund_reference();
            match self.ledger.credit(&wager.player_id, wager.amount, &reference).await {
                Ok(_) => return,
                Err(e) => warn!(
                    wager_id = %wager.wager_id,
                    attempt,
                    error = %e,
                    "Compensating credit failed"
                ),
            }
        }
        self.alerts.raise(ReconciliationAlert {
            round_id: wager.round_id,
            attempts: COMPENSATION_ATTEMPTS,
            reason: format!("compensating credit failed after {}", reason),
            unpaid_credits: vec![(wager.player_id.clone(), wager.amount)],
            raised_at_ms: wager.placed_at_ms,
        });
        self.metrics.reconciliation_alerts.inc();
    }
}
