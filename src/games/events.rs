//! Engine events and their fan-out

use crate::games::types::{Outcome, RoundAggregates, RoundPhase, Wager};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events published by the round engine, in the order state changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GameEvent {
    #[serde(rename = "phase_changed")]
    PhaseChanged {
        round_id: u64,
        phase: RoundPhase,
        deadline_ms: i64,
        /// Set from DRAWING on; clients animate towards it
        outcome: Option<Outcome>,
    },

    #[serde(rename = "wager_admitted")]
    WagerAdmitted { wager: Wager },

    #[serde(rename = "round_settled")]
    RoundSettled {
        round_id: u64,
        outcome: Outcome,
        wagers: Vec<Wager>,
        aggregates: RoundAggregates,
    },

    /// Once per tick while a phase is running
    #[serde(rename = "countdown")]
    Countdown {
        round_id: u64,
        phase: RoundPhase,
        remaining_secs: u64,
    },

    /// Abandoned round refunded during startup recovery
    #[serde(rename = "round_voided")]
    RoundVoided {
        round_id: u64,
        refunded_wagers: usize,
        refunded_amount: u64,
    },
}

impl GameEvent {
    pub fn round_id(&self) -> u64 {
        match self {
            GameEvent::PhaseChanged { round_id, .. }
            | GameEvent::RoundSettled { round_id, .. }
            | GameEvent::Countdown { round_id, .. }
            | GameEvent::RoundVoided { round_id, .. } => *round_id,
            GameEvent::WagerAdmitted { wager } => wager.round_id,
        }
    }
}

/// Broadcast channel wrapper. Publishing never blocks; slow subscribers lag
/// and skip events rather than holding up the engine.
#[derive(Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<GameEvent>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: GameEvent) {
        // No receivers is fine: nobody is watching yet
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GameEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_is_tagged() {
        let event = GameEvent::Countdown {
            round_id: 3,
            phase: RoundPhase::Betting,
            remaining_secs: 12,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "countdown");
        assert_eq!(json["phase"], "BETTING");
        assert_eq!(event.round_id(), 3);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers_in_order() {
        let events = EventBroadcaster::new(16);
        let mut rx = events.subscribe();
        for round_id in 1..=3 {
            events.publish(GameEvent::RoundVoided {
                round_id,
                refunded_wagers: 0,
                refunded_amount: 0,
            });
        }
        for expected in 1..=3 {
            assert_eq!(rx.recv().await.unwrap().round_id(), expected);
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let events = EventBroadcaster::default();
        events.publish(GameEvent::RoundVoided {
            round_id: 1,
            refunded_wagers: 0,
            refunded_amount: 0,
        });
        assert_eq!(events.subscriber_count(), 0);
    }
}
