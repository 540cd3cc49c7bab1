//! Wheel layout and the outcome draw

use crate::common::traits::RandomSource;
use crate::config::GameConfig;
use crate::errors::{ConfigurationError, InvariantViolation};
use crate::games::types::{BetKind, Outcome};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sector {
    pub number: u8,
    pub kind: BetKind,
}

/// Validated sector table with its payout multipliers
#[derive(Clone, Debug)]
pub struct SectorTable {
    sectors: Vec<Sector>,
    multipliers: BTreeMap<BetKind, u32>,
}

impl SectorTable {
    /// Build from configuration; rejects any layout where a bet kind pays out
    /// more than it takes in on average
    pub fn from_config(game: &GameConfig) -> Result<Self, ConfigurationError> {
        game.validate()?;

        let parse = |raw: &str| {
            BetKind::parse(raw).ok_or_else(|| ConfigurationError::InvalidValue {
                field: "game".to_string(),
                value: raw.to_string(),
                reason: "empty bet kind".to_string(),
            })
        };

        let sectors = game
            .sectors
            .iter()
            .map(|s| {
                Ok(Sector {
                    number: s.number,
                    kind: parse(&s.kind)?,
                })
            })
            .collect::<Result<Vec<_>, ConfigurationError>>()?;

        let multipliers = game
            .payout_multipliers
            .iter()
            .map(|(kind, m)| Ok((parse(kind)?, *m)))
            .collect::<Result<BTreeMap<_, _>, ConfigurationError>>()?;

        Ok(Self {
            sectors,
            multipliers,
        })
    }

    pub fn len(&self) -> usize {
        self.sectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sectors.is_empty()
    }

    /// Known bet kind, normalized; `None` for anything not on the wheel
    pub fn resolve_kind(&self, raw: &str) -> Option<BetKind> {
        BetKind::parse(raw).filter(|k| self.multipliers.contains_key(k))
    }

    pub fn multiplier(&self, kind: &BetKind) -> Option<u32> {
        self.multipliers.get(kind).copied()
    }

    pub fn kinds(&self) -> impl Iterator<Item = &BetKind> {
        self.multipliers.keys()
    }

    /// `amount × multiplier(kind)`, checked
    pub fn payout(&self, kind: &BetKind, amount: u64) -> Result<u64, InvariantViolation> {
        let multiplier = self
            .multiplier(kind)
            .ok_or_else(|| InvariantViolation::UnknownBetKind(kind.to_string()))?;
        amount
            .checked_mul(u64::from(multiplier))
            .ok_or_else(|| InvariantViolation::PayoutOverflow(format!("{} x {}", amount, multiplier)))
    }

    /// Expected return per unit staked on `kind`, as (numerator, denominator)
    pub fn expected_return(&self, kind: &BetKind) -> Option<(u64, u64)> {
        let multiplier = u64::from(self.multiplier(kind)?);
        let covered = self.sectors.iter().filter(|s| &s.kind == kind).count() as u64;
        Some((covered * multiplier, self.sectors.len() as u64))
    }
}

/// Draws exactly one uniformly random sector per call
pub struct OutcomeGenerator {
    table: Arc<SectorTable>,
    rng: Box<dyn RandomSource>,
}

impl OutcomeGenerator {
    pub fn new(table: Arc<SectorTable>, rng: Box<dyn RandomSource>) -> Self {
        Self { table, rng }
    }

    pub fn draw(&mut self) -> Outcome {
        // The table is validated non-empty
        let index = self.rng.uniform(self.table.len()) % self.table.len();
        let sector = &self.table.sectors[index];
        Outcome {
            sector: sector.number,
            kind: sector.kind.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::random::{ScriptedRandom, SeededRandom};

    fn table() -> Arc<SectorTable> {
        Arc::new(SectorTable::from_config(&GameConfig::default()).unwrap())
    }

    #[test]
    fn test_resolves_known_kinds_only() {
        let t = table();
        assert_eq!(t.resolve_kind("RED").unwrap().as_str(), "red");
        assert!(t.resolve_kind("blue").is_none());
        assert!(t.resolve_kind("").is_none());
    }

    #[test]
    fn test_payout_and_overflow() {
        let t = table();
        let green = t.resolve_kind("green").unwrap();
        assert_eq!(t.payout(&green, 30), Ok(420));
        assert!(matches!(
            t.payout(&green, u64::MAX),
            Err(InvariantViolation::PayoutOverflow(_))
        ));
    }

    #[test]
    fn test_house_edge_holds_for_defaults() {
        let t = table();
        for kind in t.kinds() {
            let (num, den) = t.expected_return(kind).unwrap();
            assert!(num <= den, "{} returns {}/{}", kind, num, den);
        }
    }

    #[test]
    fn test_scripted_draw_maps_to_sector() {
        let mut generator = OutcomeGenerator::new(table(), Box::new(ScriptedRandom::new(vec![0, 1, 2])));
        assert_eq!(generator.draw().kind.as_str(), "green");
        assert_eq!(generator.draw().kind.as_str(), "red");
        assert_eq!(generator.draw().kind.as_str(), "black");
    }

    #[test]
    fn test_draw_is_roughly_uniform() {
        let t = table();
        let mut generator = OutcomeGenerator::new(t.clone(), Box::new(SeededRandom::new(7)));
        let mut counts = vec![0u32; t.len()];
        for _ in 0..15_000 {
            counts[generator.draw().sector as usize] += 1;
        }
        // each sector expects 1000 hits
        assert!(counts.iter().all(|c| (800..1200).contains(c)), "{:?}", counts);
    }
}
