use rust_decimal::Decimal;

use crate::error::{Result, RoboError};

/// One ladder rung: sell `sell_pct` of the holding once the gain reaches `trigger_pct`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TakeProfitRung {
    pub trigger_pct: Decimal,
    pub sell_pct: Decimal,
}

/// Sequential partial exits.
///
/// The cursor only moves forward after a confirmed fill and goes back to the
/// first rung only when the position is observed flat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TakeProfitLadder {
    rungs: Vec<TakeProfitRung>,
    next_index: usize,
}

impl TakeProfitLadder {
    /// Build from parallel trigger/amount arrays
    pub fn new(trigger_pct: &[Decimal], sell_pct: &[Decimal]) -> Result<Self> {
        if trigger_pct.len() != sell_pct.len() {
            return Err(RoboError::InvalidConfig(format!(
                "take-profit ladder has {} triggers but {} amounts",
                trigger_pct.len(),
                sell_pct.len()
            )));
        }
        Ok(Self {
            rungs: trigger_pct
                .iter()
                .zip(sell_pct)
                .map(|(t, s)| TakeProfitRung {
                    trigger_pct: *t,
                    sell_pct: *s,
                })
                .collect(),
            next_index: 0,
        })
    }

    pub fn next_index(&self) -> usize {
        self.next_index
    }

    pub fn len(&self) -> usize {
        self.rungs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rungs.is_empty()
    }

    /// The pending rung, if `gain_pct` reaches it (both compared at 2 decimals)
    pub fn next_rung(&self, gain_pct: Decimal) -> Option<TakeProfitRung> {
        let rung = self.rungs.get(self.next_index)?;
        if rung.trigger_pct > Decimal::ZERO && gain_pct.round_dp(2) >= rung.trigger_pct.round_dp(2) {
            Some(*rung)
        } else {
            None
        }
    }

    /// Move past the pending rung. Call only after its sell filled.
    pub fn advance(&mut self) {
        if self.next_index < self.rungs.len() {
            self.next_index += 1;
        }
    }

    pub fn reset(&mut self) {
        self.next_index = 0;
    }

    /// Continue from a previously recorded cursor, clamped to the ladder
    pub fn resume_at(&mut self, index: usize) {
        self.next_index = index.min(self.rungs.len());
    }
}
