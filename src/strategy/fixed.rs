use serde::{Deserialize, Serialize};
use tracing::debug;

use super::traits::{Strategy, StrategyContext, StrategyOutput};
use crate::domain::{Candle, Signal};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixedParams {
    pub decision: Signal,
}

impl Default for FixedParams {
    fn default() -> Self {
        Self {
            decision: Signal::Hold,
        }
    }
}

/// Development strategy that always returns the configured decision
#[derive(Debug, Clone)]
pub struct Fixed {
    decision: Signal,
}

impl Fixed {
    pub fn new(params: FixedParams) -> Self {
        Self {
            decision: params.decision,
        }
    }
}

impl Strategy for Fixed {
    fn name(&self) -> &str {
        "fixed"
    }

    fn evaluate(&self, _series: &[Candle], ctx: &StrategyContext<'_>) -> Result<StrategyOutput> {
        if ctx.verbose {
            debug!(instrument = ctx.symbol, decision = %self.decision, "fixed strategy");
        }
        Ok(StrategyOutput::signal(self.decision))
    }
}
