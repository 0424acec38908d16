use super::chilo_rsi::ChiloRsi;
use super::ema_micro::EmaMicro;
use super::fixed::Fixed;
use super::hilo::HiLo;
use super::traits::Strategy;
use crate::config::StrategySpec;

/// Instantiate the strategy described by a config entry
pub fn build_strategy(spec: &StrategySpec) -> Box<dyn Strategy> {
    match spec {
        StrategySpec::ChiloRsi(params) => Box::new(ChiloRsi::new(params.clone())),
        StrategySpec::Hilo(params) => Box::new(HiLo::new(params.clone())),
        StrategySpec::EmaMicro(params) => Box::new(EmaMicro::new(params.clone())),
        StrategySpec::Fixed(params) => Box::new(Fixed::new(params.clone())),
    }
}
