//! End-to-end cycles of the position controller against the paper venue.

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::{Arc, Mutex};

use robo::config::InstrumentConfig;
use robo::domain::{
    Candle, Instrument, InstrumentRules, OrderKind, OrderSide, Signal, TickAction, TickReason,
};
use robo::error::Result;
use robo::exchange::{ExchangeGateway, FillMode, PaperExchange};
use robo::persistence::{
    load_document, Document, MemoryStateStore, StateStore, TakeProfitState, TrailingStopState,
};
use robo::strategy::{Strategy, StrategyContext, StrategyEngine, StrategyOutput};
use robo::trader::PositionController;

const SYMBOL: &str = "SOLUSDT";

// ============================================================================
// Fixtures
// ============================================================================

/// Strategy whose decision the test flips between cycles
#[derive(Clone)]
struct Switch(Arc<Mutex<Signal>>);

impl Switch {
    fn new(signal: Signal) -> Self {
        Self(Arc::new(Mutex::new(signal)))
    }

    fn set(&self, signal: Signal) {
        *self.0.lock().unwrap() = signal;
    }
}

impl Strategy for Switch {
    fn name(&self) -> &str {
        "switch"
    }

    fn evaluate(&self, _series: &[Candle], _ctx: &StrategyContext<'_>) -> Result<StrategyOutput> {
        Ok(StrategyOutput::signal(*self.0.lock().unwrap()))
    }
}

fn t(i: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(5 * i)
}

fn candle(i: i64, close: Decimal) -> Candle {
    Candle {
        open_time: t(i),
        open: close,
        high: close,
        low: close,
        close,
        volume: dec!(10),
    }
}

fn rules(qty_step: Decimal) -> InstrumentRules {
    InstrumentRules {
        price_tick: dec!(0.01),
        qty_step,
    }
}

fn flat_history() -> Vec<Candle> {
    (0..5).map(|i| candle(i, dec!(100))).collect()
}

fn base_config() -> InstrumentConfig {
    let mut config = InstrumentConfig::new("SOL", "USDT", dec!(1));
    config.execution.settle_delay_ms = 0;
    config.risk.trailing_stop_enabled = false;
    config
}

struct Harness {
    venue: Arc<PaperExchange>,
    store: Arc<dyn StateStore>,
    switch: Switch,
    controller: PositionController,
    next: i64,
}

impl Harness {
    async fn new(config: InstrumentConfig, qty_step: Decimal) -> Self {
        let venue = Arc::new(
            PaperExchange::new()
                .with_balance("USDT", dec!(10000))
                .with_market(Instrument::new("SOL", "USDT", rules(qty_step)), flat_history()),
        );
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let switch = Switch::new(Signal::Hold);
        let controller = connect(&venue, &store, &switch, config).await;
        Self {
            venue,
            store,
            switch,
            controller,
            next: 5,
        }
    }

    async fn push(&mut self, close: Decimal) {
        self.venue.push_candle(SYMBOL, candle(self.next, close)).await.unwrap();
        self.next += 1;
    }

    /// Buy one unit at 100 and leave the strategy on Hold
    async fn enter_at_100(&mut self) {
        self.switch.set(Signal::Buy);
        let outcome = self.controller.tick().await;
        assert_eq!(outcome.action, TickAction::Buy);
        self.switch.set(Signal::Hold);
    }

    async fn trailing_state(&self) -> TrailingStopState {
        load_document(self.store.as_ref(), SYMBOL).await
    }
}

async fn connect(
    venue: &Arc<PaperExchange>,
    store: &Arc<dyn StateStore>,
    switch: &Switch,
    config: InstrumentConfig,
) -> PositionController {
    let gateway: Arc<dyn ExchangeGateway> = venue.clone();
    let engine = StrategyEngine::new(Box::new(switch.clone()), None, store.clone());
    PositionController::connect_with_engine(gateway, store.clone(), config, engine)
        .await
        .unwrap()
}

fn with_trailing(mut config: InstrumentConfig) -> InstrumentConfig {
    config.risk.trailing_stop_enabled = true;
    config.risk.trailing_stop_pct = dec!(2);
    config
}

// ============================================================================
// Entries
// ============================================================================

#[tokio::test]
async fn buy_signal_enters_and_arms_trailing_stop() {
    let mut h = Harness::new(with_trailing(base_config()), dec!(0.001)).await;
    h.switch.set(Signal::Buy);

    let outcome = h.controller.tick().await;
    assert_eq!(outcome.action, TickAction::Buy);
    assert_eq!(outcome.reason, TickReason::Strategy);
    assert_eq!(outcome.sleep, std::time::Duration::from_secs(60));

    let placed = h.venue.placed_orders().await;
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].kind, OrderKind::Market);
    assert_eq!(placed[0].quantity, dec!(1));

    assert!(h.controller.position().is_long);
    assert_eq!(h.controller.position().last_buy_price, dec!(100));

    let trailing = h.trailing_state().await;
    assert!(trailing.is_armed);
    assert_eq!(trailing.max_price_since_buy, dec!(100));
    assert_eq!(trailing.trailing_stop_price, dec!(98));
}

#[tokio::test]
async fn hold_signal_while_flat_places_nothing() {
    let mut h = Harness::new(base_config(), dec!(0.001)).await;
    let outcome = h.controller.tick().await;
    assert_eq!(outcome.action, TickAction::Hold);
    assert_eq!(outcome.reason, TickReason::NoChange);
    assert_eq!(outcome.sleep, std::time::Duration::from_secs(30));
    assert!(h.venue.placed_orders().await.is_empty());
}

#[tokio::test]
async fn partial_fills_are_carried_into_the_next_buy() {
    let mut h = Harness::new(base_config(), dec!(0.1)).await;
    h.venue
        .seed_open_order(SYMBOL, OrderSide::Buy, dec!(1), dec!(0.05), dec!(99))
        .await
        .unwrap();

    h.switch.set(Signal::Buy);
    let outcome = h.controller.tick().await;
    assert_eq!(outcome.action, TickAction::Buy);

    let placed = h.venue.placed_orders().await;
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].quantity, dec!(0.9));
    assert!(h.venue.get_open_orders(h.controller.instrument()).await.unwrap().is_empty());
}

#[tokio::test]
async fn limit_entry_is_priced_off_the_close() {
    let mut config = base_config();
    config.execution.market_orders = false;
    let mut h = Harness::new(config, dec!(0.001)).await;
    h.switch.set(Signal::Buy);

    let outcome = h.controller.tick().await;
    assert_eq!(outcome.action, TickAction::Buy);
    let placed = h.venue.placed_orders().await;
    assert_eq!(placed[0].kind, OrderKind::Limit);
    // flat closes: RSI undefined, volume not below average
    assert_eq!(placed[0].price, Some(dec!(100.5)));
    // resting limit order: nothing bought yet
    assert!(!h.controller.position().is_long);
}

// ============================================================================
// Risk layer
// ============================================================================

#[tokio::test]
async fn trailing_stop_follows_peak_and_triggers_below_it() {
    let mut h = Harness::new(with_trailing(base_config()), dec!(0.001)).await;
    h.enter_at_100().await;

    h.push(dec!(110)).await;
    let outcome = h.controller.tick().await;
    assert_eq!(outcome.reason, TickReason::NoChange);
    assert_eq!(h.trailing_state().await.trailing_stop_price, dec!(107.8));

    h.push(dec!(107.81)).await;
    let outcome = h.controller.tick().await;
    assert_eq!(outcome.action, TickAction::Hold);
    assert_eq!(h.trailing_state().await.max_price_since_buy, dec!(110));

    h.push(dec!(107.79)).await;
    let outcome = h.controller.tick().await;
    assert_eq!(outcome.action, TickAction::Sell);
    assert_eq!(outcome.reason, TickReason::TrailingStop);

    let placed = h.venue.placed_orders().await;
    assert_eq!(
        placed.last().map(|o| (o.side, o.kind, o.quantity)),
        Some((OrderSide::Sell, OrderKind::Market, dec!(1)))
    );
    assert!(!h.controller.position().is_long);
    assert!(h.store.get(TrailingStopState::COLLECTION, SYMBOL).await.unwrap().is_none());
}

#[tokio::test]
async fn stop_loss_needs_two_closes_below_threshold() {
    let mut h = Harness::new(base_config(), dec!(0.001)).await;
    h.enter_at_100().await;

    // threshold 96.5
    for close in [dec!(96), dec!(97), dec!(96)] {
        h.push(close).await;
        let outcome = h.controller.tick().await;
        assert_eq!(outcome.action, TickAction::Hold, "close {close}");
    }

    h.push(dec!(96)).await;
    let outcome = h.controller.tick().await;
    assert_eq!(outcome.action, TickAction::Sell);
    assert_eq!(outcome.reason, TickReason::StopLoss);
    assert!(!h.controller.position().is_long);
}

// Stop-loss wants a loss and take-profit a gain over the same buy price, so
// the two never compete; the overlap that matters is with the trailing stop.
#[tokio::test]
async fn stop_loss_takes_priority_over_trailing_stop() {
    let mut h = Harness::new(with_trailing(base_config()), dec!(0.001)).await;
    h.enter_at_100().await;

    // both closes are under the stop-loss threshold and the trailing stop
    h.push(dec!(96)).await;
    h.push(dec!(96)).await;
    let outcome = h.controller.tick().await;
    assert_eq!(outcome.reason, TickReason::StopLoss);
    assert_eq!(h.venue.placed_orders().await.len(), 2);
}

#[tokio::test]
async fn take_profit_ladder_sells_each_rung_once() {
    let mut config = base_config();
    config.risk.take_profit_at_pct = vec![dec!(5), dec!(10)];
    config.risk.take_profit_amount_pct = vec![dec!(50), dec!(50)];
    let mut h = Harness::new(config, dec!(0.001)).await;
    h.enter_at_100().await;

    h.push(dec!(105)).await;
    let outcome = h.controller.tick().await;
    assert_eq!((outcome.action, outcome.reason), (TickAction::Sell, TickReason::TakeProfit));
    assert_eq!(h.controller.take_profit_index(), 1);
    assert_eq!(h.controller.position().account_balance, dec!(0.5));

    for close in [dec!(102), dec!(106)] {
        h.push(close).await;
        let outcome = h.controller.tick().await;
        assert_eq!(outcome.action, TickAction::Hold, "close {close}");
        assert_eq!(h.controller.take_profit_index(), 1);
    }

    h.push(dec!(110)).await;
    let outcome = h.controller.tick().await;
    assert_eq!(outcome.reason, TickReason::TakeProfit);
    assert_eq!(h.controller.take_profit_index(), 2);
    assert_eq!(h.controller.position().account_balance, dec!(0.25));

    // ladder exhausted: strategy closes the rest, cursor resets on flat
    h.push(dec!(108)).await;
    h.switch.set(Signal::Sell);
    let outcome = h.controller.tick().await;
    assert_eq!((outcome.action, outcome.reason), (TickAction::Sell, TickReason::Strategy));
    assert!(!h.controller.position().is_long);
    assert_eq!(h.controller.take_profit_index(), 0);
    assert!(h.store.get(TakeProfitState::COLLECTION, SYMBOL).await.unwrap().is_none());
}

#[tokio::test]
async fn unfilled_take_profit_is_retried_without_pausing() {
    let mut config = base_config();
    config.risk.take_profit_at_pct = vec![dec!(5)];
    config.risk.take_profit_amount_pct = vec![dec!(50)];
    config.risk.pause_after_take_profit = true;
    let mut h = Harness::new(config, dec!(0.001)).await;
    h.enter_at_100().await;

    // sell does not fill: cancelled, cycle continues to the strategy
    h.venue.set_fill_mode(FillMode::Resting).await;
    h.push(dec!(105)).await;
    let outcome = h.controller.tick().await;
    assert_eq!((outcome.action, outcome.reason), (TickAction::Hold, TickReason::NoChange));
    assert_eq!(h.controller.take_profit_index(), 0);
    assert!(!h.controller.is_paused());
    assert_eq!(h.controller.position().account_balance, dec!(1));
    assert!(h.venue.get_open_orders(h.controller.instrument()).await.unwrap().is_empty());

    h.venue.set_fill_mode(FillMode::Immediate).await;
    h.push(dec!(105)).await;
    let outcome = h.controller.tick().await;
    assert_eq!((outcome.action, outcome.reason), (TickAction::Sell, TickReason::TakeProfit));
    assert_eq!(h.controller.take_profit_index(), 1);
    assert_eq!(h.controller.position().account_balance, dec!(0.5));
    assert!(h.controller.is_paused());
}

#[tokio::test]
async fn signal_cancels_stale_orders_on_the_other_side() {
    let mut h = Harness::new(base_config(), dec!(0.001)).await;
    h.enter_at_100().await;
    h.venue
        .seed_open_order(SYMBOL, OrderSide::Sell, dec!(1), dec!(0), dec!(120))
        .await
        .unwrap();
    let placed = h.venue.placed_orders().await.len();

    h.switch.set(Signal::Buy);
    let outcome = h.controller.tick().await;
    assert_eq!((outcome.action, outcome.reason), (TickAction::Hold, TickReason::NoChange));
    assert!(h.venue.get_open_orders(h.controller.instrument()).await.unwrap().is_empty());
    assert_eq!(h.venue.placed_orders().await.len(), placed);
    assert!(h.controller.position().is_long);
    assert_eq!(h.controller.position().account_balance, dec!(1));
}

#[tokio::test]
async fn hold_signal_leaves_open_orders_alone() {
    let mut h = Harness::new(base_config(), dec!(0.001)).await;
    h.enter_at_100().await;
    h.venue
        .seed_open_order(SYMBOL, OrderSide::Sell, dec!(1), dec!(0), dec!(120))
        .await
        .unwrap();

    let outcome = h.controller.tick().await;
    assert_eq!(outcome.reason, TickReason::NoChange);
    assert_eq!(h.venue.get_open_orders(h.controller.instrument()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn pause_after_stop_loss_skips_cycles_until_resumed() {
    let mut config = base_config();
    config.risk.pause_after_stop_loss = true;
    let mut h = Harness::new(config, dec!(0.001)).await;
    h.enter_at_100().await;

    h.push(dec!(90)).await;
    h.push(dec!(90)).await;
    let outcome = h.controller.tick().await;
    assert_eq!(outcome.reason, TickReason::StopLoss);
    assert!(h.controller.is_paused());

    h.switch.set(Signal::Buy);
    let placed = h.venue.placed_orders().await.len();
    let outcome = h.controller.tick().await;
    assert_eq!(outcome.reason, TickReason::Paused);
    assert_eq!(h.venue.placed_orders().await.len(), placed);

    h.controller.resume();
    let outcome = h.controller.tick().await;
    assert_eq!(outcome.action, TickAction::Buy);
}

// ============================================================================
// Recovery
// ============================================================================

#[tokio::test]
async fn restarted_controller_resumes_persisted_trailing_stop() {
    let mut h = Harness::new(with_trailing(base_config()), dec!(0.001)).await;
    h.enter_at_100().await;
    h.push(dec!(110)).await;
    h.controller.tick().await;

    // new process: same venue and store, fresh controller
    let mut restarted = connect(&h.venue, &h.store, &h.switch, with_trailing(base_config())).await;
    h.push(dec!(107.79)).await;
    let outcome = restarted.tick().await;
    assert_eq!(outcome.reason, TickReason::TrailingStop);
}

#[tokio::test]
async fn restarted_controller_resumes_the_take_profit_ladder() {
    let mut config = base_config();
    config.risk.take_profit_at_pct = vec![dec!(5), dec!(10)];
    config.risk.take_profit_amount_pct = vec![dec!(50), dec!(50)];
    let mut h = Harness::new(config.clone(), dec!(0.001)).await;
    h.enter_at_100().await;

    h.push(dec!(105)).await;
    let outcome = h.controller.tick().await;
    assert_eq!(outcome.reason, TickReason::TakeProfit);
    let saved: TakeProfitState = load_document(h.store.as_ref(), SYMBOL).await;
    assert_eq!(saved.next_index, 1);

    let mut restarted = connect(&h.venue, &h.store, &h.switch, config).await;
    assert_eq!(restarted.take_profit_index(), 1);

    // rung 0 already sold: no second sale at 6%
    h.push(dec!(106)).await;
    let outcome = restarted.tick().await;
    assert_eq!(outcome.action, TickAction::Hold);
    assert_eq!(restarted.position().account_balance, dec!(0.5));

    h.push(dec!(110)).await;
    let outcome = restarted.tick().await;
    assert_eq!(outcome.reason, TickReason::TakeProfit);
    assert_eq!(restarted.take_profit_index(), 2);
    assert_eq!(restarted.position().account_balance, dec!(0.25));
}

#[tokio::test]
async fn exchange_failure_holds_for_one_cycle() {
    let mut h = Harness::new(base_config(), dec!(0.001)).await;
    h.switch.set(Signal::Buy);
    h.venue.fail_next(1).await;

    let outcome = h.controller.tick().await;
    assert_eq!(outcome.action, TickAction::Hold);
    assert_eq!(outcome.reason, TickReason::Error);
    assert_eq!(outcome.sleep, std::time::Duration::from_secs(30));
    assert!(h.venue.placed_orders().await.is_empty());

    let outcome = h.controller.tick().await;
    assert_eq!(outcome.action, TickAction::Buy);
}

// ============================================================================
// Gateway failures
// ============================================================================

mod gateway_failures {
    use super::*;
    use async_trait::async_trait;
    use mockall::mock;
    use robo::domain::{AssetBalance, CandleInterval, Order, OrderRequest};
    use robo::error::RoboError;
    use std::collections::HashMap;

    mock! {
        pub Gateway {}

        #[async_trait]
        impl ExchangeGateway for Gateway {
            fn name(&self) -> &str;
            fn is_dry_run(&self) -> bool;
            async fn get_candles(
                &self,
                instrument: &Instrument,
                interval: CandleInterval,
                limit: usize,
            ) -> Result<Vec<Candle>>;
            async fn get_balances(&self) -> Result<HashMap<String, AssetBalance>>;
            async fn get_open_orders(&self, instrument: &Instrument) -> Result<Vec<Order>>;
            async fn place_order(&self, request: &OrderRequest) -> Result<Order>;
            async fn cancel_order(&self, instrument: &Instrument, order_id: &str) -> Result<()>;
            async fn get_order_history(&self, instrument: &Instrument, limit: usize) -> Result<Vec<Order>>;
            async fn get_instrument_rules(&self, symbol: &str) -> Result<InstrumentRules>;
        }
    }

    fn gateway() -> MockGateway {
        let mut gateway = MockGateway::new();
        gateway.expect_name().return_const("mock".to_string());
        gateway.expect_is_dry_run().return_const(true);
        gateway
            .expect_get_instrument_rules()
            .returning(|_| Ok(rules(dec!(0.001))));
        gateway
    }

    async fn controller(gateway: MockGateway) -> PositionController {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let engine = StrategyEngine::new(Box::new(Switch::new(Signal::Buy)), None, store.clone());
        PositionController::connect_with_engine(Arc::new(gateway), store, base_config(), engine)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn candle_fetch_error_becomes_a_hold() {
        let mut gateway = gateway();
        gateway
            .expect_get_candles()
            .returning(|_, _, _| Err(RoboError::Timeout("klines".to_string())));
        gateway.expect_place_order().never();

        let mut controller = controller(gateway).await;
        let outcome = controller.tick().await;
        assert_eq!(outcome.action, TickAction::Hold);
        assert_eq!(outcome.reason, TickReason::Error);
    }

    #[tokio::test]
    async fn rejected_order_becomes_a_hold() {
        let mut gateway = gateway();
        gateway
            .expect_get_candles()
            .returning(|_, _, _| Ok(flat_history()));
        gateway.expect_get_balances().returning(|| Ok(HashMap::new()));
        gateway.expect_get_open_orders().returning(|_| Ok(Vec::new()));
        gateway.expect_get_order_history().returning(|_, _| Ok(Vec::new()));
        gateway
            .expect_place_order()
            .times(1)
            .returning(|_| Err(RoboError::OrderRejected("insufficient balance".to_string())));

        let mut controller = controller(gateway).await;
        let outcome = controller.tick().await;
        assert_eq!(outcome.reason, TickReason::Error);
        assert!(!controller.position().is_long);
    }

    #[tokio::test]
    async fn unknown_instrument_fails_to_connect() {
        let mut gateway = MockGateway::new();
        gateway
            .expect_get_instrument_rules()
            .returning(|symbol| Err(RoboError::UnknownInstrument(symbol.to_string())));
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let result = PositionController::connect(Arc::new(gateway), store, base_config()).await;
        assert!(matches!(result, Err(RoboError::UnknownInstrument(_))));
    }
}
