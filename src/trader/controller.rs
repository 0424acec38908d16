//! Per-instrument position controller.
//!
//! One `tick()` re-derives the position from the exchange, then walks the
//! decision ladder in strict priority order: pause, stop-loss, trailing
//! stop, take-profit, strategy. The first branch that acts ends the cycle;
//! a take-profit sell that does not fill is cancelled and the cycle goes on
//! to the strategy. Every order is followed by a fresh reconciliation.
//!
//! The take-profit cursor is persisted per instrument, so a restart resumes
//! the ladder where it left off.

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::executor::{
    buy_limit_price, buy_quantity, open_order_carry, sell_limit_price, take_profit_quantity,
};
use crate::config::InstrumentConfig;
use crate::domain::{
    last_filled, AssetBalance, Candle, Instrument, Order, OrderRequest, OrderSide, PositionState, Signal,
    TickAction, TickOutcome, TickReason,
};
use crate::error::{Result, RoboError};
use crate::exchange::ExchangeGateway;
use crate::persistence::{
    delete_document, load_document, save_document, StateStore, TakeProfitState, TrailingStopState,
};
use crate::risk::{StopLoss, TakeProfitLadder, TrailingDecision, TrailingStop};
use crate::strategy::{StrategyEngine, StrategyView};

pub struct PositionController {
    gateway: Arc<dyn ExchangeGateway>,
    store: Arc<dyn StateStore>,
    engine: StrategyEngine,
    config: InstrumentConfig,
    instrument: Instrument,
    symbol: String,
    stop_loss: StopLoss,
    trailing: TrailingStop,
    ladder: TakeProfitLadder,
    position: PositionState,
    candles: Vec<Candle>,
    open_orders: Vec<Order>,
    paused: bool,
}

impl PositionController {
    /// Fetch the instrument rules and build the risk layer and strategy engine.
    ///
    /// Fails on unknown instruments and on an invalid take-profit ladder.
    pub async fn connect(
        gateway: Arc<dyn ExchangeGateway>,
        store: Arc<dyn StateStore>,
        config: InstrumentConfig,
    ) -> Result<Self> {
        let engine = StrategyEngine::from_config(&config.strategy, store.clone());
        Self::connect_with_engine(gateway, store, config, engine).await
    }

    /// Like [`connect`](Self::connect) with an already assembled strategy engine
    pub async fn connect_with_engine(
        gateway: Arc<dyn ExchangeGateway>,
        store: Arc<dyn StateStore>,
        config: InstrumentConfig,
        engine: StrategyEngine,
    ) -> Result<Self> {
        let symbol = config.symbol();
        let rules = gateway.get_instrument_rules(&symbol).await?;
        let instrument = Instrument::new(&config.base, &config.quote, rules);

        let risk = &config.risk;
        let mut ladder = TakeProfitLadder::new(&risk.take_profit_at_pct, &risk.take_profit_amount_pct)?;
        let saved: TakeProfitState = load_document(store.as_ref(), &symbol).await;
        ladder.resume_at(saved.next_index);
        let stop_loss = StopLoss::new(risk.stop_loss_pct, risk.stop_loss_confirm_candles);
        let trailing = TrailingStop::new(risk.trailing_stop_pct, rules.price_tick);

        info!(
            instrument = %symbol,
            venue = gateway.name(),
            dry_run = gateway.is_dry_run(),
            strategy = engine.primary_name(),
            fallback = engine.fallback_name().unwrap_or("none"),
            take_profit_index = ladder.next_index(),
            price_tick = %rules.price_tick,
            qty_step = %rules.qty_step,
            "position controller ready"
        );

        Ok(Self {
            gateway,
            store,
            engine,
            config,
            instrument,
            symbol,
            stop_loss,
            trailing,
            ladder,
            position: PositionState::default(),
            candles: Vec::new(),
            open_orders: Vec::new(),
            paused: false,
        })
    }

    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Position as of the last reconciliation
    pub fn position(&self) -> &PositionState {
        &self.position
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Leave the paused state entered after a configured trigger
    pub fn resume(&mut self) {
        if self.paused {
            info!(instrument = %self.symbol, "trading resumed");
        }
        self.paused = false;
    }

    /// Index of the next take-profit rung
    pub fn take_profit_index(&self) -> usize {
        self.ladder.next_index()
    }

    pub fn engine(&self) -> &StrategyEngine {
        &self.engine
    }

    fn cycle_sleep(&self) -> Duration {
        Duration::from_secs(self.config.execution.cycle_interval_secs)
    }

    fn order_sleep(&self) -> Duration {
        Duration::from_secs(self.config.execution.post_order_delay_secs)
    }

    fn traded(&self, action: TickAction, reason: TickReason) -> TickOutcome {
        TickOutcome {
            action,
            reason,
            sleep: self.order_sleep(),
        }
    }

    fn last_close(&self) -> Result<Decimal> {
        self.candles
            .last()
            .map(|c| c.close)
            .ok_or_else(|| RoboError::InsufficientData(format!("{}: no candles", self.symbol)))
    }

    // ========================================================================
    // Cycle
    // ========================================================================

    /// Run one cycle. Never fails: errors are logged and the cycle holds.
    pub async fn tick(&mut self) -> TickOutcome {
        match self.run_cycle().await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    instrument = %self.symbol,
                    error = %e,
                    transient = e.is_transient(),
                    "cycle failed, holding until next cycle"
                );
                TickOutcome::hold(TickReason::Error, self.cycle_sleep())
            }
        }
    }

    async fn run_cycle(&mut self) -> Result<TickOutcome> {
        if self.paused {
            debug!(instrument = %self.symbol, "paused, skipping cycle");
            return Ok(TickOutcome::hold(TickReason::Paused, self.cycle_sleep()));
        }

        self.reconcile().await?;

        if let Some(outcome) = self.check_stop_loss().await? {
            return Ok(outcome);
        }
        if let Some(outcome) = self.check_trailing_stop().await? {
            return Ok(outcome);
        }
        if let Some(outcome) = self.check_take_profit().await? {
            return Ok(outcome);
        }
        self.follow_strategy().await
    }

    /// Rebuild the position from exchange truth.
    async fn reconcile(&mut self) -> Result<()> {
        let candles = self
            .gateway
            .get_candles(&self.instrument, self.config.interval, self.config.candle_limit)
            .await?;
        if candles.is_empty() {
            return Err(RoboError::InsufficientData(format!("{}: exchange returned no candles", self.symbol)));
        }
        let balances = self.gateway.get_balances().await?;
        let open_orders = self.gateway.get_open_orders(&self.instrument).await?;
        let history = self
            .gateway
            .get_order_history(&self.instrument, self.config.execution.order_history_limit)
            .await?;

        let balance = balances
            .get(&self.instrument.base)
            .map(AssetBalance::total)
            .unwrap_or_default();
        let last_buy = last_filled(&history, OrderSide::Buy);
        let last_sell = last_filled(&history, OrderSide::Sell);

        self.position = PositionState {
            is_long: PositionState::derive_is_long(balance, self.instrument.rules.qty_step),
            account_balance: balance,
            last_buy_price: last_buy.and_then(Order::avg_fill_price).unwrap_or_default(),
            last_sell_price: last_sell.and_then(Order::avg_fill_price).unwrap_or_default(),
            last_buy_time: last_buy.map(|o| o.updated_at),
            partial_fill_carry: Decimal::ZERO,
        };
        self.candles = candles;
        self.open_orders = open_orders;

        if !self.position.is_long {
            if self.ladder.next_index() > 0 {
                debug!(instrument = %self.symbol, "position flat, take-profit ladder reset");
            }
            self.reset_take_profit().await?;
            delete_document::<TrailingStopState>(self.store.as_ref(), &self.symbol).await?;
        }

        let close = self.last_close()?;
        debug!(
            instrument = %self.symbol,
            is_long = self.position.is_long,
            balance = %self.position.account_balance,
            last_buy_price = %self.position.last_buy_price,
            last_sell_price = %self.position.last_sell_price,
            close = %close,
            open_orders = self.open_orders.len(),
            "position reconciled"
        );
        Ok(())
    }

    // ========================================================================
    // Risk branches
    // ========================================================================

    async fn check_stop_loss(&mut self) -> Result<Option<TickOutcome>> {
        let last_buy = self.position.last_buy_price;
        if !self.position.is_long || !self.stop_loss.is_triggered(&self.candles, last_buy) {
            return Ok(None);
        }
        let close = self.last_close()?;
        warn!(
            instrument = %self.symbol,
            trigger = "stop_loss",
            close = %close,
            last_buy_price = %last_buy,
            threshold = %self.stop_loss.threshold(last_buy),
            "stop-loss triggered, liquidating at market"
        );
        let pause = self.config.risk.pause_after_stop_loss;
        self.force_exit(TickReason::StopLoss, pause).await.map(Some)
    }

    async fn check_trailing_stop(&mut self) -> Result<Option<TickOutcome>> {
        if !self.config.risk.trailing_stop_enabled || !self.position.is_long {
            return Ok(None);
        }
        let close = self.last_close()?;
        let mut state: TrailingStopState = load_document(self.store.as_ref(), &self.symbol).await;
        let previous_stop = state.trailing_stop_price;
        let decision = self.trailing.evaluate(
            &mut state,
            &self.candles,
            self.position.last_buy_price,
            self.position.last_buy_time,
        );

        match decision {
            TrailingDecision::Armed | TrailingDecision::Raised => {
                save_document(self.store.as_ref(), &self.symbol, &state).await?;
                info!(
                    instrument = %self.symbol,
                    trigger = "trailing_stop",
                    armed = decision == TrailingDecision::Armed,
                    max_price = %state.max_price_since_buy,
                    stop = %state.trailing_stop_price,
                    "trailing stop updated"
                );
                Ok(None)
            }
            TrailingDecision::Holding => {
                debug!(
                    instrument = %self.symbol,
                    stop = %state.trailing_stop_price,
                    close = %close,
                    "trailing stop holding"
                );
                Ok(None)
            }
            TrailingDecision::Triggered => {
                warn!(
                    instrument = %self.symbol,
                    trigger = "trailing_stop",
                    close = %close,
                    stop = %previous_stop,
                    "trailing stop hit, liquidating at market"
                );
                let pause = self.config.risk.pause_after_trailing_stop;
                self.force_exit(TickReason::TrailingStop, pause).await.map(Some)
            }
        }
    }

    async fn check_take_profit(&mut self) -> Result<Option<TickOutcome>> {
        if !self.position.is_long {
            return Ok(None);
        }
        let Some(gain) = self.position.gain_pct(self.last_close()?) else {
            return Ok(None);
        };
        let Some(rung) = self.ladder.next_rung(gain) else {
            return Ok(None);
        };
        let index = self.ladder.next_index();
        let qty = take_profit_quantity(&self.instrument.rules, self.position.account_balance, rung.sell_pct);
        if qty <= Decimal::ZERO {
            warn!(
                instrument = %self.symbol,
                trigger = "take_profit",
                rung = index,
                "take-profit quantity rounds to zero, skipping"
            );
            return Ok(None);
        }

        info!(
            instrument = %self.symbol,
            trigger = "take_profit",
            rung = index,
            gain_pct = %gain.round_dp(2),
            trigger_pct = %rung.trigger_pct,
            sell_pct = %rung.sell_pct,
            qty = %qty,
            "take-profit rung reached"
        );
        let request = OrderRequest::market(&self.instrument, OrderSide::Sell, qty);
        let order = self.place(request, TickReason::TakeProfit).await?;
        if !order.is_filled() {
            warn!(
                instrument = %self.symbol,
                trigger = "take_profit",
                rung = index,
                order_id = %order.id,
                status = ?order.status,
                "take-profit order not filled, rung stays armed for the next cycle"
            );
            if order.status.is_open() {
                self.gateway.cancel_order(&self.instrument, &order.id).await?;
            }
            self.after_order(OrderSide::Sell).await?;
            return Ok(None);
        }

        self.ladder.advance();
        save_document(
            self.store.as_ref(),
            &self.symbol,
            &TakeProfitState {
                next_index: self.ladder.next_index(),
            },
        )
        .await?;
        if self.config.risk.pause_after_take_profit {
            self.pause("take_profit");
        }
        self.after_order(OrderSide::Sell).await?;
        Ok(Some(self.traded(TickAction::Sell, TickReason::TakeProfit)))
    }

    /// Cancel everything, sell the whole holding at market and clear the
    /// trailing and strategy state for the closed position.
    async fn force_exit(&mut self, reason: TickReason, pause: bool) -> Result<TickOutcome> {
        self.cancel_open_orders().await?;

        let qty = self.instrument.rules.quantize_qty(self.position.account_balance);
        let request = OrderRequest::market(&self.instrument, OrderSide::Sell, qty);
        self.place(request, reason).await?;

        delete_document::<TrailingStopState>(self.store.as_ref(), &self.symbol).await?;
        self.engine.record_exit(&self.symbol).await?;
        self.reset_take_profit().await?;

        if pause {
            self.pause(match reason {
                TickReason::StopLoss => "stop_loss",
                _ => "trailing_stop",
            });
        }
        self.after_order(OrderSide::Sell).await?;
        Ok(self.traded(TickAction::Sell, reason))
    }

    async fn reset_take_profit(&mut self) -> Result<()> {
        self.ladder.reset();
        delete_document::<TakeProfitState>(self.store.as_ref(), &self.symbol).await
    }

    fn pause(&mut self, trigger: &str) {
        self.paused = true;
        warn!(instrument = %self.symbol, trigger, "trading paused until resumed");
    }

    // ========================================================================
    // Strategy branch
    // ========================================================================

    async fn follow_strategy(&mut self) -> Result<TickOutcome> {
        let view = StrategyView {
            key: &self.symbol,
            is_long: self.position.is_long,
            last_buy_price: self.position.last_buy_price,
            verbose: false,
        };
        let signal = self.engine.evaluate(&self.candles, view).await?;

        let side = match signal {
            Signal::Buy => Some(OrderSide::Buy),
            Signal::Sell => Some(OrderSide::Sell),
            Signal::Hold => None,
        };
        // Buy/Sell cancels every resting order: opposite-side ones disagree
        // with the signal, same-side ones are re-sized from their carry.
        if let Some(side) = side.filter(|_| !self.open_orders.is_empty()) {
            let carry = open_order_carry(&self.open_orders, side);
            if let Some(carry) = carry {
                self.position.partial_fill_carry = carry.executed;
                if side == OrderSide::Buy {
                    self.position.last_buy_price = carry.best_partial_price.unwrap_or_default();
                }
            }
            info!(
                instrument = %self.symbol,
                %side,
                open_orders = self.open_orders.len(),
                carry = %self.position.partial_fill_carry,
                "cancelling open orders before acting on signal"
            );
            self.cancel_open_orders().await?;
        }

        match (self.position.is_long, signal) {
            (false, Signal::Buy) => self.enter().await,
            (true, Signal::Sell) => self.exit().await,
            _ => {
                debug!(
                    instrument = %self.symbol,
                    %signal,
                    is_long = self.position.is_long,
                    "no position change"
                );
                Ok(TickOutcome::hold(TickReason::NoChange, self.cycle_sleep()))
            }
        }
    }

    async fn enter(&mut self) -> Result<TickOutcome> {
        let rules = self.instrument.rules;
        let qty = buy_quantity(&rules, self.config.traded_quantity, self.position.partial_fill_carry);
        if qty <= Decimal::ZERO {
            warn!(
                instrument = %self.symbol,
                carry = %self.position.partial_fill_carry,
                "buy quantity rounds to zero after partial fills, holding"
            );
            return Ok(TickOutcome::hold(TickReason::NoChange, self.cycle_sleep()));
        }

        let request = if self.config.execution.market_orders {
            OrderRequest::market(&self.instrument, OrderSide::Buy, qty)
        } else {
            let price = buy_limit_price(&self.candles, &rules)
                .ok_or_else(|| RoboError::InsufficientData(format!("{}: no candles to price", self.symbol)))?;
            OrderRequest::limit(&self.instrument, OrderSide::Buy, qty, price)
        };
        self.place(request, TickReason::Strategy).await?;
        self.after_order(OrderSide::Buy).await?;
        Ok(self.traded(TickAction::Buy, TickReason::Strategy))
    }

    async fn exit(&mut self) -> Result<TickOutcome> {
        let rules = self.instrument.rules;
        let qty = rules.quantize_qty(self.position.account_balance);

        let request = if self.config.execution.market_orders {
            OrderRequest::market(&self.instrument, OrderSide::Sell, qty)
        } else {
            let price = sell_limit_price(
                &self.candles,
                &rules,
                self.position.last_buy_price,
                self.config.risk.acceptable_loss_pct,
            )
            .ok_or_else(|| RoboError::InsufficientData(format!("{}: no candles to price", self.symbol)))?;
            OrderRequest::limit(&self.instrument, OrderSide::Sell, qty, price)
        };
        self.place(request, TickReason::Strategy).await?;
        self.after_order(OrderSide::Sell).await?;
        Ok(self.traded(TickAction::Sell, TickReason::Strategy))
    }

    // ========================================================================
    // Order plumbing
    // ========================================================================

    async fn place(&self, request: OrderRequest, reason: TickReason) -> Result<Order> {
        let order = self.gateway.place_order(&request).await?;
        info!(
            instrument = %self.symbol,
            reason = ?reason,
            order_id = %order.id,
            side = %order.side,
            kind = %order.kind,
            qty = %order.requested_qty,
            price = ?order.price,
            executed = %order.executed_qty,
            status = ?order.status,
            "order placed"
        );
        Ok(order)
    }

    async fn cancel_open_orders(&mut self) -> Result<()> {
        if self.open_orders.is_empty() {
            return Ok(());
        }
        for order in std::mem::take(&mut self.open_orders) {
            self.gateway.cancel_order(&self.instrument, &order.id).await?;
            info!(
                instrument = %self.symbol,
                order_id = %order.id,
                side = %order.side,
                executed = %order.executed_qty,
                "open order cancelled"
            );
        }
        self.settle().await;
        Ok(())
    }

    async fn settle(&self) {
        let delay = self.config.execution.settle_delay_ms;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    /// Re-derive the position after an order; a fresh entry arms the
    /// trailing stop right away.
    async fn after_order(&mut self, side: OrderSide) -> Result<()> {
        self.settle().await;
        self.reconcile().await?;

        if side == OrderSide::Buy && self.position.is_long && self.config.risk.trailing_stop_enabled {
            let mut state: TrailingStopState = load_document(self.store.as_ref(), &self.symbol).await;
            let decision = self.trailing.evaluate(
                &mut state,
                &self.candles,
                self.position.last_buy_price,
                self.position.last_buy_time,
            );
            if decision.is_dirty() {
                save_document(self.store.as_ref(), &self.symbol, &state).await?;
                info!(
                    instrument = %self.symbol,
                    trigger = "trailing_stop",
                    max_price = %state.max_price_since_buy,
                    stop = %state.trailing_stop_price,
                    "trailing stop armed after entry"
                );
            }
        }
        Ok(())
    }
}
