//! In-memory paper venue.
//!
//! Replays a fixed candle history per instrument, fills market orders at the
//! latest visible close and rests limit orders until a later candle crosses
//! them. Fill behaviour and transport failures can be scripted, which makes it
//! the venue for dry runs as well as controller tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::ExchangeGateway;
use crate::domain::{
    AssetBalance, Candle, CandleInterval, Instrument, InstrumentRules, Order, OrderKind, OrderRequest,
    OrderSide, OrderStatus,
};
use crate::error::{Result, RoboError};

/// How the paper venue treats incoming market orders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillMode {
    /// Fill the whole quantity at the latest close
    Immediate,
    /// Fill this fraction (0..1) and leave the rest open
    Partial(Decimal),
    /// Accept but never fill
    Resting,
}

struct PaperMarket {
    instrument: Instrument,
    candles: Vec<Candle>,
    /// Number of candles currently visible to callers
    visible: usize,
}

impl PaperMarket {
    fn current(&self) -> Option<&Candle> {
        self.visible.checked_sub(1).and_then(|i| self.candles.get(i))
    }
}

struct PaperState {
    markets: HashMap<String, PaperMarket>,
    balances: HashMap<String, AssetBalance>,
    open_orders: Vec<Order>,
    closed_orders: Vec<Order>,
    placed: Vec<OrderRequest>,
    fill_mode: FillMode,
    auto_advance: bool,
    failures_pending: u32,
    next_id: u64,
}

/// Simulated spot exchange
pub struct PaperExchange {
    state: Mutex<PaperState>,
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperExchange {
    /// Create an empty venue with no markets and no balances
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PaperState {
                markets: HashMap::new(),
                balances: HashMap::new(),
                open_orders: Vec::new(),
                closed_orders: Vec::new(),
                placed: Vec::new(),
                fill_mode: FillMode::Immediate,
                auto_advance: false,
                failures_pending: 0,
                next_id: 1,
            }),
        }
    }

    /// Credit a free balance
    pub fn with_balance(mut self, asset: &str, free: Decimal) -> Self {
        let state = self.state.get_mut();
        state.balances.entry(asset.to_uppercase()).or_default().free += free;
        self
    }

    /// List an instrument with its full candle history visible
    pub fn with_market(mut self, instrument: Instrument, candles: Vec<Candle>) -> Self {
        let state = self.state.get_mut();
        let visible = candles.len();
        state.markets.insert(
            instrument.symbol(),
            PaperMarket {
                instrument,
                candles,
                visible,
            },
        );
        self
    }

    /// Reveal one more candle on every `get_candles` call
    pub fn with_auto_advance(mut self, warmup: usize) -> Self {
        let state = self.state.get_mut();
        state.auto_advance = true;
        for market in state.markets.values_mut() {
            market.visible = warmup.min(market.candles.len());
        }
        self
    }

    pub async fn set_fill_mode(&self, mode: FillMode) {
        self.state.lock().await.fill_mode = mode;
    }

    /// Make the next `count` gateway calls fail with a transient error
    pub async fn fail_next(&self, count: u32) {
        self.state.lock().await.failures_pending = count;
    }

    /// Append a candle, make it visible and match resting orders against it
    pub async fn push_candle(&self, symbol: &str, candle: Candle) -> Result<()> {
        let mut state = self.state.lock().await;
        let market = state
            .markets
            .get_mut(symbol)
            .ok_or_else(|| RoboError::UnknownInstrument(symbol.to_string()))?;
        market.candles.push(candle);
        market.visible = market.candles.len();
        state.match_resting(symbol);
        Ok(())
    }

    /// Reveal the next candle. Returns false once the history is exhausted.
    pub async fn advance(&self, symbol: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let advanced = state.advance(symbol)?;
        if advanced {
            state.match_resting(symbol);
        }
        Ok(advanced)
    }

    /// True when every listed market has revealed all of its candles
    pub async fn exhausted(&self) -> bool {
        let state = self.state.lock().await;
        state.markets.values().all(|m| m.visible >= m.candles.len())
    }

    /// Seed an open order with a partial execution already credited
    pub async fn seed_open_order(
        &self,
        symbol: &str,
        side: OrderSide,
        requested_qty: Decimal,
        executed_qty: Decimal,
        price: Decimal,
    ) -> Result<Order> {
        let mut state = self.state.lock().await;
        let instrument = state.instrument(symbol)?;
        let now = state.now(symbol);
        let id = state.next_order_id();
        state.settle(&instrument, side, executed_qty, price, false);
        state.reserve(&instrument, side, requested_qty - executed_qty, price, true);
        let order = Order {
            id,
            symbol: symbol.to_string(),
            side,
            kind: OrderKind::Limit,
            requested_qty,
            executed_qty,
            price: Some(price),
            cumulative_quote_qty: executed_qty * price,
            status: if executed_qty > Decimal::ZERO {
                OrderStatus::PartiallyFilled
            } else {
                OrderStatus::Open
            },
            updated_at: now,
        };
        state.open_orders.push(order.clone());
        Ok(order)
    }

    /// Every request that reached `place_order`, accepted or not
    pub async fn placed_orders(&self) -> Vec<OrderRequest> {
        self.state.lock().await.placed.clone()
    }

    pub async fn balance(&self, asset: &str) -> AssetBalance {
        self.state
            .lock()
            .await
            .balances
            .get(&asset.to_uppercase())
            .copied()
            .unwrap_or_default()
    }
}

impl PaperState {
    fn check_failure(&mut self) -> Result<()> {
        if self.failures_pending > 0 {
            self.failures_pending -= 1;
            return Err(RoboError::Exchange("paper venue: injected failure".to_string()));
        }
        Ok(())
    }

    fn instrument(&self, symbol: &str) -> Result<Instrument> {
        self.markets
            .get(symbol)
            .map(|m| m.instrument.clone())
            .ok_or_else(|| RoboError::UnknownInstrument(symbol.to_string()))
    }

    fn now(&self, symbol: &str) -> DateTime<Utc> {
        self.markets
            .get(symbol)
            .and_then(|m| m.current())
            .map(|c| c.open_time)
            .unwrap_or_default()
    }

    fn last_close(&self, symbol: &str) -> Result<Decimal> {
        self.markets
            .get(symbol)
            .and_then(|m| m.current())
            .map(|c| c.close)
            .ok_or_else(|| RoboError::InsufficientData(format!("{symbol}: no candles to price against")))
    }

    fn next_order_id(&mut self) -> String {
        let id = format!("paper-{}", self.next_id);
        self.next_id += 1;
        id
    }

    fn advance(&mut self, symbol: &str) -> Result<bool> {
        let market = self
            .markets
            .get_mut(symbol)
            .ok_or_else(|| RoboError::UnknownInstrument(symbol.to_string()))?;
        if market.visible < market.candles.len() {
            market.visible += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn free(&self, asset: &str) -> Decimal {
        self.balances.get(asset).map(|b| b.free).unwrap_or_default()
    }

    /// Move `qty` at `price` between base and quote balances.
    fn settle(&mut self, instrument: &Instrument, side: OrderSide, qty: Decimal, price: Decimal, from_locked: bool) {
        let notional = qty * price;
        let (paid_asset, paid, received_asset, received) = match side {
            OrderSide::Buy => (&instrument.quote, notional, &instrument.base, qty),
            OrderSide::Sell => (&instrument.base, qty, &instrument.quote, notional),
        };
        let payer = self.balances.entry(paid_asset.clone()).or_default();
        if from_locked {
            payer.locked -= paid;
        } else {
            payer.free -= paid;
        }
        self.balances.entry(received_asset.clone()).or_default().free += received;
    }

    fn reserve(&mut self, instrument: &Instrument, side: OrderSide, qty: Decimal, price: Decimal, lock: bool) {
        let (asset, amount) = match side {
            OrderSide::Buy => (&instrument.quote, qty * price),
            OrderSide::Sell => (&instrument.base, qty),
        };
        let balance = self.balances.entry(asset.clone()).or_default();
        if lock {
            balance.free -= amount;
            balance.locked += amount;
        } else {
            balance.locked -= amount;
            balance.free += amount;
        }
    }

    fn has_funds(&self, instrument: &Instrument, side: OrderSide, qty: Decimal, price: Decimal) -> bool {
        match side {
            OrderSide::Buy => self.free(&instrument.quote) >= qty * price,
            OrderSide::Sell => self.free(&instrument.base) >= qty,
        }
    }

    /// Fill resting limit orders the latest candle crossed.
    fn match_resting(&mut self, symbol: &str) {
        let Some(candle) = self.markets.get(symbol).and_then(|m| m.current()).cloned() else {
            return;
        };
        let Ok(instrument) = self.instrument(symbol) else {
            return;
        };

        let (crossed, resting): (Vec<Order>, Vec<Order>) =
            std::mem::take(&mut self.open_orders).into_iter().partition(|o| {
                o.symbol == symbol
                    && o.kind == OrderKind::Limit
                    && match (o.side, o.price) {
                        (OrderSide::Buy, Some(p)) => candle.low <= p,
                        (OrderSide::Sell, Some(p)) => candle.high >= p,
                        _ => false,
                    }
            });
        self.open_orders = resting;

        for mut order in crossed {
            let price = order.price.unwrap_or(candle.close);
            let remaining = order.requested_qty - order.executed_qty;
            self.settle(&instrument, order.side, remaining, price, true);
            order.executed_qty = order.requested_qty;
            order.cumulative_quote_qty += remaining * price;
            order.status = OrderStatus::Filled;
            order.updated_at = candle.open_time;
            debug!(order_id = %order.id, %price, "paper limit order filled");
            self.closed_orders.push(order);
        }
    }
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    fn is_dry_run(&self) -> bool {
        true
    }

    async fn get_candles(
        &self,
        instrument: &Instrument,
        _interval: CandleInterval,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let mut state = self.state.lock().await;
        state.check_failure()?;
        let symbol = instrument.symbol();
        if state.auto_advance && state.advance(&symbol)? {
            state.match_resting(&symbol);
        }
        let market = state
            .markets
            .get(&symbol)
            .ok_or_else(|| RoboError::UnknownInstrument(symbol.clone()))?;
        let end = market.visible;
        let start = end.saturating_sub(limit);
        Ok(market.candles[start..end].to_vec())
    }

    async fn get_balances(&self) -> Result<HashMap<String, AssetBalance>> {
        let mut state = self.state.lock().await;
        state.check_failure()?;
        Ok(state.balances.clone())
    }

    async fn get_open_orders(&self, instrument: &Instrument) -> Result<Vec<Order>> {
        let mut state = self.state.lock().await;
        state.check_failure()?;
        let symbol = instrument.symbol();
        Ok(state
            .open_orders
            .iter()
            .filter(|o| o.symbol == symbol)
            .cloned()
            .collect())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<Order> {
        let mut state = self.state.lock().await;
        state.placed.push(request.clone());
        state.check_failure()?;

        let instrument = state.instrument(&request.symbol)?;
        if request.quantity <= Decimal::ZERO
            || instrument.rules.quantize_qty(request.quantity) != request.quantity
        {
            return Err(RoboError::OrderRejected(format!(
                "quantity {} is not a positive multiple of {}",
                request.quantity, instrument.rules.qty_step
            )));
        }

        let now = state.now(&request.symbol);
        let id = state.next_order_id();
        let mut order = Order {
            id,
            symbol: request.symbol.clone(),
            side: request.side,
            kind: request.kind,
            requested_qty: request.quantity,
            executed_qty: Decimal::ZERO,
            price: request.price,
            cumulative_quote_qty: Decimal::ZERO,
            status: OrderStatus::Open,
            updated_at: now,
        };

        match request.kind {
            OrderKind::Market => {
                let price = state.last_close(&request.symbol)?;
                if !state.has_funds(&instrument, request.side, request.quantity, price) {
                    return Err(RoboError::OrderRejected("insufficient balance".to_string()));
                }
                let fill_qty = match state.fill_mode {
                    FillMode::Immediate => request.quantity,
                    FillMode::Partial(ratio) => instrument.rules.quantize_qty(request.quantity * ratio),
                    FillMode::Resting => Decimal::ZERO,
                };
                if fill_qty > Decimal::ZERO {
                    state.settle(&instrument, request.side, fill_qty, price, false);
                    order.executed_qty = fill_qty;
                    order.cumulative_quote_qty = fill_qty * price;
                }
                order.status = if fill_qty >= request.quantity {
                    OrderStatus::Filled
                } else if fill_qty > Decimal::ZERO {
                    OrderStatus::PartiallyFilled
                } else {
                    OrderStatus::Open
                };
            }
            OrderKind::Limit => {
                let price = request
                    .price
                    .ok_or_else(|| RoboError::OrderRejected("limit order without price".to_string()))?;
                if !state.has_funds(&instrument, request.side, request.quantity, price) {
                    return Err(RoboError::OrderRejected("insufficient balance".to_string()));
                }
                state.reserve(&instrument, request.side, request.quantity, price, true);
            }
        }

        info!(
            venue = "paper",
            order_id = %order.id,
            side = %order.side,
            kind = %order.kind,
            qty = %order.requested_qty,
            executed = %order.executed_qty,
            status = ?order.status,
            "paper order accepted"
        );

        if order.status.is_open() {
            state.open_orders.push(order.clone());
        } else {
            state.closed_orders.push(order.clone());
        }
        Ok(order)
    }

    async fn cancel_order(&self, instrument: &Instrument, order_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_failure()?;
        let symbol = instrument.symbol();
        let pos = state
            .open_orders
            .iter()
            .position(|o| o.id == order_id && o.symbol == symbol)
            .ok_or_else(|| RoboError::OrderNotFound(order_id.to_string()))?;
        let mut order = state.open_orders.remove(pos);
        if order.kind == OrderKind::Limit {
            if let Some(price) = order.price {
                let remaining = order.requested_qty - order.executed_qty;
                state.reserve(instrument, order.side, remaining, price, false);
            }
        }
        order.status = OrderStatus::Cancelled;
        order.updated_at = state.now(&symbol);
        debug!(order_id, "paper order cancelled");
        state.closed_orders.push(order);
        Ok(())
    }

    async fn get_order_history(&self, instrument: &Instrument, limit: usize) -> Result<Vec<Order>> {
        let mut state = self.state.lock().await;
        state.check_failure()?;
        let symbol = instrument.symbol();
        let mut orders: Vec<Order> = state
            .closed_orders
            .iter()
            .chain(state.open_orders.iter())
            .filter(|o| o.symbol == symbol)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.updated_at);
        let start = orders.len().saturating_sub(limit);
        Ok(orders.split_off(start))
    }

    async fn get_instrument_rules(&self, symbol: &str) -> Result<InstrumentRules> {
        let mut state = self.state.lock().await;
        state.check_failure()?;
        state
            .markets
            .get(&symbol.to_uppercase())
            .map(|m| m.instrument.rules)
            .ok_or_else(|| RoboError::UnknownInstrument(symbol.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn sol() -> Instrument {
        Instrument::new(
            "SOL",
            "USDT",
            InstrumentRules {
                price_tick: dec!(0.01),
                qty_step: dec!(0.001),
            },
        )
    }

    fn candle(i: i64, close: Decimal) -> Candle {
        Candle {
            open_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(5 * i),
            open: close,
            high: close + dec!(1),
            low: close - dec!(1),
            close,
            volume: dec!(10),
        }
    }

    fn venue() -> PaperExchange {
        PaperExchange::new()
            .with_balance("USDT", dec!(1000))
            .with_market(sol(), vec![candle(0, dec!(100)), candle(1, dec!(101))])
    }

    #[tokio::test]
    async fn market_buy_fills_at_last_close() {
        let venue = venue();
        let order = venue
            .place_order(&OrderRequest::market(&sol(), OrderSide::Buy, dec!(2)))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.avg_fill_price(), Some(dec!(101)));
        assert_eq!(venue.balance("SOL").await.free, dec!(2));
        assert_eq!(venue.balance("USDT").await.free, dec!(798));
    }

    #[tokio::test]
    async fn limit_sell_rests_until_crossed() {
        let venue = venue().with_balance("SOL", dec!(1));
        let order = venue
            .place_order(&OrderRequest::limit(&sol(), OrderSide::Sell, dec!(1), dec!(104)))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Open);
        assert_eq!(venue.balance("SOL").await.locked, dec!(1));

        venue.push_candle("SOLUSDT", candle(2, dec!(102))).await.unwrap();
        assert_eq!(venue.get_open_orders(&sol()).await.unwrap().len(), 1);

        venue.push_candle("SOLUSDT", candle(3, dec!(103.5))).await.unwrap();
        assert!(venue.get_open_orders(&sol()).await.unwrap().is_empty());
        assert_eq!(venue.balance("SOL").await.total(), Decimal::ZERO);
        assert_eq!(venue.balance("USDT").await.free, dec!(1104));
    }

    #[tokio::test]
    async fn partial_fill_stays_open_until_cancelled() {
        let venue = venue();
        venue.set_fill_mode(FillMode::Partial(dec!(0.5))).await;
        let order = venue
            .place_order(&OrderRequest::market(&sol(), OrderSide::Buy, dec!(1)))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.executed_qty, dec!(0.5));

        venue.cancel_order(&sol(), &order.id).await.unwrap();
        let history = venue.get_order_history(&sol(), 10).await.unwrap();
        assert_eq!(history.last().map(|o| o.status), Some(OrderStatus::Cancelled));
        assert!(venue.get_open_orders(&sol()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let venue = venue();
        venue.fail_next(1).await;
        let err = venue.get_balances().await.unwrap_err();
        assert!(err.is_transient());
        assert!(venue.get_balances().await.is_ok());
    }

    #[tokio::test]
    async fn auto_advance_reveals_one_candle_per_call() {
        let venue = venue().with_auto_advance(1);
        assert_eq!(venue.get_candles(&sol(), CandleInterval::FiveMinutes, 10).await.unwrap().len(), 2);
        assert!(venue.exhausted().await);
    }

    #[tokio::test]
    async fn rejects_unquantized_quantity() {
        let venue = venue();
        let mut request = OrderRequest::market(&sol(), OrderSide::Buy, dec!(1));
        request.quantity = dec!(0.0005);
        assert!(matches!(
            venue.place_order(&request).await,
            Err(RoboError::OrderRejected(_))
        ));
    }
}
