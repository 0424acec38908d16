use async_trait::async_trait;
use std::collections::HashMap;

use crate::domain::{AssetBalance, Candle, CandleInterval, Instrument, InstrumentRules, Order, OrderRequest};
use crate::error::Result;

/// Narrow view of a spot exchange account.
///
/// Implementations own transport concerns (signing, retries, timeouts). Every
/// call is request/response; none of them may block indefinitely.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Venue name used in logs
    fn name(&self) -> &str;

    fn is_dry_run(&self) -> bool;

    /// Most recent `limit` candles, oldest first
    async fn get_candles(
        &self,
        instrument: &Instrument,
        interval: CandleInterval,
        limit: usize,
    ) -> Result<Vec<Candle>>;

    /// Balances keyed by asset code
    async fn get_balances(&self) -> Result<HashMap<String, AssetBalance>>;

    async fn get_open_orders(&self, instrument: &Instrument) -> Result<Vec<Order>>;

    /// Submit an already-quantized order
    async fn place_order(&self, request: &OrderRequest) -> Result<Order>;

    async fn cancel_order(&self, instrument: &Instrument, order_id: &str) -> Result<()>;

    /// Most recent `limit` orders of any status, oldest first
    async fn get_order_history(&self, instrument: &Instrument, limit: usize) -> Result<Vec<Order>>;

    async fn get_instrument_rules(&self, symbol: &str) -> Result<InstrumentRules>;
}
