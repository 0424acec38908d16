use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Instrument;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderKind {
    Market,
    Limit,
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderKind::Market => write!(f, "MARKET"),
            OrderKind::Limit => write!(f, "LIMIT"),
        }
    }
}

/// Order status as reported by the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
}

impl OrderStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, OrderStatus::Open | OrderStatus::PartiallyFilled)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_open()
    }
}

/// Order request (what we want to do). Quantity and price are quantized by
/// the constructor so nothing unquantized reaches the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
}

impl OrderRequest {
    pub fn market(instrument: &Instrument, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            client_order_id: Uuid::new_v4().to_string(),
            symbol: instrument.symbol(),
            side,
            kind: OrderKind::Market,
            quantity: instrument.rules.quantize_qty(quantity),
            price: None,
        }
    }

    pub fn limit(instrument: &Instrument, side: OrderSide, quantity: Decimal, price: Decimal) -> Self {
        Self {
            client_order_id: Uuid::new_v4().to_string(),
            symbol: instrument.symbol(),
            side,
            kind: OrderKind::Limit,
            quantity: instrument.rules.quantize_qty(quantity),
            price: Some(instrument.rules.quantize_price(price)),
        }
    }
}

/// Order as known by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub requested_qty: Decimal,
    pub executed_qty: Decimal,
    /// Limit price (None for market orders)
    pub price: Option<Decimal>,
    /// Quote amount spent/received so far
    pub cumulative_quote_qty: Decimal,
    pub status: OrderStatus,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Average execution price, if anything executed
    pub fn avg_fill_price(&self) -> Option<Decimal> {
        if self.executed_qty > Decimal::ZERO {
            Some(self.cumulative_quote_qty / self.executed_qty)
        } else {
            None
        }
    }

    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled
    }

    pub fn has_partial_fill(&self) -> bool {
        self.executed_qty > Decimal::ZERO && self.status.is_open()
    }
}

/// The most recent filled order of the given side.
pub fn last_filled(history: &[Order], side: OrderSide) -> Option<&Order> {
    history
        .iter()
        .filter(|o| o.side == side && o.is_filled() && o.executed_qty > Decimal::ZERO)
        .max_by_key(|o| o.updated_at)
}
