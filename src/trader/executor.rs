//! Order sizing and limit pricing for strategy entries and exits.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::domain::{Candle, InstrumentRules, Order, OrderSide};
use crate::strategy::indicators;

/// RSI period used to read the market before pricing a limit order
const PRICING_RSI_PERIOD: usize = 14;
/// Candles averaged to decide whether current volume is low
const VOLUME_WINDOW: usize = 20;

const OVERSOLD: f64 = 30.0;
const OVERBOUGHT: f64 = 70.0;

/// Momentum and participation readings on the last candle
#[derive(Debug, Clone, Copy)]
struct MarketMood {
    rsi: f64,
    low_volume: bool,
}

fn market_mood(candles: &[Candle]) -> MarketMood {
    let rsi = indicators::last(&indicators::rsi(&indicators::closes(candles), PRICING_RSI_PERIOD));
    let volumes = indicators::volumes(candles);
    let avg_volume = indicators::last(&indicators::sma(&volumes, VOLUME_WINDOW));
    MarketMood {
        rsi,
        low_volume: indicators::last(&volumes) < avg_volume,
    }
}

fn scaled(close: Decimal, factor: Decimal) -> Decimal {
    close * factor
}

/// Limit price for a buy: a little under the close when oversold, a little
/// over it on thin volume, further over it otherwise.
pub fn buy_limit_price(candles: &[Candle], rules: &InstrumentRules) -> Option<Decimal> {
    let close = candles.last()?.close;
    let mood = market_mood(candles);
    let price = if mood.rsi < OVERSOLD {
        scaled(close, dec!(0.998))
    } else if mood.low_volume {
        scaled(close, dec!(1.002))
    } else {
        scaled(close, dec!(1.005))
    };
    Some(rules.quantize_price(price))
}

/// Lowest price a sell may go out at: `last_buy * (1 - acceptable_loss_pct%)`
pub fn minimum_sell_price(last_buy_price: Decimal, acceptable_loss_pct: Decimal) -> Decimal {
    last_buy_price * (Decimal::ONE - acceptable_loss_pct / Decimal::ONE_HUNDRED)
}

/// Limit price for a sell: a little over the close when overbought, a little
/// under it on thin volume, further under it otherwise; never below the
/// acceptable-loss floor.
pub fn sell_limit_price(
    candles: &[Candle],
    rules: &InstrumentRules,
    last_buy_price: Decimal,
    acceptable_loss_pct: Decimal,
) -> Option<Decimal> {
    let close = candles.last()?.close;
    let mood = market_mood(candles);
    let mut price = if mood.rsi > OVERBOUGHT {
        scaled(close, dec!(1.002))
    } else if mood.low_volume {
        scaled(close, dec!(0.998))
    } else {
        scaled(close, dec!(0.995))
    };
    let floor = minimum_sell_price(last_buy_price, acceptable_loss_pct);
    if price < floor {
        price = floor;
    }
    Some(rules.quantize_price(price))
}

/// Buy size: the configured quantity minus what already executed on orders
/// that were just cancelled, quantized to the step.
pub fn buy_quantity(rules: &InstrumentRules, traded_quantity: Decimal, carry: Decimal) -> Decimal {
    rules.quantize_qty((traded_quantity - carry).max(Decimal::ZERO))
}

/// Fraction of holdings to sell for a take-profit rung
pub fn take_profit_quantity(rules: &InstrumentRules, balance: Decimal, sell_pct: Decimal) -> Decimal {
    rules.quantize_qty(balance * sell_pct / Decimal::ONE_HUNDRED)
}

/// Partial executions on open orders of one side
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenOrderCarry {
    /// Executed quantity summed over the side's open orders
    pub executed: Decimal,
    /// Highest limit price among partially executed orders (buys only)
    pub best_partial_price: Option<Decimal>,
}

/// Collect the executed part of open orders on `side`. `None` when there are
/// no open orders on that side.
pub fn open_order_carry(open_orders: &[Order], side: OrderSide) -> Option<OpenOrderCarry> {
    let same_side: Vec<&Order> = open_orders.iter().filter(|o| o.side == side).collect();
    if same_side.is_empty() {
        return None;
    }
    let executed: Decimal = same_side.iter().map(|o| o.executed_qty).sum();
    let best_partial_price = same_side
        .iter()
        .filter(|o| o.executed_qty > Decimal::ZERO)
        .filter_map(|o| o.price.or_else(|| o.avg_fill_price()))
        .max();
    Some(OpenOrderCarry {
        executed,
        best_partial_price,
    })
}
