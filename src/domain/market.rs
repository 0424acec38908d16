use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Exchange-defined quantization units for one instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentRules {
    /// Minimum price increment
    pub price_tick: Decimal,
    /// Minimum quantity increment (also the minimum tradable unit)
    pub qty_step: Decimal,
}

impl InstrumentRules {
    pub fn quantize_price(&self, price: Decimal) -> Decimal {
        quantize(price, self.price_tick)
    }

    pub fn quantize_qty(&self, qty: Decimal) -> Decimal {
        quantize(qty, self.qty_step)
    }
}

/// Round `value` down to the nearest multiple of `step`.
///
/// A non-positive step leaves the value untouched.
pub fn quantize(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    ((value / step).floor() * step).normalize()
}

/// A tradable base/quote pair. Immutable once a controller has been built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub base: String,
    pub quote: String,
    pub rules: InstrumentRules,
}

impl Instrument {
    pub fn new(base: impl Into<String>, quote: impl Into<String>, rules: InstrumentRules) -> Self {
        Self {
            base: base.into().to_uppercase(),
            quote: quote.into().to_uppercase(),
            rules,
        }
    }

    /// Exchange symbol, e.g. `SOLUSDT`. Also the persistence key.
    pub fn symbol(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.base, self.quote)
    }
}

/// OHLCV candle. Series are append-only and never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    #[serde(default)]
    pub volume: Decimal,
}

impl Candle {
    pub fn close_f64(&self) -> f64 {
        self.close.to_f64().unwrap_or(f64::NAN)
    }

    pub fn high_f64(&self) -> f64 {
        self.high.to_f64().unwrap_or(f64::NAN)
    }

    pub fn low_f64(&self) -> f64 {
        self.low.to_f64().unwrap_or(f64::NAN)
    }

    pub fn volume_f64(&self) -> f64 {
        self.volume.to_f64().unwrap_or(f64::NAN)
    }
}

/// Highest high among candles opened at or after `since`.
pub fn highest_high_since(candles: &[Candle], since: DateTime<Utc>) -> Option<Decimal> {
    candles
        .iter()
        .filter(|c| c.open_time >= since)
        .map(|c| c.high)
        .max()
}

/// Candle interval, using exchange-style notation (`5m`, `1h`, `1d`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CandleInterval {
    OneMinute,
    ThreeMinutes,
    FiveMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
    TwoHours,
    FourHours,
    SixHours,
    EightHours,
    TwelveHours,
    OneDay,
}

impl CandleInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::ThreeMinutes => "3m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::ThirtyMinutes => "30m",
            Self::OneHour => "1h",
            Self::TwoHours => "2h",
            Self::FourHours => "4h",
            Self::SixHours => "6h",
            Self::EightHours => "8h",
            Self::TwelveHours => "12h",
            Self::OneDay => "1d",
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            Self::OneMinute => Duration::minutes(1),
            Self::ThreeMinutes => Duration::minutes(3),
            Self::FiveMinutes => Duration::minutes(5),
            Self::FifteenMinutes => Duration::minutes(15),
            Self::ThirtyMinutes => Duration::minutes(30),
            Self::OneHour => Duration::hours(1),
            Self::TwoHours => Duration::hours(2),
            Self::FourHours => Duration::hours(4),
            Self::SixHours => Duration::hours(6),
            Self::EightHours => Duration::hours(8),
            Self::TwelveHours => Duration::hours(12),
            Self::OneDay => Duration::days(1),
        }
    }
}

impl Default for CandleInterval {
    fn default() -> Self {
        Self::FiveMinutes
    }
}

impl fmt::Display for CandleInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CandleInterval {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "1m" => Ok(Self::OneMinute),
            "3m" => Ok(Self::ThreeMinutes),
            "5m" => Ok(Self::FiveMinutes),
            "15m" => Ok(Self::FifteenMinutes),
            "30m" => Ok(Self::ThirtyMinutes),
            "1h" => Ok(Self::OneHour),
            "2h" => Ok(Self::TwoHours),
            "4h" => Ok(Self::FourHours),
            "6h" => Ok(Self::SixHours),
            "8h" => Ok(Self::EightHours),
            "12h" => Ok(Self::TwelveHours),
            "1d" => Ok(Self::OneDay),
            other => Err(format!("unsupported candle interval '{other}'")),
        }
    }
}

impl TryFrom<String> for CandleInterval {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CandleInterval> for String {
    fn from(value: CandleInterval) -> Self {
        value.as_str().to_string()
    }
}

/// Free and locked amounts of one asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AssetBalance {
    pub free: Decimal,
    pub locked: Decimal,
}

impl AssetBalance {
    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }
}
