//! Market data shapes produced by the feed client
//!
//! Prices are venue floats (`f64`) and times are Unix epoch seconds, matching
//! what the venue sends on the wire and what the daily record files store.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::Symbol;

/// Bar width in seconds
pub const MINUTE_SECS: i64 = 60;

/// Floor an epoch to the start of its minute.
pub fn minute_boundary(epoch: i64) -> i64 {
    epoch.div_euclid(MINUTE_SECS).saturating_mul(MINUTE_SECS)
}

/// Whether an epoch sits exactly on a minute boundary.
pub fn is_minute_boundary(epoch: i64) -> bool {
    epoch.rem_euclid(MINUTE_SECS) == 0
}

/// One-minute bar: last observed price and the bar's open time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub close: f64,
    pub open_time: i64,
}

impl Bar {
    pub fn new(close: f64, open_time: i64) -> Self {
        Self { close, open_time }
    }

    /// Open time as a UTC timestamp, if representable.
    pub fn open_time_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.open_time, 0).single()
    }
}

/// Contract direction quoted by a payout proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContractSide {
    /// Rise/up contract, stored in the buy slot
    Call,
    /// Fall/down contract, stored in the sell slot
    Put,
}

impl ContractSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractSide::Call => "CALL",
            ContractSide::Put => "PUT",
        }
    }

    pub fn both() -> [ContractSide; 2] {
        [ContractSide::Call, ContractSide::Put]
    }

    /// Anything other than the call side is booked on the sell slot.
    pub fn from_wire(contract_type: &str) -> Self {
        if contract_type.eq_ignore_ascii_case("CALL") {
            ContractSide::Call
        } else {
            ContractSide::Put
        }
    }
}

/// Unit of a contract duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DurationUnit {
    #[serde(rename = "t")]
    Ticks,
    #[serde(rename = "s")]
    Seconds,
    #[serde(rename = "m")]
    Minutes,
    #[serde(rename = "h")]
    Hours,
    #[serde(rename = "d")]
    Days,
}

impl DurationUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            DurationUnit::Ticks => "t",
            DurationUnit::Seconds => "s",
            DurationUnit::Minutes => "m",
            DurationUnit::Hours => "h",
            DurationUnit::Days => "d",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "t" => Some(DurationUnit::Ticks),
            "s" => Some(DurationUnit::Seconds),
            "m" => Some(DurationUnit::Minutes),
            "h" => Some(DurationUnit::Hours),
            "d" => Some(DurationUnit::Days),
            _ => None,
        }
    }
}

/// Effective return of a quoted contract: `payout / ask_price - 1`.
///
/// A zero ask price yields 0 rather than infinity.
pub fn payout_return(payout: f64, ask_price: f64) -> f64 {
    if ask_price != 0.0 {
        payout / ask_price - 1.0
    } else {
        0.0
    }
}

/// Buy/sell effective returns for one symbol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProposalPair {
    pub buy_return: f64,
    pub sell_return: f64,
}

impl ProposalPair {
    pub fn set(&mut self, side: ContractSide, value: f64) {
        match side {
            ContractSide::Call => self.buy_return = value,
            ContractSide::Put => self.sell_return = value,
        }
    }
}

/// Result of a historical candle fetch as parallel arrays.
///
/// `prices[i]` is the close of the candle opened at `times[i]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandleSeries {
    pub prices: Vec<f64>,
    pub times: Vec<i64>,
}

impl CandleSeries {
    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    /// Zip back into bars, oldest first.
    pub fn to_bars(&self) -> Vec<Bar> {
        self.prices
            .iter()
            .zip(self.times.iter())
            .map(|(&close, &open_time)| Bar::new(close, open_time))
            .collect()
    }
}

/// A live price observation fanned out to downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub symbol: Symbol,
    pub price: f64,
    pub epoch: i64,
}
