//! Wire protocol for the venue WebSocket API
//!
//! Requests are JSON objects tagged by their leading field (`ping`,
//! `authorize`, `ticks`, `proposal`, `time`, `ticks_history`). Every request
//! the client sends carries a `req_id`; the venue echoes it on the reply
//! together with `msg_type`, an optional `error`, and `echo_req`, a verbatim
//! copy of the request.
//!
//! Flow: `Request` → `Outbound` (serialized text + id) → venue → `Reply`.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use types::errors::{FeedError, VenueErrorCode};
use types::ids::{RequestId, Symbol};
use types::market::{ContractSide, DurationUnit, MINUTE_SECS};

/// Contract parameters shared by every proposal subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalParams {
    pub amount: f64,
    pub duration: u32,
    pub duration_unit: DurationUnit,
    pub currency: String,
}

/// Proposal quotes are requested for a fixed stake.
pub const PROPOSAL_BASIS: &str = "stake";

/// One-shot historical candle query.
#[derive(Debug, Clone, PartialEq)]
pub struct CandleQuery {
    pub symbol: Symbol,
    pub count: u32,
    /// 0 means "the most recent `count` candles".
    pub start_epoch: i64,
    /// 0 means "up to the latest candle".
    pub end_epoch: i64,
}

/// A request the client knows how to build.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Ping,
    Authorize { token: String },
    Ticks { symbols: Vec<Symbol> },
    Proposal {
        symbol: Symbol,
        side: ContractSide,
        params: ProposalParams,
    },
    Time,
    Candles(CandleQuery),
}

/// Request family, used to decide how replies to it are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Ping,
    Authorize,
    Ticks,
    Proposal,
    Time,
    Candles,
}

impl RequestKind {
    /// Standing subscriptions keep producing replies under the same id.
    pub fn is_subscription(&self) -> bool {
        matches!(self, RequestKind::Ticks | RequestKind::Proposal)
    }
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Ping => RequestKind::Ping,
            Request::Authorize { .. } => RequestKind::Authorize,
            Request::Ticks { .. } => RequestKind::Ticks,
            Request::Proposal { .. } => RequestKind::Proposal,
            Request::Time => RequestKind::Time,
            Request::Candles(_) => RequestKind::Candles,
        }
    }

    /// Build the JSON body, stamped with `req_id`.
    pub fn to_json(&self, req_id: RequestId) -> Value {
        let mut body = match self {
            Request::Ping => json!({ "ping": 1 }),
            Request::Authorize { token } => json!({ "authorize": token }),
            Request::Ticks { symbols } => json!({ "ticks": symbols, "subscribe": 1 }),
            Request::Proposal {
                symbol,
                side,
                params,
            } => json!({
                "proposal": 1,
                "amount": params.amount,
                "basis": PROPOSAL_BASIS,
                "contract_type": side.as_str(),
                "currency": params.currency,
                "duration": params.duration,
                "duration_unit": params.duration_unit.as_str(),
                "symbol": symbol,
                "subscribe": 1,
            }),
            Request::Time => json!({ "time": 1 }),
            Request::Candles(query) => {
                let mut body = json!({
                    "ticks_history": query.symbol,
                    "style": "candles",
                    "granularity": MINUTE_SECS,
                });
                if query.start_epoch == 0 {
                    body["start"] = json!(1);
                    body["count"] = json!(query.count);
                } else {
                    body["start"] = json!(query.start_epoch);
                }
                body["end"] = if query.end_epoch == 0 {
                    json!("latest")
                } else {
                    json!(query.end_epoch)
                };
                body
            }
        };
        body["req_id"] = json!(req_id);
        body
    }
}

/// A serialized request waiting for, or already past, transmission.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub id: RequestId,
    pub kind: RequestKind,
    pub text: String,
    /// Number of times this exact request has been replayed.
    pub replays: u32,
}

impl Outbound {
    pub fn new(id: RequestId, request: &Request) -> Result<Self, FeedError> {
        let text = serde_json::to_string(&request.to_json(id))?;
        Ok(Self {
            id,
            kind: request.kind(),
            text,
            replays: 0,
        })
    }
}

/// Reply families the router acts on, in classification priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyKind {
    Tick,
    Proposal,
    Authorize,
    Time,
    Candles,
}

impl ReplyKind {
    pub const PRIORITY: [ReplyKind; 5] = [
        ReplyKind::Tick,
        ReplyKind::Proposal,
        ReplyKind::Authorize,
        ReplyKind::Time,
        ReplyKind::Candles,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            ReplyKind::Tick => "tick",
            ReplyKind::Proposal => "proposal",
            ReplyKind::Authorize => "authorize",
            ReplyKind::Time => "time",
            ReplyKind::Candles => "candles",
        }
    }

    /// First kind whose tag matches wins; unknown tags yield `None`.
    pub fn classify(msg_type: &str) -> Option<Self> {
        Self::PRIORITY.into_iter().find(|kind| kind.tag() == msg_type)
    }
}

/// Structured error attached to a failed reply.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReplyError {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl ReplyError {
    pub fn classify(&self) -> VenueErrorCode {
        VenueErrorCode::from_code(&self.code)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TickBody {
    pub symbol: Symbol,
    #[serde(deserialize_with = "lenient_f64")]
    pub quote: f64,
    #[serde(deserialize_with = "lenient_i64")]
    pub epoch: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProposalBody {
    #[serde(deserialize_with = "lenient_f64")]
    pub ask_price: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub payout: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AuthorizeBody {
    #[serde(deserialize_with = "lenient_f64")]
    pub balance: f64,
    #[serde(default)]
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawCandle {
    #[serde(deserialize_with = "lenient_i64")]
    pub epoch: i64,
    #[serde(deserialize_with = "lenient_f64")]
    pub close: f64,
}

/// Parsed inbound message.
///
/// Only the body matching `msg_type` is expected to be present; a reply
/// carrying `error` usually has no body at all.
#[derive(Debug, Clone, Deserialize)]
pub struct Reply {
    #[serde(default)]
    pub msg_type: String,
    #[serde(default)]
    pub req_id: Option<RequestId>,
    #[serde(default)]
    pub error: Option<ReplyError>,
    #[serde(default)]
    pub echo_req: Option<Value>,
    #[serde(default)]
    pub tick: Option<TickBody>,
    #[serde(default)]
    pub proposal: Option<ProposalBody>,
    #[serde(default)]
    pub authorize: Option<AuthorizeBody>,
    #[serde(default, deserialize_with = "lenient_opt_i64")]
    pub time: Option<i64>,
    #[serde(default)]
    pub candles: Option<Vec<RawCandle>>,
}

impl Reply {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn kind(&self) -> Option<ReplyKind> {
        ReplyKind::classify(&self.msg_type)
    }

    /// A string field of the echoed request, e.g. `symbol`.
    pub fn echo_str(&self, field: &str) -> Option<&str> {
        self.echo_req.as_ref()?.get(field)?.as_str()
    }
}

fn value_to_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Largest magnitude accepted for integer fields (epochs, counts).
const MAX_WIRE_INT: i64 = 1 << 53;

fn value_to_i64(v: &Value) -> Option<i64> {
    let n = match v {
        Value::Number(n) => match n.as_i64() {
            Some(i) => i,
            None => {
                let f = n.as_f64()?;
                if !f.is_finite() || f.abs() > MAX_WIRE_INT as f64 {
                    return None;
                }
                f as i64
            }
        },
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    (-MAX_WIRE_INT..=MAX_WIRE_INT).contains(&n).then_some(n)
}

// The venue sends some numeric fields as strings.
fn lenient_f64<'de, D: Deserializer<'de>>(de: D) -> Result<f64, D::Error> {
    let v = Value::deserialize(de)?;
    value_to_f64(&v).ok_or_else(|| serde::de::Error::custom(format!("expected number, got {v}")))
}

fn lenient_i64<'de, D: Deserializer<'de>>(de: D) -> Result<i64, D::Error> {
    let v = Value::deserialize(de)?;
    value_to_i64(&v).ok_or_else(|| serde::de::Error::custom(format!("expected integer, got {v}")))
}

fn lenient_opt_i64<'de, D: Deserializer<'de>>(de: D) -> Result<Option<i64>, D::Error> {
    let v = Option::<Value>::deserialize(de)?;
    match v {
        None | Some(Value::Null) => Ok(None),
        Some(v) => value_to_i64(&v)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("expected integer, got {v}"))),
    }
}
