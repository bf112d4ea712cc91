//! Frames exchanged with the market-data source.
//!
//! Inbound payloads arrive in several shapes; everything is normalized here so
//! the rest of the crate only sees [`Inbound`].

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::subscription::Subscription;

const HEARTBEAT_WORDS: [&str; 2] = ["ping", "heartbeat"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ControlFrame {
    Subscribe { source: String, symbol: String },
    Unsubscribe { source: String, symbol: String },
}

impl ControlFrame {
    pub fn subscribe(sub: &Subscription) -> Self {
        Self::Subscribe {
            source: sub.source.clone(),
            symbol: sub.symbol.clone(),
        }
    }

    pub fn unsubscribe(sub: &Subscription) -> Self {
        Self::Unsubscribe {
            source: sub.source.clone(),
            symbol: sub.symbol.clone(),
        }
    }

    pub fn to_json(&self) -> String {
        // Two string fields and a tag; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// How the server phrased its heartbeat, which decides how we answer it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStyle {
    /// Bare `ping` / `heartbeat` text.
    PlainText,
    /// `{"type": "ping"}` or `{"type": "heartbeat"}`.
    Json,
}

impl HeartbeatStyle {
    pub fn pong(self) -> String {
        match self {
            Self::PlainText => "pong".to_string(),
            Self::Json => r#"{"type":"pong"}"#.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickPayload {
    pub symbol: String,
    pub token: String,
    pub price: f64,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Heartbeat(HeartbeatStyle),
    Tick(TickPayload),
    /// Well-formed but not a tick (acks, status messages).
    Ignored,
}

#[derive(Debug, Error, PartialEq)]
pub enum WireError {
    #[error("frame is not JSON: {0}")]
    Malformed(String),
    #[error("tick for {symbol} has no finite price")]
    InvalidPrice { symbol: String },
}

#[derive(Debug, Default, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: Option<String>,
    symbol: Option<String>,
    tradingsymbol: Option<String>,
    ltp: Option<Value>,
    price: Option<Value>,
    last_price: Option<Value>,
    token: Option<Value>,
    token_id: Option<Value>,
    timestamp: Option<Value>,
}

pub fn parse_inbound(text: &str) -> Result<Inbound, WireError> {
    let raw: RawFrame = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(e) => {
            if is_heartbeat_word(text) {
                return Ok(Inbound::Heartbeat(HeartbeatStyle::PlainText));
            }
            return Err(WireError::Malformed(e.to_string()));
        }
    };

    if raw.kind.as_deref().is_some_and(is_heartbeat_word) {
        return Ok(Inbound::Heartbeat(HeartbeatStyle::Json));
    }

    let Some(symbol) = raw.symbol.or(raw.tradingsymbol) else {
        return Ok(Inbound::Ignored);
    };

    let price = [raw.ltp, raw.price, raw.last_price]
        .into_iter()
        .flatten()
        .find(|v| !v.is_null())
        .and_then(|v| value_to_f64(&v))
        .filter(|p| p.is_finite());
    let Some(price) = price else {
        return Err(WireError::InvalidPrice { symbol });
    };

    let token = raw
        .token
        .or(raw.token_id)
        .map(|v| value_to_string(&v))
        .unwrap_or_default();

    Ok(Inbound::Tick(TickPayload {
        symbol,
        token,
        price,
        timestamp: raw.timestamp.as_ref().and_then(parse_timestamp),
    }))
}

fn is_heartbeat_word(s: &str) -> bool {
    let s = s.trim();
    HEARTBEAT_WORDS.iter().any(|w| s.eq_ignore_ascii_case(w))
}

fn value_to_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// RFC 3339 strings, or epoch numbers in seconds or milliseconds.
fn parse_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => {
            let ts = n.as_i64()?;
            if ts <= 0 {
                return None;
            }
            if ts >= 1_000_000_000_000 {
                Utc.timestamp_millis_opt(ts).single()
            } else {
                Utc.timestamp_opt(ts, 0).single()
            }
        }
        _ => None,
    }
}
