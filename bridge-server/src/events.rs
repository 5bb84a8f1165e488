//! Normalized ingress events.
//!
//! The MT5 side posts loosely-shaped JSON; several field names changed over
//! EA generations, so normalization accepts the historical aliases
//! (`event`/`action` for `event_type`, `type` for `side`, `lots` for
//! `volume`) and the `PENDING_CLOSE` spelling of `PENDING_CANCEL`.

use serde_json::Value;
use thiserror::Error;

use ctrader_client::messages::TradeSide;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Open,
    PendingOpen,
    Modify,
    Close,
    PendingCancel,
}

impl EventKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "OPEN" => Some(EventKind::Open),
            "PENDING_OPEN" => Some(EventKind::PendingOpen),
            "MODIFY" => Some(EventKind::Modify),
            "CLOSE" => Some(EventKind::Close),
            "PENDING_CANCEL" | "PENDING_CLOSE" => Some(EventKind::PendingCancel),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Open => "OPEN",
            EventKind::PendingOpen => "PENDING_OPEN",
            EventKind::Modify => "MODIFY",
            EventKind::Close => "CLOSE",
            EventKind::PendingCancel => "PENDING_CANCEL",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    Limit,
    Stop,
    StopLimit,
}

impl PendingKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "limit" => Some(PendingKind::Limit),
            "stop" => Some(PendingKind::Stop),
            "stop_limit" | "stoplimit" => Some(PendingKind::StopLimit),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum NormalizeError {
    #[error("event body is not a JSON object")]
    NotAnObject,
    #[error("missing event_type")]
    MissingEventType,
    #[error("unknown event type: {0}")]
    UnknownEventType(String),
}

/// One normalized trade lifecycle event from the upstream venue.
#[derive(Debug, Clone)]
pub struct TradeEvent {
    pub kind: EventKind,
    pub ticket: i64,
    pub symbol: String,
    pub side: Option<TradeSide>,
    /// Lots on the source side; for CLOSE this is the closed portion.
    pub volume: Option<f64>,
    /// 0.0 means "not set".
    pub sl: f64,
    pub tp: f64,
    pub magic: i64,
    pub pending_kind: Option<PendingKind>,
    pub entry_price: Option<f64>,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub expiration_ms: Option<i64>,
    pub mt5_contract_size: Option<f64>,
    pub mt5_volume_min: Option<f64>,
    pub mt5_volume_step: Option<f64>,
}

impl TradeEvent {
    pub fn from_json(value: &Value) -> Result<Self, NormalizeError> {
        let obj = value.as_object().ok_or(NormalizeError::NotAnObject)?;

        let raw_kind = str_field(obj, "event_type")
            .or_else(|| str_field(obj, "action"))
            .or_else(|| str_field(obj, "event"))
            .ok_or(NormalizeError::MissingEventType)?;
        let kind =
            EventKind::parse(&raw_kind).ok_or(NormalizeError::UnknownEventType(raw_kind))?;

        let side = str_field(obj, "side")
            .or_else(|| str_field(obj, "type"))
            .and_then(|s| TradeSide::parse(&s));

        let volume = num_field(obj, "volume").or_else(|| num_field(obj, "lots"));

        Ok(TradeEvent {
            kind,
            ticket: int_field(obj, "ticket").unwrap_or(0),
            symbol: str_field(obj, "symbol").unwrap_or_default(),
            side,
            volume,
            sl: num_field(obj, "sl").unwrap_or(0.0),
            tp: num_field(obj, "tp").unwrap_or(0.0),
            magic: int_field(obj, "magic").unwrap_or(0),
            pending_kind: str_field(obj, "pending_type").and_then(|s| PendingKind::parse(&s)),
            entry_price: num_field(obj, "entry_price"),
            limit_price: num_field(obj, "limit_price"),
            stop_price: num_field(obj, "stop_price"),
            expiration_ms: int_field(obj, "expiration_ms"),
            mt5_contract_size: num_field(obj, "mt5_contract_size"),
            mt5_volume_min: num_field(obj, "mt5_volume_min"),
            mt5_volume_step: num_field(obj, "mt5_volume_step"),
        })
    }

    /// Stop-loss as an optional value (0.0 means unset).
    pub fn stop_loss(&self) -> Option<f64> {
        (self.sl > 0.0).then_some(self.sl)
    }

    pub fn take_profit(&self) -> Option<f64> {
        (self.tp > 0.0).then_some(self.tp)
    }
}

fn str_field(obj: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)?.as_str().map(|s| s.to_string())
}

// MT5 EAs are inconsistent about quoting numbers, accept both forms.
fn num_field(obj: &serde_json::Map<String, Value>, key: &str) -> Option<f64> {
    match obj.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn int_field(obj: &serde_json::Map<String, Value>, key: &str) -> Option<i64> {
    match obj.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_plain_open_event() {
        let value = json!({
            "event_type": "OPEN",
            "ticket": 1001,
            "symbol": "EURUSD",
            "side": "BUY",
            "volume": 0.10,
            "sl": 1.07500,
            "tp": 0.0,
            "magic": 0
        });
        let event = TradeEvent::from_json(&value).unwrap();
        assert_eq!(event.kind, EventKind::Open);
        assert_eq!(event.ticket, 1001);
        assert_eq!(event.symbol, "EURUSD");
        assert_eq!(event.side, Some(TradeSide::Buy));
        assert_eq!(event.volume, Some(0.10));
        assert_eq!(event.stop_loss(), Some(1.07500));
        assert_eq!(event.take_profit(), None);
    }

    #[test]
    fn test_normalize_action_and_type_aliases() {
        let value = json!({
            "action": "open",
            "ticket": 5,
            "symbol": "GBPUSD",
            "type": "SELL",
            "lots": 0.2
        });
        let event = TradeEvent::from_json(&value).unwrap();
        assert_eq!(event.kind, EventKind::Open);
        assert_eq!(event.side, Some(TradeSide::Sell));
        assert_eq!(event.volume, Some(0.2));
    }

    #[test]
    fn test_normalize_event_alias() {
        let value = json!({ "event": "CLOSE", "ticket": 9 });
        let event = TradeEvent::from_json(&value).unwrap();
        assert_eq!(event.kind, EventKind::Close);
        assert_eq!(event.volume, None);
    }

    #[test]
    fn test_pending_close_is_pending_cancel() {
        let value = json!({ "event_type": "PENDING_CLOSE", "ticket": 1100 });
        let event = TradeEvent::from_json(&value).unwrap();
        assert_eq!(event.kind, EventKind::PendingCancel);
    }

    #[test]
    fn test_pending_open_fields() {
        let value = json!({
            "event_type": "PENDING_OPEN",
            "pending_type": "stop_limit",
            "ticket": 1100,
            "symbol": "XAUUSD",
            "side": "SELL",
            "volume": 0.10,
            "limit_price": 1985.23,
            "stop_price": 1990.00,
            "expiration_ms": 1700000000000i64
        });
        let event = TradeEvent::from_json(&value).unwrap();
        assert_eq!(event.kind, EventKind::PendingOpen);
        assert_eq!(event.pending_kind, Some(PendingKind::StopLimit));
        assert_eq!(event.limit_price, Some(1985.23));
        assert_eq!(event.stop_price, Some(1990.00));
        assert_eq!(event.expiration_ms, Some(1_700_000_000_000));
    }

    #[test]
    fn test_numbers_accepted_as_strings() {
        let value = json!({
            "event_type": "OPEN",
            "ticket": "1001",
            "symbol": "EURUSD",
            "volume": "0.10"
        });
        let event = TradeEvent::from_json(&value).unwrap();
        assert_eq!(event.ticket, 1001);
        assert_eq!(event.volume, Some(0.10));
    }

    #[test]
    fn test_unknown_event_type_is_rejected() {
        let value = json!({ "event_type": "TELEPORT", "ticket": 1 });
        let err = TradeEvent::from_json(&value).unwrap_err();
        assert_eq!(err, NormalizeError::UnknownEventType("TELEPORT".to_string()));
    }

    #[test]
    fn test_missing_event_type() {
        let value = json!({ "ticket": 1 });
        assert_eq!(
            TradeEvent::from_json(&value).unwrap_err(),
            NormalizeError::MissingEventType
        );
    }

    #[test]
    fn test_non_object_body() {
        let value = json!([1, 2, 3]);
        assert_eq!(
            TradeEvent::from_json(&value).unwrap_err(),
            NormalizeError::NotAnObject
        );
    }
}
