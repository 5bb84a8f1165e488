//! Narrowed Open API message contracts.
//!
//! Only the requests, responses and push events the replication core uses are
//! modeled here, with named fields instead of raw protobuf accessors. Every
//! type is serde round-trippable so frames can travel the MessagePack wire.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    /// Parse an upstream side string ("BUY"/"SELL", case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" | "LONG" => Some(TradeSide::Buy),
            "SELL" | "SHORT" => Some(TradeSide::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    GoodTillCancel,
    GoodTillDate,
    ImmediateOrCancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionType {
    Accepted,
    Filled,
    PartialFill,
    Replaced,
    Cancelled,
    Expired,
    Rejected,
}

/// Per-instrument specification as delivered by the symbols-list response.
///
/// Volume fields are in the broker's native integral unit (hundredths of a
/// unit). Any field beyond id/name may be absent on some feeds, so the
/// quantization helpers treat them as optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolSpec {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub lot_size: Option<i64>,
    #[serde(default)]
    pub min_volume: Option<i64>,
    #[serde(default)]
    pub step_volume: Option<i64>,
    #[serde(default)]
    pub max_volume: Option<i64>,
    #[serde(default)]
    pub digits: Option<u32>,
    #[serde(default)]
    pub pip_position: Option<i32>,
    #[serde(default)]
    pub tick_value: Option<f64>,
}

impl SymbolSpec {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            lot_size: None,
            min_volume: None,
            step_volume: None,
            max_volume: None,
            digits: None,
            pip_position: None,
            tick_value: None,
        }
    }
}

/// Immutable order/position attributes assigned at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeData {
    pub symbol_id: i64,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub volume: Option<i64>,
    #[serde(default)]
    pub side: Option<TradeSide>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub position_id: i64,
    pub trade_data: TradeData,
    /// Current (possibly partially closed) volume.
    #[serde(default)]
    pub volume: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub order_id: i64,
    pub trade_data: TradeData,
    #[serde(default)]
    pub order_type: Option<OrderType>,
    /// Position this order created or affected, when the broker reports one.
    #[serde(default)]
    pub position_id: Option<i64>,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationAuthReq {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountAuthReq {
    pub account_id: i64,
    pub access_token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolsListReq {
    pub account_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolByIdReq {
    pub account_id: i64,
    pub symbol_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOrderReq {
    pub account_id: i64,
    pub symbol_id: i64,
    pub order_type: OrderType,
    pub side: TradeSide,
    /// Volume in hundredths of units.
    pub volume: i64,
    #[serde(default)]
    pub limit_price: Option<f64>,
    #[serde(default)]
    pub stop_price: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub time_in_force: Option<TimeInForce>,
    /// Epoch milliseconds; only meaningful with `TimeInForce::GoodTillDate`.
    #[serde(default)]
    pub expiration_ms: Option<i64>,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmendPositionSltpReq {
    pub account_id: i64,
    pub position_id: i64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosePositionReq {
    pub account_id: i64,
    pub position_id: i64,
    /// Volume to close, in hundredths of units.
    pub volume: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelOrderReq {
    pub account_id: i64,
    pub order_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReq {
    pub account_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraderReq {
    pub account_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    ApplicationAuth(ApplicationAuthReq),
    AccountAuth(AccountAuthReq),
    SymbolsList(SymbolsListReq),
    SymbolById(SymbolByIdReq),
    NewOrder(NewOrderReq),
    AmendPositionSltp(AmendPositionSltpReq),
    ClosePosition(ClosePositionReq),
    CancelOrder(CancelOrderReq),
    Reconcile(ReconcileReq),
    Trader(TraderReq),
}

impl Request {
    /// Everything except application auth acts on a specific trading account.
    pub fn requires_account_auth(&self) -> bool {
        !matches!(self, Request::ApplicationAuth(_))
    }
}

// ---------------------------------------------------------------------------
// Responses and push events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileSnapshot {
    pub positions: Vec<PositionSnapshot>,
    pub orders: Vec<OrderSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraderSnapshot {
    /// Account balance in hundredths of the deposit currency.
    pub balance_cents: i64,
    /// Account equity in hundredths of the deposit currency.
    pub equity_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub execution_type: ExecutionType,
    #[serde(default)]
    pub order: Option<OrderSnapshot>,
    #[serde(default)]
    pub position: Option<PositionSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotEvent {
    pub symbol_id: i64,
    #[serde(default)]
    pub bid: Option<f64>,
    #[serde(default)]
    pub ask: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    ApplicationAuth,
    AccountAuth { account_id: i64 },
    Symbols { symbols: Vec<SymbolSpec> },
    /// Immediate acknowledgement for order/amend/close/cancel requests; the
    /// definitive fill arrives later as a push `ExecutionEvent`.
    Execution(ExecutionEvent),
    Reconcile(ReconcileSnapshot),
    Trader(TraderSnapshot),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PushEvent {
    Execution(ExecutionEvent),
    Spot(SpotEvent),
    TraderUpdated(TraderSnapshot),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRes {
    pub code: String,
    pub description: String,
}

// ---------------------------------------------------------------------------
// Wire frame
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Heartbeat,
    Request(Request),
    Response(Response),
    Event(PushEvent),
    /// Request-scoped when the frame carries a `msg_id`, connection-scoped
    /// otherwise.
    Error(ErrorRes),
}

/// One wire message. Responses echo the `msg_id` of the request they answer;
/// push events carry none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default)]
    pub msg_id: Option<String>,
    pub payload: Payload,
}

impl Frame {
    pub fn request(msg_id: String, request: Request) -> Self {
        Self {
            msg_id: Some(msg_id),
            payload: Payload::Request(request),
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            msg_id: None,
            payload: Payload::Heartbeat,
        }
    }

    pub fn event(event: PushEvent) -> Self {
        Self {
            msg_id: None,
            payload: Payload::Event(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trade_side_parse() {
        assert_eq!(TradeSide::parse("buy"), Some(TradeSide::Buy));
        assert_eq!(TradeSide::parse("SELL"), Some(TradeSide::Sell));
        assert_eq!(TradeSide::parse("LONG"), Some(TradeSide::Buy));
        assert_eq!(TradeSide::parse("hold"), None);
    }

    #[test]
    fn test_request_account_scope() {
        let app = Request::ApplicationAuth(ApplicationAuthReq {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
        });
        assert!(!app.requires_account_auth());

        let reconcile = Request::Reconcile(ReconcileReq { account_id: 7 });
        assert!(reconcile.requires_account_auth());
    }

    #[test]
    fn test_frame_roundtrip_msgpack() {
        let frame = Frame::request(
            "abc-123".to_string(),
            Request::NewOrder(NewOrderReq {
                account_id: 1,
                symbol_id: 2,
                order_type: OrderType::Market,
                side: TradeSide::Buy,
                volume: 1_000_000,
                limit_price: None,
                stop_price: None,
                stop_loss: None,
                take_profit: None,
                time_in_force: None,
                expiration_ms: None,
                label: Some("SRC_1001".to_string()),
            }),
        );

        let bytes = rmp_serde::to_vec_named(&frame).unwrap();
        let decoded: Frame = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_push_event_frame_has_no_msg_id() {
        let frame = Frame::event(PushEvent::Spot(SpotEvent {
            symbol_id: 1,
            bid: Some(1.07),
            ask: Some(1.0702),
        }));
        assert!(frame.msg_id.is_none());
    }
}
