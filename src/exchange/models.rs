use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{OrderStatus, OrderType, Side};

#[derive(Debug, Clone, Serialize)]
pub struct PlaceOrderRequest {
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    pub quantity: Decimal,
}

/// Order object as the venue reports it. Unknown fields are kept in
/// `extra` so the raw payload we persist survives venue schema additions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderState {
    #[serde(default)]
    pub order_id: Option<String>,
    pub client_order_id: String,
    pub status: String,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub quantity: Option<Decimal>,
    #[serde(default)]
    pub executed_quantity: Decimal,
    #[serde(default)]
    pub cumulative_quote_quantity: Decimal,
    #[serde(default)]
    pub updated_at_ms: Option<i64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelAck {
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VenueFill {
    pub trade_id: String,
    #[serde(default)]
    pub order_id: Option<String>,
    pub price: Decimal,
    pub quantity: Decimal,
    #[serde(default)]
    pub fee_asset: Option<String>,
    #[serde(default)]
    pub fee_quantity: Option<Decimal>,
    pub traded_at_ms: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last: Decimal,
    #[serde(default)]
    pub bid: Option<Decimal>,
    #[serde(default)]
    pub ask: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VenueBalance {
    pub asset: String,
    pub total: Decimal,
    #[serde(default)]
    pub available: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VenueTransaction {
    pub tx_id: String,
    pub kind: String,
    pub asset: String,
    /// Signed from the account's point of view: inflows positive,
    /// outflows negative.
    pub amount: Decimal,
    pub occurred_at_ms: i64,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransactionPage {
    pub items: Vec<VenueTransaction>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferAck {
    pub transfer_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerTime {
    pub server_time_ms: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VenueErrorBody {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// Map the venue's order-status vocabulary onto ours. Unknown values
/// return None; callers log and leave the stored row untouched.
pub fn map_order_status(venue_status: &str) -> Option<OrderStatus> {
    match venue_status {
        "open" | "new" => Some(OrderStatus::Submitted),
        "partially_filled" => Some(OrderStatus::PartiallyFilled),
        "filled" => Some(OrderStatus::Filled),
        "canceled" | "cancelled" | "expired" => Some(OrderStatus::Cancelled),
        "rejected" => Some(OrderStatus::Error),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxClass {
    Deposit,
    Withdrawal,
    TransferIn,
    TransferOut,
    Conversion,
}

/// Venue transaction kinds we understand. Anything else is skipped with
/// a warning so an unexpected venue addition cannot corrupt ledgers.
pub fn classify_transaction(kind: &str) -> Option<TxClass> {
    match kind {
        "deposit" => Some(TxClass::Deposit),
        "withdrawal" => Some(TxClass::Withdrawal),
        "transfer_in" => Some(TxClass::TransferIn),
        "transfer_out" => Some(TxClass::TransferOut),
        "conversion" => Some(TxClass::Conversion),
        _ => None,
    }
}
