use chrono::{DateTime, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Side> {
        match s {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Limit,
    Market,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "limit",
            OrderType::Market => "market",
        }
    }

    pub fn parse(s: &str) -> Option<OrderType> {
        match s {
            "limit" => Some(OrderType::Limit),
            "market" => Some(OrderType::Market),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Pending,
    Executed,
    Error,
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::Pending => "pending",
            IntentStatus::Executed => "executed",
            IntentStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<IntentStatus> {
        match s {
            "pending" => Some(IntentStatus::Pending),
            "executed" => Some(IntentStatus::Executed),
            "error" => Some(IntentStatus::Error),
            _ => None,
        }
    }
}

/// Lifecycle of an order on the venue as we track it locally.
///
/// `CancelledForMarket` marks a limit order we cancelled ourselves to
/// re-submit the remainder as a market order, as opposed to a plain
/// venue-side cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Submitted,
    PartiallyFilled,
    Filled,
    Cancelled,
    CancelledForMarket,
    Error,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Submitted => "submitted",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::CancelledForMarket => "cancelled_for_market",
            OrderStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<OrderStatus> {
        match s {
            "submitted" => Some(OrderStatus::Submitted),
            "partially_filled" => Some(OrderStatus::PartiallyFilled),
            "filled" => Some(OrderStatus::Filled),
            "cancelled" => Some(OrderStatus::Cancelled),
            "cancelled_for_market" => Some(OrderStatus::CancelledForMarket),
            "error" => Some(OrderStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Submitted | OrderStatus::PartiallyFilled)
    }

    /// Ordering used to arbitrate between poll and push updates racing
    /// each other. Filled outranks a cancel: a late fill report means
    /// money moved, and that must never be un-recorded.
    fn rank(&self) -> u8 {
        match self {
            OrderStatus::Submitted => 0,
            OrderStatus::PartiallyFilled => 1,
            OrderStatus::Cancelled | OrderStatus::CancelledForMarket | OrderStatus::Error => 2,
            OrderStatus::Filled => 3,
        }
    }

    /// Whether a stored status may be overwritten by `incoming`.
    /// Non-terminal rows accept same-rank refreshes (executed quantity
    /// creeping up on a partial fill); terminal rows only yield to a
    /// strictly higher rank.
    pub fn admits(&self, incoming: OrderStatus) -> bool {
        if self.is_terminal() {
            incoming.rank() > self.rank()
        } else {
            incoming.rank() >= self.rank()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundingKind {
    Deposit,
    Withdrawal,
}

impl FundingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FundingKind::Deposit => "deposit",
            FundingKind::Withdrawal => "withdrawal",
        }
    }

    pub fn parse(s: &str) -> Option<FundingKind> {
        match s {
            "deposit" => Some(FundingKind::Deposit),
            "withdrawal" => Some(FundingKind::Withdrawal),
            _ => None,
        }
    }
}

/// Where a funding event came from. Platform fees apply to `Manual` and
/// `Sync` deposits; `Reconciliation` events are corrective entries posted
/// at face value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundingSource {
    Manual,
    Sync,
    Reconciliation,
}

impl FundingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            FundingSource::Manual => "manual",
            FundingSource::Sync => "sync",
            FundingSource::Reconciliation => "reconciliation",
        }
    }

    pub fn parse(s: &str) -> Option<FundingSource> {
        match s {
            "manual" => Some(FundingSource::Manual),
            "sync" => Some(FundingSource::Sync),
            "reconciliation" => Some(FundingSource::Reconciliation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    Buy,
    Sell,
    Topup,
    Withdrawal,
}

impl LedgerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerKind::Buy => "buy",
            LedgerKind::Sell => "sell",
            LedgerKind::Topup => "topup",
            LedgerKind::Withdrawal => "withdrawal",
        }
    }

    pub fn parse(s: &str) -> Option<LedgerKind> {
        match s {
            "buy" => Some(LedgerKind::Buy),
            "sell" => Some(LedgerKind::Sell),
            "topup" => Some(LedgerKind::Topup),
            "withdrawal" => Some(LedgerKind::Withdrawal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warn,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Severity> {
        match s {
            "info" => Some(Severity::Info),
            "warn" => Some(Severity::Warn),
            "error" => Some(Severity::Error),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

/// Which channel produced an order update; picks the poll or push
/// freshness timestamp on the order row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    Poll,
    Push,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub org_id: String,
    pub venue_subaccount: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub id: String,
    pub org_id: String,
    pub customer_id: String,
    pub side: Side,
    /// Exactly one of `quantity` (base units) and `notional` (quote units)
    /// is set; a notional is converted to base units at submission time.
    pub quantity: Option<Decimal>,
    pub notional: Option<Decimal>,
    pub limit_price: Option<Decimal>,
    pub trade_date: NaiveDate,
    pub status: IntentStatus,
    pub idempotency_key: String,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub id: String,
    pub org_id: String,
    pub intent_id: String,
    pub customer_id: String,
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    /// Set on fallback market legs: the limit order this one replaces.
    pub replaces_order_id: Option<String>,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub quantity: Decimal,
    pub executed_qty: Decimal,
    pub cumulative_quote_qty: Decimal,
    pub status: OrderStatus,
    pub requires_polling: bool,
    pub submitted_at_ms: i64,
    pub last_polled_at_ms: Option<i64>,
    pub ws_monitored_at_ms: Option<i64>,
    pub raw_payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct NewExchangeOrder {
    pub id: String,
    pub org_id: String,
    pub intent_id: String,
    pub customer_id: String,
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub replaces_order_id: Option<String>,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub quantity: Decimal,
    pub status: OrderStatus,
    pub submitted_at_ms: i64,
    pub raw_payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub id: i64,
    pub org_id: String,
    pub order_id: String,
    pub venue_trade_id: String,
    pub traded_at_ms: i64,
    pub price: Decimal,
    pub quantity: Decimal,
    pub fee_asset: Option<String>,
    pub fee_quantity: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct NewFill {
    pub order_id: String,
    pub venue_trade_id: String,
    pub traded_at_ms: i64,
    pub price: Decimal,
    pub quantity: Decimal,
    pub fee_asset: Option<String>,
    pub fee_quantity: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingEvent {
    pub id: String,
    pub org_id: String,
    pub customer_id: String,
    pub kind: FundingKind,
    pub asset: String,
    /// Signed: positive for deposits, negative for withdrawals.
    pub amount: Decimal,
    pub occurred_at_ms: i64,
    pub idempotency_key: String,
    pub source: FundingSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerLine {
    pub id: i64,
    pub org_id: String,
    pub customer_id: String,
    pub trade_date: NaiveDate,
    pub kind: LedgerKind,
    /// Gross movement. The net effect on a balance is amount minus fee.
    pub amount_base: Decimal,
    pub amount_quote: Decimal,
    pub fee_base: Decimal,
    pub fee_quote: Decimal,
    pub ref_fill_id: Option<i64>,
    pub ref_funding_id: Option<String>,
    pub note: Option<String>,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct NewLedgerLine {
    pub org_id: String,
    pub customer_id: String,
    pub trade_date: NaiveDate,
    pub kind: LedgerKind,
    pub amount_base: Decimal,
    pub amount_quote: Decimal,
    pub fee_base: Decimal,
    pub fee_quote: Decimal,
    pub ref_fill_id: Option<i64>,
    pub ref_funding_id: Option<String>,
    pub note: Option<String>,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyBalance {
    pub org_id: String,
    pub customer_id: String,
    pub date: NaiveDate,
    pub base_balance: Decimal,
    pub quote_balance: Decimal,
    pub nav: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeTransferStatus {
    Pending,
    Done,
}

impl FeeTransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeeTransferStatus::Pending => "pending",
            FeeTransferStatus::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<FeeTransferStatus> {
        match s {
            "pending" => Some(FeeTransferStatus::Pending),
            "done" => Some(FeeTransferStatus::Done),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeTransfer {
    pub id: String,
    pub org_id: String,
    pub customer_id: String,
    pub asset: String,
    pub amount: Decimal,
    pub venue_transfer_id: Option<String>,
    pub status: FeeTransferStatus,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: i64,
    pub org_id: String,
    pub customer_id: Option<String>,
    pub component: String,
    pub severity: Severity,
    pub message: String,
    pub context_json: Option<serde_json::Value>,
    pub created_at_ms: i64,
    pub resolved_at_ms: Option<i64>,
}

/// UTC calendar date of an epoch-millisecond timestamp. Ledger lines and
/// daily balances are keyed on this.
pub fn utc_date_from_ms(ms: i64) -> NaiveDate {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.date_naive())
        .unwrap_or(NaiveDate::MIN)
}
