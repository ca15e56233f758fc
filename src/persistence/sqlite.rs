use anyhow::{Context, Result};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::str::FromStr;
use tokio_rusqlite::Connection;

use crate::types::{
    AlertEvent, Customer, DailyBalance, ExchangeOrder, FeeTransfer, FeeTransferStatus, Fill,
    FundingEvent, FundingKind, FundingSource, IntentStatus, LedgerKind, LedgerLine,
    NewExchangeOrder, NewFill, NewLedgerLine, OrderIntent, OrderStatus, OrderType, Severity, Side,
    UpdateSource,
};

type CallResult<T> = std::result::Result<T, tokio_rusqlite::Error>;

#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
}

/// Canonical TEXT form for stored decimals. Trailing zeros are stripped
/// so equality comparisons against re-derived values hold.
fn dec_str(d: Decimal) -> String {
    d.normalize().to_string()
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[derive(Debug)]
struct BadColumn(String);

impl std::fmt::Display for BadColumn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BadColumn {}

fn bad_col(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(BadColumn(msg)),
    )
}

fn get_dec(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let s: String = row.get(idx)?;
    Decimal::from_str(&s).map_err(|e| bad_col(idx, format!("bad decimal {s:?}: {e}")))
}

fn get_dec_opt(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| Decimal::from_str(&s).map_err(|e| bad_col(idx, format!("bad decimal {s:?}: {e}"))))
        .transpose()
}

fn get_date(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let s: String = row.get(idx)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|e| bad_col(idx, format!("bad date {s:?}: {e}")))
}

fn get_json_opt(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<serde_json::Value>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| {
        serde_json::from_str(&s).map_err(|e| bad_col(idx, format!("bad json payload: {e}")))
    })
    .transpose()
}

const ORDER_COLS: &str = "id, org_id, intent_id, customer_id, client_order_id, exchange_order_id, \
     replaces_order_id, side, order_type, price, quantity, executed_qty, cumulative_quote_qty, \
     status, requires_polling, submitted_at_ms, last_polled_at_ms, ws_monitored_at_ms, raw_payload";

fn order_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExchangeOrder> {
    let side: String = row.get(7)?;
    let order_type: String = row.get(8)?;
    let status: String = row.get(13)?;
    Ok(ExchangeOrder {
        id: row.get(0)?,
        org_id: row.get(1)?,
        intent_id: row.get(2)?,
        customer_id: row.get(3)?,
        client_order_id: row.get(4)?,
        exchange_order_id: row.get(5)?,
        replaces_order_id: row.get(6)?,
        side: Side::parse(&side).ok_or_else(|| bad_col(7, format!("bad side {side:?}")))?,
        order_type: OrderType::parse(&order_type)
            .ok_or_else(|| bad_col(8, format!("bad order type {order_type:?}")))?,
        price: get_dec_opt(row, 9)?,
        quantity: get_dec(row, 10)?,
        executed_qty: get_dec(row, 11)?,
        cumulative_quote_qty: get_dec(row, 12)?,
        status: OrderStatus::parse(&status)
            .ok_or_else(|| bad_col(13, format!("bad order status {status:?}")))?,
        requires_polling: row.get::<_, i64>(14)? != 0,
        submitted_at_ms: row.get(15)?,
        last_polled_at_ms: row.get(16)?,
        ws_monitored_at_ms: row.get(17)?,
        raw_payload: get_json_opt(row, 18)?,
    })
}

const INTENT_COLS: &str = "id, org_id, customer_id, side, quantity, notional, limit_price, \
     trade_date, status, idempotency_key, created_at_ms";

fn intent_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OrderIntent> {
    let side: String = row.get(3)?;
    let status: String = row.get(8)?;
    Ok(OrderIntent {
        id: row.get(0)?,
        org_id: row.get(1)?,
        customer_id: row.get(2)?,
        side: Side::parse(&side).ok_or_else(|| bad_col(3, format!("bad side {side:?}")))?,
        quantity: get_dec_opt(row, 4)?,
        notional: get_dec_opt(row, 5)?,
        limit_price: get_dec_opt(row, 6)?,
        trade_date: get_date(row, 7)?,
        status: IntentStatus::parse(&status)
            .ok_or_else(|| bad_col(8, format!("bad intent status {status:?}")))?,
        idempotency_key: row.get(9)?,
        created_at_ms: row.get(10)?,
    })
}

const FILL_COLS: &str =
    "id, org_id, order_id, venue_trade_id, traded_at_ms, price, quantity, fee_asset, fee_quantity";

fn fill_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Fill> {
    Ok(Fill {
        id: row.get(0)?,
        org_id: row.get(1)?,
        order_id: row.get(2)?,
        venue_trade_id: row.get(3)?,
        traded_at_ms: row.get(4)?,
        price: get_dec(row, 5)?,
        quantity: get_dec(row, 6)?,
        fee_asset: row.get(7)?,
        fee_quantity: get_dec_opt(row, 8)?,
    })
}

const FUNDING_COLS: &str =
    "id, org_id, customer_id, kind, asset, amount, occurred_at_ms, idempotency_key, source";

fn funding_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FundingEvent> {
    let kind: String = row.get(3)?;
    let source: String = row.get(8)?;
    Ok(FundingEvent {
        id: row.get(0)?,
        org_id: row.get(1)?,
        customer_id: row.get(2)?,
        kind: FundingKind::parse(&kind)
            .ok_or_else(|| bad_col(3, format!("bad funding kind {kind:?}")))?,
        asset: row.get(4)?,
        amount: get_dec(row, 5)?,
        occurred_at_ms: row.get(6)?,
        idempotency_key: row.get(7)?,
        source: FundingSource::parse(&source)
            .ok_or_else(|| bad_col(8, format!("bad funding source {source:?}")))?,
    })
}

const LEDGER_COLS: &str = "id, org_id, customer_id, trade_date, kind, amount_base, amount_quote, \
     fee_base, fee_quote, ref_fill_id, ref_funding_id, note, created_at_ms";

fn ledger_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerLine> {
    let kind: String = row.get(4)?;
    Ok(LedgerLine {
        id: row.get(0)?,
        org_id: row.get(1)?,
        customer_id: row.get(2)?,
        trade_date: get_date(row, 3)?,
        kind: LedgerKind::parse(&kind)
            .ok_or_else(|| bad_col(4, format!("bad ledger kind {kind:?}")))?,
        amount_base: get_dec(row, 5)?,
        amount_quote: get_dec(row, 6)?,
        fee_base: get_dec(row, 7)?,
        fee_quote: get_dec(row, 8)?,
        ref_fill_id: row.get(9)?,
        ref_funding_id: row.get(10)?,
        note: row.get(11)?,
        created_at_ms: row.get(12)?,
    })
}

const TRANSFER_COLS: &str =
    "id, org_id, customer_id, asset, amount, venue_transfer_id, status, created_at_ms";

fn transfer_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FeeTransfer> {
    let status: String = row.get(6)?;
    Ok(FeeTransfer {
        id: row.get(0)?,
        org_id: row.get(1)?,
        customer_id: row.get(2)?,
        asset: row.get(3)?,
        amount: get_dec(row, 4)?,
        venue_transfer_id: row.get(5)?,
        status: FeeTransferStatus::parse(&status)
            .ok_or_else(|| bad_col(6, format!("bad transfer status {status:?}")))?,
        created_at_ms: row.get(7)?,
    })
}

const ALERT_COLS: &str = "id, org_id, customer_id, component, severity, message, context_json, \
     created_at_ms, resolved_at_ms";

fn alert_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AlertEvent> {
    let severity: String = row.get(4)?;
    Ok(AlertEvent {
        id: row.get(0)?,
        org_id: row.get(1)?,
        customer_id: row.get(2)?,
        component: row.get(3)?,
        severity: Severity::parse(&severity)
            .ok_or_else(|| bad_col(4, format!("bad severity {severity:?}")))?,
        message: row.get(5)?,
        context_json: get_json_opt(row, 6)?,
        created_at_ms: row.get(7)?,
        resolved_at_ms: row.get(8)?,
    })
}

fn customer_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Customer> {
    Ok(Customer {
        id: row.get(0)?,
        org_id: row.get(1)?,
        venue_subaccount: row.get(2)?,
        active: row.get::<_, i64>(3)? != 0,
    })
}

fn balance_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DailyBalance> {
    Ok(DailyBalance {
        org_id: row.get(0)?,
        customer_id: row.get(1)?,
        date: get_date(row, 2)?,
        base_balance: get_dec(row, 3)?,
        quote_balance: get_dec(row, 4)?,
        nav: get_dec(row, 5)?,
    })
}

/// Arguments for a single observed order state, from either channel.
pub struct OrderUpdateArgs {
    pub order_id: String,
    pub incoming: OrderStatus,
    pub executed_qty: Decimal,
    pub cumulative_quote_qty: Decimal,
    pub exchange_order_id: Option<String>,
    pub raw: serde_json::Value,
    pub fills: Vec<NewFill>,
    pub source: UpdateSource,
    pub now_ms: i64,
}

pub struct OrderUpdateOutcome {
    /// Whether the status column moved. Fills are recorded either way.
    pub applied: bool,
    /// Stored status after the call.
    pub status: OrderStatus,
    pub new_fills: Vec<Fill>,
}

/// One customer's pending daily-balance rebuild: everything from
/// `dirty_from` onward needs re-rolling. `gen` changes on every ledger
/// write, so a clear with a stale `gen` is a no-op.
#[derive(Debug, Clone)]
pub struct RollMark {
    pub customer_id: String,
    pub dirty_from: NaiveDate,
    pub gen: i64,
}

impl SqliteStore {
    pub async fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path).await.context("open sqlite")?;
        Ok(Self { conn })
    }

    pub async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|c| -> CallResult<()> {
                c.execute_batch(
                    r#"
PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;

CREATE TABLE IF NOT EXISTS customers (
  id TEXT PRIMARY KEY,
  org_id TEXT NOT NULL,
  venue_subaccount TEXT,
  active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS order_intents (
  id TEXT PRIMARY KEY,
  org_id TEXT NOT NULL,
  customer_id TEXT NOT NULL,
  side TEXT NOT NULL,
  quantity TEXT,
  notional TEXT,
  limit_price TEXT,
  trade_date TEXT NOT NULL,
  status TEXT NOT NULL,
  idempotency_key TEXT NOT NULL UNIQUE,
  created_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_intents_status ON order_intents(status, created_at_ms);

CREATE TABLE IF NOT EXISTS exchange_orders (
  id TEXT PRIMARY KEY,
  org_id TEXT NOT NULL,
  intent_id TEXT NOT NULL,
  customer_id TEXT NOT NULL,
  client_order_id TEXT NOT NULL UNIQUE,
  exchange_order_id TEXT UNIQUE,
  replaces_order_id TEXT,
  side TEXT NOT NULL,
  order_type TEXT NOT NULL,
  price TEXT,
  quantity TEXT NOT NULL,
  executed_qty TEXT NOT NULL DEFAULT '0',
  cumulative_quote_qty TEXT NOT NULL DEFAULT '0',
  status TEXT NOT NULL,
  requires_polling INTEGER NOT NULL DEFAULT 1,
  fallback_done INTEGER NOT NULL DEFAULT 0,
  submitted_at_ms INTEGER NOT NULL,
  last_polled_at_ms INTEGER,
  ws_monitored_at_ms INTEGER,
  raw_payload TEXT
);
CREATE INDEX IF NOT EXISTS idx_orders_open ON exchange_orders(status, requires_polling);
CREATE INDEX IF NOT EXISTS idx_orders_intent ON exchange_orders(intent_id);

CREATE TABLE IF NOT EXISTS fills (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  org_id TEXT NOT NULL,
  order_id TEXT NOT NULL,
  venue_trade_id TEXT NOT NULL UNIQUE,
  traded_at_ms INTEGER NOT NULL,
  price TEXT NOT NULL,
  quantity TEXT NOT NULL,
  fee_asset TEXT,
  fee_quantity TEXT
);
CREATE INDEX IF NOT EXISTS idx_fills_order ON fills(order_id);

CREATE TABLE IF NOT EXISTS funding_events (
  id TEXT PRIMARY KEY,
  org_id TEXT NOT NULL,
  customer_id TEXT NOT NULL,
  kind TEXT NOT NULL,
  asset TEXT NOT NULL,
  amount TEXT NOT NULL,
  occurred_at_ms INTEGER NOT NULL,
  idempotency_key TEXT NOT NULL UNIQUE,
  source TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ledger_lines (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  org_id TEXT NOT NULL,
  customer_id TEXT NOT NULL,
  trade_date TEXT NOT NULL,
  kind TEXT NOT NULL,
  amount_base TEXT NOT NULL DEFAULT '0',
  amount_quote TEXT NOT NULL DEFAULT '0',
  fee_base TEXT NOT NULL DEFAULT '0',
  fee_quote TEXT NOT NULL DEFAULT '0',
  ref_fill_id INTEGER UNIQUE,
  ref_funding_id TEXT UNIQUE,
  note TEXT,
  created_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ledger_customer_date ON ledger_lines(customer_id, trade_date);

CREATE TABLE IF NOT EXISTS daily_balances (
  org_id TEXT NOT NULL,
  customer_id TEXT NOT NULL,
  date TEXT NOT NULL,
  base_balance TEXT NOT NULL,
  quote_balance TEXT NOT NULL,
  nav TEXT NOT NULL,
  PRIMARY KEY (org_id, customer_id, date)
);

CREATE TABLE IF NOT EXISTS alert_events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  org_id TEXT NOT NULL,
  customer_id TEXT,
  component TEXT NOT NULL,
  severity TEXT NOT NULL,
  message TEXT NOT NULL,
  context_json TEXT,
  created_at_ms INTEGER NOT NULL,
  resolved_at_ms INTEGER
);

CREATE TABLE IF NOT EXISTS fee_transfers (
  id TEXT PRIMARY KEY,
  org_id TEXT NOT NULL,
  customer_id TEXT NOT NULL,
  asset TEXT NOT NULL,
  amount TEXT NOT NULL,
  venue_transfer_id TEXT,
  status TEXT NOT NULL,
  created_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS roll_marks (
  org_id TEXT NOT NULL,
  customer_id TEXT NOT NULL,
  dirty_from TEXT NOT NULL,
  gen INTEGER NOT NULL,
  PRIMARY KEY (org_id, customer_id)
);

CREATE TABLE IF NOT EXISTS recon_cursors (
  org_id TEXT NOT NULL,
  customer_id TEXT NOT NULL,
  last_seen_ms INTEGER NOT NULL,
  PRIMARY KEY (org_id, customer_id)
);

CREATE TABLE IF NOT EXISTS price_marks (
  symbol TEXT NOT NULL,
  date TEXT NOT NULL,
  price TEXT NOT NULL,
  PRIMARY KEY (symbol, date)
);
"#,
                )?;
                Ok(())
            })
            .await
            .context("init schema")
    }

    // ---- customers ----

    pub async fn upsert_customer(&self, customer: &Customer) -> Result<()> {
        let cu = customer.clone();
        self.conn
            .call(move |c| -> CallResult<()> {
                c.execute(
                    r#"
INSERT INTO customers (id, org_id, venue_subaccount, active)
VALUES (?1, ?2, ?3, ?4)
ON CONFLICT(id) DO UPDATE SET
  org_id=excluded.org_id,
  venue_subaccount=excluded.venue_subaccount,
  active=excluded.active
"#,
                    params![cu.id, cu.org_id, cu.venue_subaccount, cu.active as i64],
                )?;
                Ok(())
            })
            .await
            .context("upsert customer")
    }

    pub async fn customer(&self, id: &str) -> Result<Option<Customer>> {
        let id = id.to_string();
        self.conn
            .call(move |c| -> CallResult<Option<Customer>> {
                let row = c
                    .query_row(
                        "SELECT id, org_id, venue_subaccount, active FROM customers WHERE id=?1",
                        params![id],
                        customer_from_row,
                    )
                    .optional()?;
                Ok(row)
            })
            .await
            .context("load customer")
    }

    pub async fn active_customers(&self) -> Result<Vec<Customer>> {
        self.conn
            .call(|c| -> CallResult<Vec<Customer>> {
                let mut stmt = c.prepare(
                    "SELECT id, org_id, venue_subaccount, active FROM customers WHERE active=1 ORDER BY id",
                )?;
                let rows = stmt.query_map([], customer_from_row)?;
                let mut out = Vec::new();
                for r in rows {
                    out.push(r?);
                }
                Ok(out)
            })
            .await
            .context("load active customers")
    }

    // ---- order intents ----

    /// Returns false when the idempotency key (or id) already exists.
    pub async fn insert_order_intent(&self, intent: &OrderIntent) -> Result<bool> {
        if intent.quantity.is_some() == intent.notional.is_some() {
            anyhow::bail!(
                "intent {} must set exactly one of quantity and notional",
                intent.id
            );
        }
        let it = intent.clone();
        self.conn
            .call(move |c| -> CallResult<bool> {
                let r = c.execute(
                    &format!("INSERT INTO order_intents ({INTENT_COLS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)"),
                    params![
                        it.id,
                        it.org_id,
                        it.customer_id,
                        it.side.as_str(),
                        it.quantity.map(dec_str),
                        it.notional.map(dec_str),
                        it.limit_price.map(dec_str),
                        it.trade_date.to_string(),
                        it.status.as_str(),
                        it.idempotency_key,
                        it.created_at_ms,
                    ],
                );
                match r {
                    Ok(_) => Ok(true),
                    Err(e) if is_constraint_violation(&e) => Ok(false),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .context("insert order intent")
    }

    pub async fn order_intent(&self, id: &str) -> Result<Option<OrderIntent>> {
        let id = id.to_string();
        self.conn
            .call(move |c| -> CallResult<Option<OrderIntent>> {
                let row = c
                    .query_row(
                        &format!("SELECT {INTENT_COLS} FROM order_intents WHERE id=?1"),
                        params![id],
                        intent_from_row,
                    )
                    .optional()?;
                Ok(row)
            })
            .await
            .context("load order intent")
    }

    pub async fn pending_intents(&self, limit: usize) -> Result<Vec<OrderIntent>> {
        self.conn
            .call(move |c| -> CallResult<Vec<OrderIntent>> {
                let mut stmt = c.prepare(&format!(
                    "SELECT {INTENT_COLS} FROM order_intents WHERE status='pending' ORDER BY created_at_ms ASC LIMIT ?1"
                ))?;
                let rows = stmt.query_map(params![limit as i64], intent_from_row)?;
                let mut out = Vec::new();
                for r in rows {
                    out.push(r?);
                }
                Ok(out)
            })
            .await
            .context("load pending intents")
    }

    pub async fn set_intent_status(&self, id: &str, status: IntentStatus) -> Result<()> {
        let id = id.to_string();
        self.conn
            .call(move |c| -> CallResult<()> {
                c.execute(
                    "UPDATE order_intents SET status=?2 WHERE id=?1",
                    params![id, status.as_str()],
                )?;
                Ok(())
            })
            .await
            .context("set intent status")
    }

    // ---- exchange orders ----

    /// Returns false when the client order id is already taken, which
    /// means a concurrent submitter won the race for this intent.
    pub async fn insert_exchange_order(&self, order: &NewExchangeOrder) -> Result<bool> {
        let o = order.clone();
        self.conn
            .call(move |c| -> CallResult<bool> {
                let raw = o.raw_payload.as_ref().map(|v| v.to_string());
                let r = c.execute(
                    r#"
INSERT INTO exchange_orders
  (id, org_id, intent_id, customer_id, client_order_id, exchange_order_id, replaces_order_id,
   side, order_type, price, quantity, executed_qty, cumulative_quote_qty, status,
   requires_polling, submitted_at_ms, raw_payload)
VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,'0','0',?12,?13,?14,?15)
"#,
                    params![
                        o.id,
                        o.org_id,
                        o.intent_id,
                        o.customer_id,
                        o.client_order_id,
                        o.exchange_order_id,
                        o.replaces_order_id,
                        o.side.as_str(),
                        o.order_type.as_str(),
                        o.price.map(dec_str),
                        dec_str(o.quantity),
                        o.status.as_str(),
                        !o.status.is_terminal() as i64,
                        o.submitted_at_ms,
                        raw,
                    ],
                );
                match r {
                    Ok(_) => Ok(true),
                    Err(e) if is_constraint_violation(&e) => Ok(false),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .context("insert exchange order")
    }

    pub async fn exchange_order(&self, id: &str) -> Result<Option<ExchangeOrder>> {
        let id = id.to_string();
        self.conn
            .call(move |c| -> CallResult<Option<ExchangeOrder>> {
                let row = c
                    .query_row(
                        &format!("SELECT {ORDER_COLS} FROM exchange_orders WHERE id=?1"),
                        params![id],
                        order_from_row,
                    )
                    .optional()?;
                Ok(row)
            })
            .await
            .context("load exchange order")
    }

    pub async fn orders_for_intent(&self, intent_id: &str) -> Result<Vec<ExchangeOrder>> {
        let intent_id = intent_id.to_string();
        self.conn
            .call(move |c| -> CallResult<Vec<ExchangeOrder>> {
                let mut stmt = c.prepare(&format!(
                    "SELECT {ORDER_COLS} FROM exchange_orders WHERE intent_id=?1 ORDER BY submitted_at_ms ASC, id ASC"
                ))?;
                let rows = stmt.query_map(params![intent_id], order_from_row)?;
                let mut out = Vec::new();
                for r in rows {
                    out.push(r?);
                }
                Ok(out)
            })
            .await
            .context("load orders for intent")
    }

    pub async fn non_error_order_for_intent(
        &self,
        intent_id: &str,
    ) -> Result<Option<ExchangeOrder>> {
        let intent_id = intent_id.to_string();
        self.conn
            .call(move |c| -> CallResult<Option<ExchangeOrder>> {
                let row = c
                    .query_row(
                        &format!(
                            "SELECT {ORDER_COLS} FROM exchange_orders \
                             WHERE intent_id=?1 AND status != 'error' \
                             ORDER BY submitted_at_ms ASC LIMIT 1"
                        ),
                        params![intent_id],
                        order_from_row,
                    )
                    .optional()?;
                Ok(row)
            })
            .await
            .context("load order for intent")
    }

    pub async fn chain_len(&self, intent_id: &str) -> Result<i64> {
        let intent_id = intent_id.to_string();
        self.conn
            .call(move |c| -> CallResult<i64> {
                let n: i64 = c.query_row(
                    "SELECT COUNT(*) FROM exchange_orders WHERE intent_id=?1",
                    params![intent_id],
                    |r| r.get(0),
                )?;
                Ok(n)
            })
            .await
            .context("count orders for intent")
    }

    /// Non-terminal orders whose last touch on both channels is older
    /// than the respective grace period.
    pub async fn orders_due_for_poll(
        &self,
        now_ms: i64,
        poll_grace_ms: i64,
        push_grace_ms: i64,
        limit: usize,
    ) -> Result<Vec<ExchangeOrder>> {
        self.conn
            .call(move |c| -> CallResult<Vec<ExchangeOrder>> {
                let mut stmt = c.prepare(&format!(
                    "SELECT {ORDER_COLS} FROM exchange_orders \
                     WHERE requires_polling=1 \
                       AND status IN ('submitted','partially_filled') \
                       AND (last_polled_at_ms IS NULL OR last_polled_at_ms <= ?1) \
                       AND (ws_monitored_at_ms IS NULL OR ws_monitored_at_ms <= ?2) \
                     ORDER BY submitted_at_ms ASC LIMIT ?3"
                ))?;
                let rows = stmt.query_map(
                    params![now_ms - poll_grace_ms, now_ms - push_grace_ms, limit as i64],
                    order_from_row,
                )?;
                let mut out = Vec::new();
                for r in rows {
                    out.push(r?);
                }
                Ok(out)
            })
            .await
            .context("load orders due for poll")
    }

    /// Original limit legs eligible for fallback review: still working,
    /// or cancelled without a successor (an interrupted conversion).
    pub async fn fallback_candidates(&self, limit: usize) -> Result<Vec<ExchangeOrder>> {
        self.conn
            .call(move |c| -> CallResult<Vec<ExchangeOrder>> {
                let mut stmt = c.prepare(&format!(
                    "SELECT {ORDER_COLS} FROM exchange_orders o \
                     WHERE o.replaces_order_id IS NULL \
                       AND o.order_type='limit' \
                       AND o.fallback_done=0 \
                       AND (o.status IN ('submitted','partially_filled') \
                            OR (o.status IN ('cancelled','cancelled_for_market') \
                                AND NOT EXISTS (SELECT 1 FROM exchange_orders s \
                                                WHERE s.replaces_order_id = o.id))) \
                     ORDER BY o.submitted_at_ms ASC LIMIT ?1"
                ))?;
                let rows = stmt.query_map(params![limit as i64], order_from_row)?;
                let mut out = Vec::new();
                for r in rows {
                    out.push(r?);
                }
                Ok(out)
            })
            .await
            .context("load fallback candidates")
    }

    /// Record one observed order state. Fills are always inserted
    /// (deduplicated on venue trade id); the status column only moves
    /// forward per OrderStatus::admits, so a poll arriving after a push
    /// already recorded a terminal state cannot revert it. The whole
    /// update is one transaction.
    pub async fn apply_order_update(&self, args: OrderUpdateArgs) -> Result<OrderUpdateOutcome> {
        self.conn
            .call(move |c| -> CallResult<OrderUpdateOutcome> {
                let tx = c.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let (org_id, current_status, cur_exec, cur_quote, cur_raw): (
                    String,
                    String,
                    String,
                    String,
                    Option<String>,
                ) = tx.query_row(
                    "SELECT org_id, status, executed_qty, cumulative_quote_qty, raw_payload \
                     FROM exchange_orders WHERE id=?1",
                    params![args.order_id],
                    |r| {
                        Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
                    },
                )?;
                let current = OrderStatus::parse(&current_status).ok_or_else(|| {
                    tokio_rusqlite::Error::Other(
                        format!("stored order status {current_status:?} unparseable").into(),
                    )
                })?;

                let mut new_fills = Vec::new();
                for f in &args.fills {
                    let r = tx.execute(
                        "INSERT INTO fills (org_id, order_id, venue_trade_id, traded_at_ms, price, quantity, fee_asset, fee_quantity) \
                         VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                        params![
                            org_id,
                            f.order_id,
                            f.venue_trade_id,
                            f.traded_at_ms,
                            dec_str(f.price),
                            dec_str(f.quantity),
                            f.fee_asset,
                            f.fee_quantity.map(dec_str),
                        ],
                    );
                    match r {
                        Ok(_) => new_fills.push(Fill {
                            id: tx.last_insert_rowid(),
                            org_id: org_id.clone(),
                            order_id: f.order_id.clone(),
                            venue_trade_id: f.venue_trade_id.clone(),
                            traded_at_ms: f.traded_at_ms,
                            price: f.price,
                            quantity: f.quantity,
                            fee_asset: f.fee_asset.clone(),
                            fee_quantity: f.fee_quantity,
                        }),
                        Err(e) if is_constraint_violation(&e) => {}
                        Err(e) => return Err(e.into()),
                    }
                }

                let ts_col = match args.source {
                    UpdateSource::Poll => "last_polled_at_ms",
                    UpdateSource::Push => "ws_monitored_at_ms",
                };

                let applied = current.admits(args.incoming);
                let status = if applied {
                    let cur_exec = Decimal::from_str(&cur_exec).unwrap_or(Decimal::ZERO);
                    let cur_quote = Decimal::from_str(&cur_quote).unwrap_or(Decimal::ZERO);
                    // Cumulative quantities never shrink; a stale snapshot
                    // racing a fresher one must not roll them back.
                    let executed = cur_exec.max(args.executed_qty);
                    let quote = cur_quote.max(args.cumulative_quote_qty);
                    let merged = merge_payload(cur_raw, &args.raw);
                    tx.execute(
                        &format!(
                            "UPDATE exchange_orders SET \
                               status=?2, executed_qty=?3, cumulative_quote_qty=?4, \
                               exchange_order_id=COALESCE(exchange_order_id, ?5), \
                               raw_payload=?6, requires_polling=?7, {ts_col}=?8 \
                             WHERE id=?1"
                        ),
                        params![
                            args.order_id,
                            args.incoming.as_str(),
                            dec_str(executed),
                            dec_str(quote),
                            args.exchange_order_id,
                            merged,
                            !args.incoming.is_terminal() as i64,
                            args.now_ms,
                        ],
                    )?;
                    args.incoming
                } else {
                    tx.execute(
                        &format!("UPDATE exchange_orders SET {ts_col}=?2 WHERE id=?1"),
                        params![args.order_id, args.now_ms],
                    )?;
                    current
                };

                tx.commit()?;
                Ok(OrderUpdateOutcome {
                    applied,
                    status,
                    new_fills,
                })
            })
            .await
            .context("apply order update")
    }

    pub async fn touch_polled(&self, order_id: &str, now_ms: i64) -> Result<()> {
        let order_id = order_id.to_string();
        self.conn
            .call(move |c| -> CallResult<()> {
                c.execute(
                    "UPDATE exchange_orders SET last_polled_at_ms=?2 WHERE id=?1",
                    params![order_id, now_ms],
                )?;
                Ok(())
            })
            .await
            .context("touch polled")
    }

    /// Flag a limit leg as cancelled for conversion. Refused for filled
    /// or errored rows; plain cancelled is accepted so an interrupted
    /// conversion can be resumed.
    pub async fn mark_cancelled_for_market(&self, order_id: &str) -> Result<bool> {
        let order_id = order_id.to_string();
        self.conn
            .call(move |c| -> CallResult<bool> {
                let n = c.execute(
                    "UPDATE exchange_orders SET status='cancelled_for_market', requires_polling=0 \
                     WHERE id=?1 AND status IN ('submitted','partially_filled','cancelled','cancelled_for_market')",
                    params![order_id],
                )?;
                Ok(n > 0)
            })
            .await
            .context("mark cancelled for market")
    }

    /// Take an order out of fallback review for good.
    pub async fn set_fallback_done(&self, order_id: &str) -> Result<()> {
        let order_id = order_id.to_string();
        self.conn
            .call(move |c| -> CallResult<()> {
                c.execute(
                    "UPDATE exchange_orders SET fallback_done=1 WHERE id=?1",
                    params![order_id],
                )?;
                Ok(())
            })
            .await
            .context("set fallback done")
    }

    // ---- fills / funding ----

    pub async fn fills_for_order(&self, order_id: &str) -> Result<Vec<Fill>> {
        let order_id = order_id.to_string();
        self.conn
            .call(move |c| -> CallResult<Vec<Fill>> {
                let mut stmt = c.prepare(&format!(
                    "SELECT {FILL_COLS} FROM fills WHERE order_id=?1 ORDER BY id ASC"
                ))?;
                let rows = stmt.query_map(params![order_id], fill_from_row)?;
                let mut out = Vec::new();
                for r in rows {
                    out.push(r?);
                }
                Ok(out)
            })
            .await
            .context("load fills for order")
    }

    /// Fills with no ledger line yet, oldest first. The monitor settles
    /// fills as it records them; this sweep catches anything lost to a
    /// crash or error in between.
    pub async fn unsettled_fills(&self, limit: usize) -> Result<Vec<Fill>> {
        self.conn
            .call(move |c| -> CallResult<Vec<Fill>> {
                let mut stmt = c.prepare(&format!(
                    "SELECT {FILL_COLS} FROM fills \
                     WHERE NOT EXISTS (SELECT 1 FROM ledger_lines \
                       WHERE ledger_lines.ref_fill_id = fills.id) \
                     ORDER BY id ASC LIMIT ?1"
                ))?;
                let rows = stmt.query_map(params![limit as i64], fill_from_row)?;
                let mut out = Vec::new();
                for r in rows {
                    out.push(r?);
                }
                Ok(out)
            })
            .await
            .context("load unsettled fills")
    }

    /// Returns false when the idempotency key already exists.
    pub async fn insert_funding_event(&self, ev: &FundingEvent) -> Result<bool> {
        let ev = ev.clone();
        self.conn
            .call(move |c| -> CallResult<bool> {
                let r = c.execute(
                    &format!("INSERT INTO funding_events ({FUNDING_COLS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)"),
                    params![
                        ev.id,
                        ev.org_id,
                        ev.customer_id,
                        ev.kind.as_str(),
                        ev.asset,
                        dec_str(ev.amount),
                        ev.occurred_at_ms,
                        ev.idempotency_key,
                        ev.source.as_str(),
                    ],
                );
                match r {
                    Ok(_) => Ok(true),
                    Err(e) if is_constraint_violation(&e) => Ok(false),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .context("insert funding event")
    }

    pub async fn unposted_funding(&self, limit: usize) -> Result<Vec<FundingEvent>> {
        self.conn
            .call(move |c| -> CallResult<Vec<FundingEvent>> {
                let mut stmt = c.prepare(&format!(
                    "SELECT {FUNDING_COLS} FROM funding_events \
                     WHERE NOT EXISTS (SELECT 1 FROM ledger_lines \
                       WHERE ledger_lines.ref_funding_id = funding_events.id) \
                     ORDER BY occurred_at_ms ASC LIMIT ?1"
                ))?;
                let rows = stmt.query_map(params![limit as i64], funding_from_row)?;
                let mut out = Vec::new();
                for r in rows {
                    out.push(r?);
                }
                Ok(out)
            })
            .await
            .context("load unposted funding")
    }

    // ---- ledger ----

    /// Returns false when a line for the referenced fill or funding
    /// event already exists. A successful insert also advances the
    /// customer's roll mark in the same transaction, so the daily
    /// balance rebuild cannot miss the write even across a crash.
    pub async fn insert_ledger_line(&self, line: &NewLedgerLine) -> Result<bool> {
        let l = line.clone();
        self.conn
            .call(move |c| -> CallResult<bool> {
                let tx = c.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let r = tx.execute(
                    r#"
INSERT INTO ledger_lines
  (org_id, customer_id, trade_date, kind, amount_base, amount_quote, fee_base, fee_quote,
   ref_fill_id, ref_funding_id, note, created_at_ms)
VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)
"#,
                    params![
                        l.org_id,
                        l.customer_id,
                        l.trade_date.to_string(),
                        l.kind.as_str(),
                        dec_str(l.amount_base),
                        dec_str(l.amount_quote),
                        dec_str(l.fee_base),
                        dec_str(l.fee_quote),
                        l.ref_fill_id,
                        l.ref_funding_id,
                        l.note,
                        l.created_at_ms,
                    ],
                );
                match r {
                    Ok(_) => {}
                    Err(e) if is_constraint_violation(&e) => return Ok(false),
                    Err(e) => return Err(e.into()),
                }
                tx.execute(
                    r#"
INSERT INTO roll_marks (org_id, customer_id, dirty_from, gen)
VALUES (?1,?2,?3,1)
ON CONFLICT(org_id, customer_id) DO UPDATE SET
  dirty_from=MIN(dirty_from, excluded.dirty_from),
  gen=gen+1
"#,
                    params![l.org_id, l.customer_id, l.trade_date.to_string()],
                )?;
                tx.commit()?;
                Ok(true)
            })
            .await
            .context("insert ledger line")
    }

    pub async fn ledger_lines_for_date(
        &self,
        customer_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<LedgerLine>> {
        let customer_id = customer_id.to_string();
        let date = date.to_string();
        self.conn
            .call(move |c| -> CallResult<Vec<LedgerLine>> {
                let mut stmt = c.prepare(&format!(
                    "SELECT {LEDGER_COLS} FROM ledger_lines \
                     WHERE customer_id=?1 AND trade_date=?2 ORDER BY id ASC"
                ))?;
                let rows = stmt.query_map(params![customer_id, date], ledger_from_row)?;
                let mut out = Vec::new();
                for r in rows {
                    out.push(r?);
                }
                Ok(out)
            })
            .await
            .context("load ledger lines for date")
    }

    /// Net position implied by the full ledger: (base, quote), each as
    /// sum of amount minus fee.
    pub async fn ledger_balance(&self, customer_id: &str) -> Result<(Decimal, Decimal)> {
        let customer_id = customer_id.to_string();
        self.conn
            .call(move |c| -> CallResult<(Decimal, Decimal)> {
                let mut stmt = c.prepare(
                    "SELECT amount_base, fee_base, amount_quote, fee_quote \
                     FROM ledger_lines WHERE customer_id=?1",
                )?;
                let rows = stmt.query_map(params![customer_id], |r| {
                    Ok((
                        get_dec(r, 0)?,
                        get_dec(r, 1)?,
                        get_dec(r, 2)?,
                        get_dec(r, 3)?,
                    ))
                })?;
                let mut base = Decimal::ZERO;
                let mut quote = Decimal::ZERO;
                for r in rows {
                    let (ab, fb, aq, fq) = r?;
                    base += ab - fb;
                    quote += aq - fq;
                }
                Ok((base, quote))
            })
            .await
            .context("compute ledger balance")
    }

    pub async fn earliest_ledger_date(&self, customer_id: &str) -> Result<Option<NaiveDate>> {
        let customer_id = customer_id.to_string();
        self.conn
            .call(move |c| -> CallResult<Option<NaiveDate>> {
                let s: Option<String> = c.query_row(
                    "SELECT MIN(trade_date) FROM ledger_lines WHERE customer_id=?1",
                    params![customer_id],
                    |r| r.get(0),
                )?;
                match s {
                    Some(s) => {
                        let d = NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                            .map_err(|e| bad_col(0, format!("bad date {s:?}: {e}")))?;
                        Ok(Some(d))
                    }
                    None => Ok(None),
                }
            })
            .await
            .context("load earliest ledger date")
    }

    // ---- daily balances ----

    pub async fn daily_balance(
        &self,
        customer_id: &str,
        date: NaiveDate,
    ) -> Result<Option<DailyBalance>> {
        let customer_id = customer_id.to_string();
        let date = date.to_string();
        self.conn
            .call(move |c| -> CallResult<Option<DailyBalance>> {
                let row = c
                    .query_row(
                        "SELECT org_id, customer_id, date, base_balance, quote_balance, nav \
                         FROM daily_balances WHERE customer_id=?1 AND date=?2",
                        params![customer_id, date],
                        balance_from_row,
                    )
                    .optional()?;
                Ok(row)
            })
            .await
            .context("load daily balance")
    }

    pub async fn upsert_daily_balance(&self, bal: &DailyBalance) -> Result<()> {
        let b = bal.clone();
        self.conn
            .call(move |c| -> CallResult<()> {
                c.execute(
                    r#"
INSERT INTO daily_balances (org_id, customer_id, date, base_balance, quote_balance, nav)
VALUES (?1,?2,?3,?4,?5,?6)
ON CONFLICT(org_id, customer_id, date) DO UPDATE SET
  base_balance=excluded.base_balance,
  quote_balance=excluded.quote_balance,
  nav=excluded.nav
"#,
                    params![
                        b.org_id,
                        b.customer_id,
                        b.date.to_string(),
                        dec_str(b.base_balance),
                        dec_str(b.quote_balance),
                        dec_str(b.nav),
                    ],
                )?;
                Ok(())
            })
            .await
            .context("upsert daily balance")
    }

    pub async fn dirty_roll_marks(&self, org_id: &str) -> Result<Vec<RollMark>> {
        let org_id = org_id.to_string();
        self.conn
            .call(move |c| -> CallResult<Vec<RollMark>> {
                let mut stmt = c.prepare(
                    "SELECT customer_id, dirty_from, gen FROM roll_marks \
                     WHERE org_id=?1 ORDER BY customer_id",
                )?;
                let rows = stmt.query_map(params![org_id], |r| {
                    Ok(RollMark {
                        customer_id: r.get(0)?,
                        dirty_from: get_date(r, 1)?,
                        gen: r.get(2)?,
                    })
                })?;
                let mut out = Vec::new();
                for r in rows {
                    out.push(r?);
                }
                Ok(out)
            })
            .await
            .context("load roll marks")
    }

    /// Clears a mark only if no ledger write bumped it since it was
    /// read; a changed mark stays for the next roll.
    pub async fn clear_roll_mark(&self, org_id: &str, customer_id: &str, gen: i64) -> Result<()> {
        let org_id = org_id.to_string();
        let customer_id = customer_id.to_string();
        self.conn
            .call(move |c| -> CallResult<()> {
                c.execute(
                    "DELETE FROM roll_marks WHERE org_id=?1 AND customer_id=?2 AND gen=?3",
                    params![org_id, customer_id, gen],
                )?;
                Ok(())
            })
            .await
            .context("clear roll mark")
    }

    // ---- alerts ----

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_alert(
        &self,
        org_id: &str,
        customer_id: Option<&str>,
        component: &str,
        severity: Severity,
        message: &str,
        context: Option<serde_json::Value>,
        now_ms: i64,
    ) -> Result<i64> {
        let org_id = org_id.to_string();
        let customer_id = customer_id.map(|s| s.to_string());
        let component = component.to_string();
        let message = message.to_string();
        let context = context.map(|v| v.to_string());
        self.conn
            .call(move |c| -> CallResult<i64> {
                c.execute(
                    "INSERT INTO alert_events (org_id, customer_id, component, severity, message, context_json, created_at_ms) \
                     VALUES (?1,?2,?3,?4,?5,?6,?7)",
                    params![org_id, customer_id, component, severity.as_str(), message, context, now_ms],
                )?;
                Ok(c.last_insert_rowid())
            })
            .await
            .context("insert alert")
    }

    pub async fn recent_alerts(&self, limit: usize) -> Result<Vec<AlertEvent>> {
        self.conn
            .call(move |c| -> CallResult<Vec<AlertEvent>> {
                let mut stmt = c.prepare(&format!(
                    "SELECT {ALERT_COLS} FROM alert_events ORDER BY id DESC LIMIT ?1"
                ))?;
                let rows = stmt.query_map(params![limit as i64], alert_from_row)?;
                let mut out = Vec::new();
                for r in rows {
                    out.push(r?);
                }
                Ok(out)
            })
            .await
            .context("load recent alerts")
    }

    // ---- fee transfers ----

    pub async fn insert_fee_transfer(&self, t: &FeeTransfer) -> Result<()> {
        let t = t.clone();
        self.conn
            .call(move |c| -> CallResult<()> {
                c.execute(
                    &format!("INSERT INTO fee_transfers ({TRANSFER_COLS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)"),
                    params![
                        t.id,
                        t.org_id,
                        t.customer_id,
                        t.asset,
                        dec_str(t.amount),
                        t.venue_transfer_id,
                        t.status.as_str(),
                        t.created_at_ms,
                    ],
                )?;
                Ok(())
            })
            .await
            .context("insert fee transfer")
    }

    pub async fn pending_fee_transfers(&self, limit: usize) -> Result<Vec<FeeTransfer>> {
        self.conn
            .call(move |c| -> CallResult<Vec<FeeTransfer>> {
                let mut stmt = c.prepare(&format!(
                    "SELECT {TRANSFER_COLS} FROM fee_transfers \
                     WHERE status='pending' ORDER BY created_at_ms ASC LIMIT ?1"
                ))?;
                let rows = stmt.query_map(params![limit as i64], transfer_from_row)?;
                let mut out = Vec::new();
                for r in rows {
                    out.push(r?);
                }
                Ok(out)
            })
            .await
            .context("load pending fee transfers")
    }

    pub async fn mark_fee_transfer_done(
        &self,
        id: &str,
        venue_transfer_id: Option<&str>,
    ) -> Result<()> {
        let id = id.to_string();
        let venue_transfer_id = venue_transfer_id.map(|s| s.to_string());
        self.conn
            .call(move |c| -> CallResult<()> {
                c.execute(
                    "UPDATE fee_transfers SET status='done', \
                     venue_transfer_id=COALESCE(?2, venue_transfer_id) WHERE id=?1",
                    params![id, venue_transfer_id],
                )?;
                Ok(())
            })
            .await
            .context("mark fee transfer done")
    }

    /// Pending sweep amounts per asset; venue balances still include
    /// these until the transfer lands.
    pub async fn pending_fee_amounts(&self, customer_id: &str) -> Result<Vec<(String, Decimal)>> {
        let customer_id = customer_id.to_string();
        self.conn
            .call(move |c| -> CallResult<Vec<(String, Decimal)>> {
                let mut stmt = c.prepare(
                    "SELECT asset, amount FROM fee_transfers \
                     WHERE customer_id=?1 AND status='pending'",
                )?;
                let rows = stmt.query_map(params![customer_id], |r| {
                    Ok((r.get::<_, String>(0)?, get_dec(r, 1)?))
                })?;
                let mut out = Vec::new();
                for r in rows {
                    out.push(r?);
                }
                Ok(out)
            })
            .await
            .context("load pending fee amounts")
    }

    /// Match an outbound venue transfer against our fee sweeps so the
    /// reconciler does not book the operator's own sweep as a customer
    /// withdrawal. Backfills the venue transfer id on amount matches
    /// where the ack was lost.
    pub async fn match_fee_sweep(
        &self,
        customer_id: &str,
        venue_tx_id: &str,
        asset: &str,
        amount_abs: Decimal,
    ) -> Result<bool> {
        let customer_id = customer_id.to_string();
        let venue_tx_id = venue_tx_id.to_string();
        let asset = asset.to_string();
        self.conn
            .call(move |c| -> CallResult<bool> {
                let tx = c.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let by_id: Option<String> = tx
                    .query_row(
                        "SELECT id FROM fee_transfers WHERE venue_transfer_id=?1 LIMIT 1",
                        params![venue_tx_id],
                        |r| r.get(0),
                    )
                    .optional()?;
                if by_id.is_some() {
                    tx.commit()?;
                    return Ok(true);
                }
                let by_amount: Option<String> = tx
                    .query_row(
                        "SELECT id FROM fee_transfers \
                         WHERE customer_id=?1 AND venue_transfer_id IS NULL AND asset=?2 AND amount=?3 \
                         ORDER BY created_at_ms ASC LIMIT 1",
                        params![customer_id, asset, dec_str(amount_abs)],
                        |r| r.get(0),
                    )
                    .optional()?;
                match by_amount {
                    Some(id) => {
                        tx.execute(
                            "UPDATE fee_transfers SET venue_transfer_id=?2, status='done' WHERE id=?1",
                            params![id, venue_tx_id],
                        )?;
                        tx.commit()?;
                        Ok(true)
                    }
                    None => {
                        tx.commit()?;
                        Ok(false)
                    }
                }
            })
            .await
            .context("match fee sweep")
    }

    // ---- reconciliation cursors / price marks ----

    pub async fn recon_cursor(&self, org_id: &str, customer_id: &str) -> Result<i64> {
        let org_id = org_id.to_string();
        let customer_id = customer_id.to_string();
        self.conn
            .call(move |c| -> CallResult<i64> {
                let v: Option<i64> = c
                    .query_row(
                        "SELECT last_seen_ms FROM recon_cursors WHERE org_id=?1 AND customer_id=?2",
                        params![org_id, customer_id],
                        |r| r.get(0),
                    )
                    .optional()?;
                Ok(v.unwrap_or(0))
            })
            .await
            .context("load recon cursor")
    }

    pub async fn set_recon_cursor(
        &self,
        org_id: &str,
        customer_id: &str,
        last_seen_ms: i64,
    ) -> Result<()> {
        let org_id = org_id.to_string();
        let customer_id = customer_id.to_string();
        self.conn
            .call(move |c| -> CallResult<()> {
                c.execute(
                    r#"
INSERT INTO recon_cursors (org_id, customer_id, last_seen_ms)
VALUES (?1,?2,?3)
ON CONFLICT(org_id, customer_id) DO UPDATE SET
  last_seen_ms=MAX(last_seen_ms, excluded.last_seen_ms)
"#,
                    params![org_id, customer_id, last_seen_ms],
                )?;
                Ok(())
            })
            .await
            .context("set recon cursor")
    }

    /// True while the customer has working orders or fills not yet on
    /// the ledger. Balance comparisons are only meaningful at rest.
    pub async fn has_open_activity(&self, customer_id: &str) -> Result<bool> {
        let customer_id = customer_id.to_string();
        self.conn
            .call(move |c| -> CallResult<bool> {
                let open: i64 = c.query_row(
                    "SELECT EXISTS(SELECT 1 FROM exchange_orders \
                       WHERE customer_id=?1 AND status IN ('submitted','partially_filled')) \
                     OR EXISTS(SELECT 1 FROM fills \
                       JOIN exchange_orders ON exchange_orders.id = fills.order_id \
                       WHERE exchange_orders.customer_id=?1 \
                         AND NOT EXISTS (SELECT 1 FROM ledger_lines \
                           WHERE ledger_lines.ref_fill_id = fills.id))",
                    params![customer_id],
                    |r| r.get(0),
                )?;
                Ok(open != 0)
            })
            .await
            .context("check open activity")
    }

    pub async fn upsert_price_mark(
        &self,
        symbol: &str,
        date: NaiveDate,
        price: Decimal,
    ) -> Result<()> {
        let symbol = symbol.to_string();
        let date = date.to_string();
        self.conn
            .call(move |c| -> CallResult<()> {
                c.execute(
                    r#"
INSERT INTO price_marks (symbol, date, price)
VALUES (?1,?2,?3)
ON CONFLICT(symbol, date) DO UPDATE SET price=excluded.price
"#,
                    params![symbol, date, dec_str(price)],
                )?;
                Ok(())
            })
            .await
            .context("upsert price mark")
    }

    pub async fn price_at_or_before(
        &self,
        symbol: &str,
        date: NaiveDate,
    ) -> Result<Option<Decimal>> {
        let symbol = symbol.to_string();
        let date = date.to_string();
        self.conn
            .call(move |c| -> CallResult<Option<Decimal>> {
                let row = c
                    .query_row(
                        "SELECT price FROM price_marks WHERE symbol=?1 AND date<=?2 \
                         ORDER BY date DESC LIMIT 1",
                        params![symbol, date],
                        |r| get_dec(r, 0),
                    )
                    .optional()?;
                Ok(row)
            })
            .await
            .context("load price mark")
    }

    // ---- admin counters ----

    pub async fn count_pending_intents(&self) -> Result<i64> {
        self.conn
            .call(|c| -> CallResult<i64> {
                let n: i64 = c.query_row(
                    "SELECT COUNT(*) FROM order_intents WHERE status='pending'",
                    [],
                    |r| r.get(0),
                )?;
                Ok(n)
            })
            .await
            .context("count pending intents")
    }

    pub async fn count_open_orders(&self) -> Result<i64> {
        self.conn
            .call(|c| -> CallResult<i64> {
                let n: i64 = c.query_row(
                    "SELECT COUNT(*) FROM exchange_orders \
                     WHERE status IN ('submitted','partially_filled')",
                    [],
                    |r| r.get(0),
                )?;
                Ok(n)
            })
            .await
            .context("count open orders")
    }
}

/// Shallow-merge a fresh venue payload over the stored one: new fields
/// override, fields the new payload lacks survive.
fn merge_payload(old: Option<String>, new: &serde_json::Value) -> String {
    let mut base = old
        .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
        .unwrap_or(serde_json::Value::Null);
    match (base.as_object_mut(), new.as_object()) {
        (Some(merged), Some(incoming)) => {
            for (k, v) in incoming {
                merged.insert(k.clone(), v.clone());
            }
            base.to_string()
        }
        _ => new.to_string(),
    }
}
