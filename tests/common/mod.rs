#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use dca_engine::exchange::models::{
    CancelAck, OrderState, PlaceOrderRequest, Ticker, TransactionPage, TransferAck, VenueBalance,
    VenueFill, VenueTransaction,
};
use dca_engine::exchange::rest::{ExchangeApi, ExchangeError};
use dca_engine::observability::Alerts;
use dca_engine::persistence::sqlite::SqliteStore;
use dca_engine::rules::MarketRules;
use dca_engine::settlement::{SettleCfg, SettlementPoster};
use dca_engine::types::{
    Customer, FundingEvent, FundingKind, FundingSource, IntentStatus, LedgerKind, NewExchangeOrder,
    NewLedgerLine, OrderIntent, OrderStatus, OrderType, Side,
};

pub const ORG: &str = "org-1";
pub const SYMBOL: &str = "BTC-USD";

pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

pub async fn mem_store() -> Arc<SqliteStore> {
    let store = Arc::new(SqliteStore::new(":memory:").await.unwrap());
    store.init_schema().await.unwrap();
    store
}

pub fn alerts_for(store: &Arc<SqliteStore>) -> Alerts {
    Alerts::new(store.clone(), ORG.to_string())
}

pub async fn has_alert(store: &Arc<SqliteStore>, needle: &str) -> bool {
    store
        .recent_alerts(50)
        .await
        .unwrap()
        .iter()
        .any(|a| a.message.contains(needle))
}

pub async fn seed_customer(store: &Arc<SqliteStore>, id: &str, sub: Option<&str>) {
    store
        .upsert_customer(&Customer {
            id: id.to_string(),
            org_id: ORG.to_string(),
            venue_subaccount: sub.map(str::to_string),
            active: true,
        })
        .await
        .unwrap();
}

pub fn notional_intent(id: &str, customer: &str, notional: &str) -> OrderIntent {
    OrderIntent {
        id: id.to_string(),
        org_id: ORG.to_string(),
        customer_id: customer.to_string(),
        side: Side::Buy,
        quantity: None,
        notional: Some(dec(notional)),
        limit_price: None,
        trade_date: Utc::now().date_naive(),
        status: IntentStatus::Pending,
        idempotency_key: format!("key-{id}"),
        created_at_ms: 1_700_000_000_000,
    }
}

pub fn limit_intent(id: &str, customer: &str, qty: &str, limit: &str) -> OrderIntent {
    OrderIntent {
        id: id.to_string(),
        org_id: ORG.to_string(),
        customer_id: customer.to_string(),
        side: Side::Buy,
        quantity: Some(dec(qty)),
        notional: None,
        limit_price: Some(dec(limit)),
        trade_date: Utc::now().date_naive(),
        status: IntentStatus::Pending,
        idempotency_key: format!("key-{id}"),
        created_at_ms: 1_700_000_000_000,
    }
}

pub async fn seed_executed_intent(store: &Arc<SqliteStore>, id: &str, customer: &str) {
    let intent = limit_intent(id, customer, "0.01", "25000");
    assert!(store.insert_order_intent(&intent).await.unwrap());
    store
        .set_intent_status(id, IntentStatus::Executed)
        .await
        .unwrap();
}

/// Limit buy with client id equal to the intent id and venue id `EX-{id}`,
/// matching what the submitter writes.
pub fn limit_order(
    id: &str,
    intent_id: &str,
    customer: &str,
    price: &str,
    qty: &str,
    status: OrderStatus,
    submitted_at_ms: i64,
) -> NewExchangeOrder {
    NewExchangeOrder {
        id: id.to_string(),
        org_id: ORG.to_string(),
        intent_id: intent_id.to_string(),
        customer_id: customer.to_string(),
        client_order_id: intent_id.to_string(),
        exchange_order_id: Some(format!("EX-{id}")),
        replaces_order_id: None,
        side: Side::Buy,
        order_type: OrderType::Limit,
        price: Some(dec(price)),
        quantity: dec(qty),
        status,
        submitted_at_ms,
        raw_payload: None,
    }
}

pub fn order_state(
    client_id: &str,
    venue_id: &str,
    status: &str,
    executed: &str,
    cum_quote: &str,
) -> OrderState {
    OrderState {
        order_id: Some(venue_id.to_string()),
        client_order_id: client_id.to_string(),
        status: status.to_string(),
        price: None,
        quantity: None,
        executed_quantity: dec(executed),
        cumulative_quote_quantity: dec(cum_quote),
        updated_at_ms: None,
        extra: serde_json::Map::new(),
    }
}

pub fn venue_fill(
    trade_id: &str,
    price: &str,
    qty: &str,
    fee: Option<(&str, &str)>,
    traded_at_ms: i64,
) -> VenueFill {
    VenueFill {
        trade_id: trade_id.to_string(),
        order_id: None,
        price: dec(price),
        quantity: dec(qty),
        fee_asset: fee.map(|(a, _)| a.to_string()),
        fee_quantity: fee.map(|(_, q)| dec(q)),
        traded_at_ms,
    }
}

pub fn venue_tx(tx_id: &str, kind: &str, asset: &str, amount: &str, ts: i64) -> VenueTransaction {
    VenueTransaction {
        tx_id: tx_id.to_string(),
        kind: kind.to_string(),
        asset: asset.to_string(),
        amount: dec(amount),
        occurred_at_ms: ts,
        note: None,
    }
}

pub fn funding(
    id: &str,
    customer: &str,
    kind: FundingKind,
    asset: &str,
    amount: &str,
    source: FundingSource,
    occurred_at_ms: i64,
) -> FundingEvent {
    FundingEvent {
        id: id.to_string(),
        org_id: ORG.to_string(),
        customer_id: customer.to_string(),
        kind,
        asset: asset.to_string(),
        amount: dec(amount),
        occurred_at_ms,
        idempotency_key: format!("key-{id}"),
        source,
    }
}

pub fn ledger_line(
    customer: &str,
    date: NaiveDate,
    kind: LedgerKind,
    base: &str,
    quote: &str,
    ref_funding_id: Option<&str>,
) -> NewLedgerLine {
    NewLedgerLine {
        org_id: ORG.to_string(),
        customer_id: customer.to_string(),
        trade_date: date,
        kind,
        amount_base: dec(base),
        amount_quote: dec(quote),
        fee_base: Decimal::ZERO,
        fee_quote: Decimal::ZERO,
        ref_fill_id: None,
        ref_funding_id: ref_funding_id.map(str::to_string),
        note: None,
        created_at_ms: 1_700_000_000_000,
    }
}

pub fn market_rules() -> MarketRules {
    MarketRules {
        symbol: SYMBOL.to_string(),
        tick_size: Some(dec("0.01")),
        step_size: Some(dec("0.0001")),
        min_qty: Some(dec("0.0001")),
        min_notional: Some(dec("10")),
    }
}

pub fn settle_cfg(platform_fee_rate: &str, sweep_fees: bool) -> SettleCfg {
    SettleCfg {
        org_id: ORG.to_string(),
        base_asset: "BTC".to_string(),
        quote_asset: "USD".to_string(),
        platform_fee_rate: dec(platform_fee_rate),
        sweep_fees,
        inter_call_delay_ms: 0,
    }
}

pub fn poster(
    store: &Arc<SqliteStore>,
    api: Arc<dyn ExchangeApi>,
    platform_fee_rate: &str,
    sweep_fees: bool,
) -> Arc<SettlementPoster> {
    Arc::new(SettlementPoster::new(
        store.clone(),
        api,
        alerts_for(store),
        settle_cfg(platform_fee_rate, sweep_fees),
    ))
}

/// Scripted venue double. Order-state queries pop a per-client queue and
/// the last queued state repeats; everything the engine sends is recorded
/// for assertions.
#[derive(Default)]
pub struct StubExchange {
    pub states: Mutex<HashMap<String, VecDeque<OrderState>>>,
    pub fills: Mutex<HashMap<String, Vec<VenueFill>>>,
    pub place_results: Mutex<VecDeque<Result<OrderState, ExchangeError>>>,
    pub placed: Mutex<Vec<PlaceOrderRequest>>,
    pub cancelled: Mutex<Vec<String>>,
    pub ticker_price: Mutex<Decimal>,
    pub balances: Mutex<Vec<VenueBalance>>,
    pub tx_pages: Mutex<VecDeque<TransactionPage>>,
    pub transfer_results: Mutex<VecDeque<Result<TransferAck, ExchangeError>>>,
    pub transfers: Mutex<Vec<(String, String, Decimal)>>,
}

impl StubExchange {
    pub fn new() -> Arc<Self> {
        Arc::new(StubExchange::default())
    }

    pub fn push_state(&self, client_id: &str, state: OrderState) {
        self.states
            .lock()
            .unwrap()
            .entry(client_id.to_string())
            .or_default()
            .push_back(state);
    }

    pub fn set_fills(&self, venue_order_id: &str, fills: Vec<VenueFill>) {
        self.fills
            .lock()
            .unwrap()
            .insert(venue_order_id.to_string(), fills);
    }

    pub fn push_place(&self, result: Result<OrderState, ExchangeError>) {
        self.place_results.lock().unwrap().push_back(result);
    }

    pub fn set_ticker(&self, price: &str) {
        *self.ticker_price.lock().unwrap() = dec(price);
    }

    pub fn set_balances(&self, entries: &[(&str, &str)]) {
        *self.balances.lock().unwrap() = entries
            .iter()
            .map(|(asset, total)| VenueBalance {
                asset: asset.to_string(),
                total: dec(total),
                available: None,
            })
            .collect();
    }

    pub fn push_tx_page(&self, items: Vec<VenueTransaction>, next_cursor: Option<&str>) {
        self.tx_pages.lock().unwrap().push_back(TransactionPage {
            items,
            next_cursor: next_cursor.map(str::to_string),
        });
    }

    pub fn push_transfer(&self, result: Result<TransferAck, ExchangeError>) {
        self.transfer_results.lock().unwrap().push_back(result);
    }
}

#[async_trait]
impl ExchangeApi for StubExchange {
    async fn place_order(
        &self,
        req: &PlaceOrderRequest,
        _subaccount: &str,
    ) -> Result<OrderState, ExchangeError> {
        self.placed.lock().unwrap().push(req.clone());
        if let Some(scripted) = self.place_results.lock().unwrap().pop_front() {
            return scripted;
        }
        let n = self.placed.lock().unwrap().len();
        Ok(OrderState {
            order_id: Some(format!("EX-{n}")),
            client_order_id: req.client_order_id.clone(),
            status: "open".to_string(),
            price: req.price,
            quantity: Some(req.quantity),
            executed_quantity: Decimal::ZERO,
            cumulative_quote_quantity: Decimal::ZERO,
            updated_at_ms: None,
            extra: serde_json::Map::new(),
        })
    }

    async fn cancel_order(
        &self,
        venue_order_id: &str,
        _subaccount: &str,
    ) -> Result<CancelAck, ExchangeError> {
        self.cancelled.lock().unwrap().push(venue_order_id.to_string());
        Ok(CancelAck {
            order_id: Some(venue_order_id.to_string()),
            status: Some("cancelled".to_string()),
        })
    }

    async fn order_by_client_id(
        &self,
        client_order_id: &str,
        _subaccount: &str,
    ) -> Result<OrderState, ExchangeError> {
        let mut states = self.states.lock().unwrap();
        let Some(queue) = states.get_mut(client_order_id) else {
            return Err(ExchangeError::Rejected {
                code: "404".to_string(),
                message: "order not found".to_string(),
            });
        };
        if queue.len() > 1 {
            Ok(queue.pop_front().unwrap())
        } else {
            queue.front().cloned().ok_or_else(|| ExchangeError::Rejected {
                code: "404".to_string(),
                message: "order not found".to_string(),
            })
        }
    }

    async fn order_fills(
        &self,
        venue_order_id: &str,
        _subaccount: &str,
    ) -> Result<Vec<VenueFill>, ExchangeError> {
        Ok(self
            .fills
            .lock()
            .unwrap()
            .get(venue_order_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        Ok(Ticker {
            symbol: symbol.to_string(),
            last: *self.ticker_price.lock().unwrap(),
            bid: None,
            ask: None,
        })
    }

    async fn balances(&self, _subaccount: &str) -> Result<Vec<VenueBalance>, ExchangeError> {
        Ok(self.balances.lock().unwrap().clone())
    }

    async fn transactions(
        &self,
        _subaccount: &str,
        _since_ms: i64,
        _cursor: Option<&str>,
        _limit: u32,
    ) -> Result<TransactionPage, ExchangeError> {
        Ok(self
            .tx_pages
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(TransactionPage {
                items: Vec::new(),
                next_cursor: None,
            }))
    }

    async fn transfer_to_main(
        &self,
        from_subaccount: &str,
        asset: &str,
        amount: Decimal,
    ) -> Result<TransferAck, ExchangeError> {
        self.transfers.lock().unwrap().push((
            from_subaccount.to_string(),
            asset.to_string(),
            amount,
        ));
        if let Some(scripted) = self.transfer_results.lock().unwrap().pop_front() {
            return scripted;
        }
        let n = self.transfers.lock().unwrap().len();
        Ok(TransferAck {
            transfer_id: format!("VT-{n}"),
        })
    }
}
