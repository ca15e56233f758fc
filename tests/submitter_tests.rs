mod common;

use common::*;
use dca_engine::exchange::rest::{ExchangeApi, ExchangeError};
use dca_engine::persistence::sqlite::SqliteStore;
use dca_engine::submitter::{OrderSubmitter, SubmitCfg};
use dca_engine::types::{Customer, IntentStatus, OrderStatus, OrderType, Severity};
use std::sync::Arc;

const NOW: i64 = 1_700_000_000_000;

fn submitter(store: &Arc<SqliteStore>, stub: &Arc<StubExchange>) -> OrderSubmitter {
    let api: Arc<dyn ExchangeApi> = stub.clone();
    OrderSubmitter::new(
        store.clone(),
        api,
        alerts_for(store),
        market_rules(),
        SubmitCfg {
            symbol: SYMBOL.to_string(),
            batch: 10,
            inter_call_delay_ms: 0,
        },
    )
}

#[tokio::test]
async fn notional_intent_is_sized_from_the_ticker() {
    let store = mem_store().await;
    let stub = StubExchange::new();
    stub.set_ticker("25000");
    seed_customer(&store, "c1", Some("sub-1")).await;
    store.insert_order_intent(&notional_intent("i1", "c1", "500")).await.unwrap();

    let watch = submitter(&store, &stub).run_once(NOW).await.unwrap();
    assert_eq!(watch.len(), 1);
    assert_eq!(watch[0].client_order_id, "i1");

    let placed = stub.placed.lock().unwrap().clone();
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].client_order_id, "i1");
    assert_eq!(placed[0].order_type, OrderType::Market);
    assert_eq!(placed[0].price, None);
    assert_eq!(placed[0].quantity, dec("0.02"));

    let orders = store.orders_for_intent("i1").await.unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].status, OrderStatus::Submitted);
    assert_eq!(orders[0].exchange_order_id.as_deref(), Some("EX-1"));

    let intent = store.order_intent("i1").await.unwrap().unwrap();
    assert_eq!(intent.status, IntentStatus::Executed);
}

#[tokio::test]
async fn limit_intent_uses_the_rounded_limit_price() {
    let store = mem_store().await;
    let stub = StubExchange::new();
    seed_customer(&store, "c1", Some("sub-1")).await;
    store.insert_order_intent(&limit_intent("i1", "c1", "0.01", "25000.119")).await.unwrap();

    submitter(&store, &stub).run_once(NOW).await.unwrap();

    let placed = stub.placed.lock().unwrap().clone();
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].order_type, OrderType::Limit);
    assert_eq!(placed[0].price, Some(dec("25000.11")));
    assert_eq!(placed[0].quantity, dec("0.01"));
}

#[tokio::test]
async fn venue_rejection_dead_ends_the_intent() {
    let store = mem_store().await;
    let stub = StubExchange::new();
    stub.set_ticker("25000");
    stub.push_place(Err(ExchangeError::Rejected {
        code: "2010".to_string(),
        message: "Account has insufficient balance".to_string(),
    }));
    seed_customer(&store, "c1", Some("sub-1")).await;
    store.insert_order_intent(&notional_intent("i1", "c1", "500")).await.unwrap();

    let watch = submitter(&store, &stub).run_once(NOW).await.unwrap();
    assert!(watch.is_empty());

    let orders = store.orders_for_intent("i1").await.unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].status, OrderStatus::Error);

    let intent = store.order_intent("i1").await.unwrap().unwrap();
    assert_eq!(intent.status, IntentStatus::Error);

    let alerts = store.recent_alerts(10).await.unwrap();
    let alert = alerts.iter().find(|a| a.message == "venue rejected order").unwrap();
    assert_eq!(alert.severity, Severity::Error);
}

#[tokio::test]
async fn rate_limited_rejection_downgrades_to_warn() {
    let store = mem_store().await;
    let stub = StubExchange::new();
    stub.set_ticker("25000");
    stub.push_place(Err(ExchangeError::Rejected {
        code: "429".to_string(),
        message: "Rate limit exceeded for account".to_string(),
    }));
    seed_customer(&store, "c1", Some("sub-1")).await;
    store.insert_order_intent(&notional_intent("i1", "c1", "500")).await.unwrap();

    submitter(&store, &stub).run_once(NOW).await.unwrap();

    let alerts = store.recent_alerts(10).await.unwrap();
    let alert = alerts.iter().find(|a| a.message == "venue rejected order").unwrap();
    assert_eq!(alert.severity, Severity::Warn);
}

#[tokio::test]
async fn crash_between_order_and_intent_update_heals() {
    let store = mem_store().await;
    let stub = StubExchange::new();
    seed_customer(&store, "c1", Some("sub-1")).await;
    store.insert_order_intent(&limit_intent("i1", "c1", "0.01", "25000")).await.unwrap();
    // The order landed but the intent flip never did.
    let order = limit_order("o1", "i1", "c1", "25000", "0.01", OrderStatus::Submitted, NOW - 60_000);
    store.insert_exchange_order(&order).await.unwrap();

    let watch = submitter(&store, &stub).run_once(NOW).await.unwrap();
    assert!(watch.is_empty());
    assert!(stub.placed.lock().unwrap().is_empty());

    let intent = store.order_intent("i1").await.unwrap().unwrap();
    assert_eq!(intent.status, IntentStatus::Executed);
    assert_eq!(store.orders_for_intent("i1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn missing_subaccount_is_critical() {
    let store = mem_store().await;
    let stub = StubExchange::new();
    seed_customer(&store, "c1", None).await;
    store.insert_order_intent(&limit_intent("i1", "c1", "0.01", "25000")).await.unwrap();

    submitter(&store, &stub).run_once(NOW).await.unwrap();
    assert!(stub.placed.lock().unwrap().is_empty());

    let intent = store.order_intent("i1").await.unwrap().unwrap();
    assert_eq!(intent.status, IntentStatus::Error);

    let alerts = store.recent_alerts(10).await.unwrap();
    let alert = alerts
        .iter()
        .find(|a| a.message.contains("no venue sub-account"))
        .unwrap();
    assert_eq!(alert.severity, Severity::Critical);
}

#[tokio::test]
async fn inactive_customer_fails_the_intent() {
    let store = mem_store().await;
    let stub = StubExchange::new();
    store
        .upsert_customer(&Customer {
            id: "c1".to_string(),
            org_id: ORG.to_string(),
            venue_subaccount: Some("sub-1".to_string()),
            active: false,
        })
        .await
        .unwrap();
    store.insert_order_intent(&limit_intent("i1", "c1", "0.01", "25000")).await.unwrap();

    submitter(&store, &stub).run_once(NOW).await.unwrap();
    assert!(stub.placed.lock().unwrap().is_empty());
    let intent = store.order_intent("i1").await.unwrap().unwrap();
    assert_eq!(intent.status, IntentStatus::Error);
    assert!(has_alert(&store, "customer is inactive").await);
}

#[tokio::test]
async fn lot_rules_block_undersized_orders() {
    let store = mem_store().await;
    let stub = StubExchange::new();
    seed_customer(&store, "c1", Some("sub-1")).await;
    store.insert_order_intent(&limit_intent("i1", "c1", "0.00005", "25000")).await.unwrap();

    submitter(&store, &stub).run_once(NOW).await.unwrap();
    assert!(stub.placed.lock().unwrap().is_empty());

    let intent = store.order_intent("i1").await.unwrap().unwrap();
    assert_eq!(intent.status, IntentStatus::Error);
    assert!(has_alert(&store, "order violates market lot rules").await);
}
