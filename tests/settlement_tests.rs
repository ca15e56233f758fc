mod common;

use common::*;
use dca_engine::exchange::rest::{ExchangeApi, ExchangeError};
use dca_engine::persistence::sqlite::OrderUpdateArgs;
use dca_engine::types::{
    utc_date_from_ms, FundingKind, FundingSource, LedgerKind, NewFill, OrderStatus, Side,
    UpdateSource,
};
use std::sync::Arc;

const NOW: i64 = 1_700_000_000_000;

#[tokio::test]
async fn manual_deposit_is_charged_the_platform_fee() {
    let store = mem_store().await;
    let stub = StubExchange::new();
    let api: Arc<dyn ExchangeApi> = stub.clone();
    seed_customer(&store, "c1", Some("sub-1")).await;

    let ev = funding("f1", "c1", FundingKind::Deposit, "USD", "1000", FundingSource::Manual, NOW);
    assert!(store.insert_funding_event(&ev).await.unwrap());

    let poster = poster(&store, api, "0.0075", false);
    let report = poster.run_once().await.unwrap();
    assert_eq!(report.funding_posted, 1);

    let lines = store
        .ledger_lines_for_date("c1", utc_date_from_ms(NOW))
        .await
        .unwrap();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].kind, LedgerKind::Topup);
    assert_eq!(lines[0].amount_quote, dec("1000"));
    assert_eq!(lines[0].fee_quote, dec("7.5"));
    assert_eq!(lines[0].ref_funding_id.as_deref(), Some("f1"));

    let (base, quote) = store.ledger_balance("c1").await.unwrap();
    assert_eq!(base, dec("0"));
    assert_eq!(quote, dec("992.5"));

    let pending = store.pending_fee_transfers(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].asset, "USD");
    assert_eq!(pending[0].amount, dec("7.5"));
    assert_eq!(pending[0].venue_transfer_id, None);

    // Replay of the same event changes nothing.
    assert!(!store.insert_funding_event(&ev).await.unwrap());
    let report = poster.run_once().await.unwrap();
    assert_eq!(report.funding_posted, 0);
    assert_eq!(
        store
            .ledger_lines_for_date("c1", utc_date_from_ms(NOW))
            .await
            .unwrap()
            .len(),
        1
    );
    assert_eq!(store.pending_fee_transfers(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn reconciliation_correctives_post_at_face_value() {
    let store = mem_store().await;
    let stub = StubExchange::new();
    let api: Arc<dyn ExchangeApi> = stub.clone();
    seed_customer(&store, "c1", Some("sub-1")).await;

    let ev = funding(
        "f1",
        "c1",
        FundingKind::Deposit,
        "USD",
        "250",
        FundingSource::Reconciliation,
        NOW,
    );
    assert!(store.insert_funding_event(&ev).await.unwrap());

    poster(&store, api, "0.0075", false).run_once().await.unwrap();

    let lines = store
        .ledger_lines_for_date("c1", utc_date_from_ms(NOW))
        .await
        .unwrap();
    assert_eq!(lines[0].fee_quote, dec("0"));
    let (_, quote) = store.ledger_balance("c1").await.unwrap();
    assert_eq!(quote, dec("250"));
    assert!(store.pending_fee_transfers(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn withdrawals_post_the_signed_amount_without_fee() {
    let store = mem_store().await;
    let stub = StubExchange::new();
    let api: Arc<dyn ExchangeApi> = stub.clone();
    seed_customer(&store, "c1", Some("sub-1")).await;

    let ev = funding(
        "f1",
        "c1",
        FundingKind::Withdrawal,
        "USD",
        "-200",
        FundingSource::Manual,
        NOW,
    );
    assert!(store.insert_funding_event(&ev).await.unwrap());

    let report = poster(&store, api, "0.0075", false).run_once().await.unwrap();
    assert_eq!(report.funding_posted, 1);

    let lines = store
        .ledger_lines_for_date("c1", utc_date_from_ms(NOW))
        .await
        .unwrap();
    assert_eq!(lines[0].kind, LedgerKind::Withdrawal);
    assert_eq!(lines[0].amount_quote, dec("-200"));
    assert_eq!(lines[0].fee_quote, dec("0"));
    assert!(store.pending_fee_transfers(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn sign_mismatch_is_alerted_and_not_posted() {
    let store = mem_store().await;
    let stub = StubExchange::new();
    let api: Arc<dyn ExchangeApi> = stub.clone();
    seed_customer(&store, "c1", Some("sub-1")).await;

    let ev = funding("f1", "c1", FundingKind::Deposit, "USD", "-50", FundingSource::Manual, NOW);
    assert!(store.insert_funding_event(&ev).await.unwrap());

    let report = poster(&store, api, "0.0075", false).run_once().await.unwrap();
    assert_eq!(report.funding_posted, 0);
    assert!(has_alert(&store, "amount sign disagrees with its kind").await);
    let (base, quote) = store.ledger_balance("c1").await.unwrap();
    assert_eq!((base, quote), (dec("0"), dec("0")));
}

#[tokio::test]
async fn unsupported_assets_are_alerted_and_not_posted() {
    let store = mem_store().await;
    let stub = StubExchange::new();
    let api: Arc<dyn ExchangeApi> = stub.clone();
    seed_customer(&store, "c1", Some("sub-1")).await;

    let ev = funding("f1", "c1", FundingKind::Deposit, "EUR", "100", FundingSource::Manual, NOW);
    assert!(store.insert_funding_event(&ev).await.unwrap());

    let report = poster(&store, api, "0.0075", false).run_once().await.unwrap();
    assert_eq!(report.funding_posted, 0);
    assert!(has_alert(&store, "unsupported asset").await);
    let (base, quote) = store.ledger_balance("c1").await.unwrap();
    assert_eq!((base, quote), (dec("0"), dec("0")));
}

#[tokio::test]
async fn fee_sweep_records_the_venue_transfer() {
    let store = mem_store().await;
    let stub = StubExchange::new();
    let api: Arc<dyn ExchangeApi> = stub.clone();
    seed_customer(&store, "c1", Some("sub-1")).await;

    let ev = funding("f1", "c1", FundingKind::Deposit, "USD", "1000", FundingSource::Manual, NOW);
    store.insert_funding_event(&ev).await.unwrap();

    poster(&store, api, "0.0075", true).run_once().await.unwrap();

    assert!(store.pending_fee_transfers(10).await.unwrap().is_empty());
    let transfers = stub.transfers.lock().unwrap().clone();
    assert_eq!(transfers, vec![("sub-1".to_string(), "USD".to_string(), dec("7.5"))]);

    // The recorded venue id is what lets the reconciler recognize this
    // outflow as our own sweep.
    assert!(store
        .match_fee_sweep("c1", "VT-1", "USD", dec("7.5"))
        .await
        .unwrap());
}

#[tokio::test]
async fn failed_sweep_stays_pending_and_is_retried() {
    let store = mem_store().await;
    let stub = StubExchange::new();
    let api: Arc<dyn ExchangeApi> = stub.clone();
    seed_customer(&store, "c1", Some("sub-1")).await;

    let ev = funding("f1", "c1", FundingKind::Deposit, "USD", "1000", FundingSource::Manual, NOW);
    store.insert_funding_event(&ev).await.unwrap();
    stub.push_transfer(Err(ExchangeError::Server { status: 500 }));

    let poster = poster(&store, api, "0.0075", true);
    poster.run_once().await.unwrap();
    assert_eq!(store.pending_fee_transfers(10).await.unwrap().len(), 1);
    assert!(has_alert(&store, "fee sweep failed; will retry").await);

    poster.run_once().await.unwrap();
    assert!(store.pending_fee_transfers(10).await.unwrap().is_empty());
    assert_eq!(stub.transfers.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn sweep_without_a_subaccount_is_blocked() {
    let store = mem_store().await;
    let stub = StubExchange::new();
    let api: Arc<dyn ExchangeApi> = stub.clone();
    seed_customer(&store, "c1", None).await;

    let ev = funding("f1", "c1", FundingKind::Deposit, "USD", "1000", FundingSource::Manual, NOW);
    store.insert_funding_event(&ev).await.unwrap();

    poster(&store, api, "0.0075", true).run_once().await.unwrap();

    assert!(has_alert(&store, "fee sweep blocked").await);
    assert_eq!(store.pending_fee_transfers(10).await.unwrap().len(), 1);
    assert!(stub.transfers.lock().unwrap().is_empty());
}

#[tokio::test]
async fn recorded_fills_missed_by_inline_settlement_are_swept_up() {
    let store = mem_store().await;
    let stub = StubExchange::new();
    let api: Arc<dyn ExchangeApi> = stub.clone();
    seed_customer(&store, "c1", Some("sub-1")).await;
    seed_executed_intent(&store, "i1", "c1").await;
    let order = limit_order("o1", "i1", "c1", "25000", "0.01", OrderStatus::Submitted, NOW);
    store.insert_exchange_order(&order).await.unwrap();

    // Fill recorded without its ledger line, as after a crash between
    // the order update and inline settlement.
    store
        .apply_order_update(OrderUpdateArgs {
            order_id: "o1".to_string(),
            incoming: OrderStatus::PartiallyFilled,
            executed_qty: dec("0.004"),
            cumulative_quote_qty: dec("100"),
            exchange_order_id: Some("EX-o1".to_string()),
            raw: serde_json::json!({}),
            fills: vec![NewFill {
                order_id: "o1".to_string(),
                venue_trade_id: "T1".to_string(),
                traded_at_ms: NOW,
                price: dec("25000"),
                quantity: dec("0.004"),
                fee_asset: Some("BTC".to_string()),
                fee_quantity: Some(dec("0.00001")),
            }],
            source: UpdateSource::Poll,
            now_ms: NOW,
        })
        .await
        .unwrap();
    assert_eq!(store.unsettled_fills(10).await.unwrap().len(), 1);

    let poster = poster(&store, api, "0", false);
    let report = poster.run_once().await.unwrap();
    assert_eq!(report.fills_posted, 1);

    let (base, quote) = store.ledger_balance("c1").await.unwrap();
    assert_eq!(base, dec("0.00399"));
    assert_eq!(quote, dec("-100"));

    let report = poster.run_once().await.unwrap();
    assert_eq!(report.fills_posted, 0);
    assert!(store.unsettled_fills(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn sell_fills_and_foreign_fee_assets_post_with_a_note() {
    let store = mem_store().await;
    let stub = StubExchange::new();
    let api: Arc<dyn ExchangeApi> = stub.clone();
    seed_customer(&store, "c1", Some("sub-1")).await;
    seed_executed_intent(&store, "i1", "c1").await;
    let mut order = limit_order("o1", "i1", "c1", "25000", "0.004", OrderStatus::Submitted, NOW);
    order.side = Side::Sell;
    store.insert_exchange_order(&order).await.unwrap();

    store
        .apply_order_update(OrderUpdateArgs {
            order_id: "o1".to_string(),
            incoming: OrderStatus::Filled,
            executed_qty: dec("0.004"),
            cumulative_quote_qty: dec("100"),
            exchange_order_id: Some("EX-o1".to_string()),
            raw: serde_json::json!({}),
            fills: vec![NewFill {
                order_id: "o1".to_string(),
                venue_trade_id: "T1".to_string(),
                traded_at_ms: NOW,
                price: dec("25000"),
                quantity: dec("0.004"),
                fee_asset: Some("BNB".to_string()),
                fee_quantity: Some(dec("0.001")),
            }],
            source: UpdateSource::Poll,
            now_ms: NOW,
        })
        .await
        .unwrap();

    let report = poster(&store, api, "0", false).run_once().await.unwrap();
    assert_eq!(report.fills_posted, 1);
    assert!(has_alert(&store, "unrecognized asset").await);

    let lines = store
        .ledger_lines_for_date("c1", utc_date_from_ms(NOW))
        .await
        .unwrap();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].kind, LedgerKind::Sell);
    assert_eq!(lines[0].amount_base, dec("-0.004"));
    assert_eq!(lines[0].amount_quote, dec("100"));
    assert_eq!(lines[0].fee_base, dec("0"));
    assert_eq!(lines[0].fee_quote, dec("0"));
    assert_eq!(
        lines[0].note.as_deref(),
        Some("venue fee 0.001 BNB not netted")
    );

    let (base, quote) = store.ledger_balance("c1").await.unwrap();
    assert_eq!(base, dec("-0.004"));
    assert_eq!(quote, dec("100"));
}
