mod common;

use chrono::Utc;
use common::*;
use dca_engine::balance::BalanceRoller;
use dca_engine::persistence::sqlite::SqliteStore;
use dca_engine::types::LedgerKind;
use std::sync::Arc;

fn roller(store: &Arc<SqliteStore>) -> BalanceRoller {
    BalanceRoller::new(store.clone(), ORG.to_string(), SYMBOL.to_string())
}

#[tokio::test]
async fn roll_marks_drive_the_daily_series() {
    let store = mem_store().await;
    seed_customer(&store, "c1", None).await;
    let today = Utc::now().date_naive();
    let d1 = today.pred_opt().unwrap().pred_opt().unwrap();

    store
        .insert_ledger_line(&ledger_line("c1", d1, LedgerKind::Topup, "0", "1000", Some("f1")))
        .await
        .unwrap();
    store
        .insert_ledger_line(&ledger_line("c1", today, LedgerKind::Buy, "0.01", "-250", None))
        .await
        .unwrap();
    store.upsert_price_mark(SYMBOL, d1, dec("25000")).await.unwrap();

    let days = roller(&store).run_once().await.unwrap();
    assert_eq!(days, 3);

    let b = store.daily_balance("c1", d1).await.unwrap().unwrap();
    assert_eq!((b.base_balance, b.quote_balance, b.nav), (dec("0"), dec("1000"), dec("1000")));

    // The quiet middle day carries the close forward.
    let d2 = today.pred_opt().unwrap();
    let b = store.daily_balance("c1", d2).await.unwrap().unwrap();
    assert_eq!((b.base_balance, b.quote_balance, b.nav), (dec("0"), dec("1000"), dec("1000")));

    let b = store.daily_balance("c1", today).await.unwrap().unwrap();
    assert_eq!(b.base_balance, dec("0.01"));
    assert_eq!(b.quote_balance, dec("750"));
    // 0.01 BTC at the last mark (25000) plus cash.
    assert_eq!(b.nav, dec("1000"));

    assert!(store.dirty_roll_marks(ORG).await.unwrap().is_empty());
}

#[tokio::test]
async fn backfilled_lines_reopen_past_dates() {
    let store = mem_store().await;
    seed_customer(&store, "c1", None).await;
    let today = Utc::now().date_naive();
    let d2 = today.pred_opt().unwrap();
    let d1 = d2.pred_opt().unwrap();

    store
        .insert_ledger_line(&ledger_line("c1", d1, LedgerKind::Topup, "0", "1000", Some("f1")))
        .await
        .unwrap();
    store
        .insert_ledger_line(&ledger_line("c1", today, LedgerKind::Buy, "0.01", "-250", None))
        .await
        .unwrap();
    store.upsert_price_mark(SYMBOL, d1, dec("25000")).await.unwrap();
    let roller = roller(&store);
    roller.run_once().await.unwrap();

    // A late topup lands on the already-rolled middle day.
    store
        .insert_ledger_line(&ledger_line("c1", d2, LedgerKind::Topup, "0", "50", Some("f2")))
        .await
        .unwrap();
    let days = roller.run_once().await.unwrap();
    assert_eq!(days, 2);

    let b = store.daily_balance("c1", d1).await.unwrap().unwrap();
    assert_eq!(b.quote_balance, dec("1000"));
    let b = store.daily_balance("c1", d2).await.unwrap().unwrap();
    assert_eq!((b.quote_balance, b.nav), (dec("1050"), dec("1050")));
    let b = store.daily_balance("c1", today).await.unwrap().unwrap();
    assert_eq!(b.quote_balance, dec("800"));
    assert_eq!(b.nav, dec("1050"));
}

#[tokio::test]
async fn nav_without_a_price_mark_counts_quote_only() {
    let store = mem_store().await;
    seed_customer(&store, "c1", None).await;
    let today = Utc::now().date_naive();

    store
        .insert_ledger_line(&ledger_line("c1", today, LedgerKind::Buy, "0.01", "-250", None))
        .await
        .unwrap();
    roller(&store).run_once().await.unwrap();

    let b = store.daily_balance("c1", today).await.unwrap().unwrap();
    assert_eq!(b.base_balance, dec("0.01"));
    assert_eq!(b.nav, dec("-250"));
}

#[tokio::test]
async fn interrupted_roll_restarts_from_the_first_ledger_date() {
    let store = mem_store().await;
    seed_customer(&store, "c1", None).await;
    let today = Utc::now().date_naive();
    let d1 = today.pred_opt().unwrap().pred_opt().unwrap();

    store
        .insert_ledger_line(&ledger_line("c1", d1, LedgerKind::Topup, "0", "1000", Some("f1")))
        .await
        .unwrap();
    // Mark cleared without the roll ever running, as after a crash.
    let marks = store.dirty_roll_marks(ORG).await.unwrap();
    assert_eq!(marks.len(), 1);
    store.clear_roll_mark(ORG, "c1", marks[0].gen).await.unwrap();

    store
        .insert_ledger_line(&ledger_line("c1", today, LedgerKind::Buy, "0.01", "-250", None))
        .await
        .unwrap();

    // The new mark only covers today, but the d1 close was never built;
    // the walk restarts at the first ledger date.
    let days = roller(&store).run_once().await.unwrap();
    assert_eq!(days, 3);

    let b = store.daily_balance("c1", d1).await.unwrap().unwrap();
    assert_eq!(b.quote_balance, dec("1000"));
    let b = store.daily_balance("c1", today).await.unwrap().unwrap();
    assert_eq!((b.base_balance, b.quote_balance, b.nav), (dec("0.01"), dec("750"), dec("750")));
}
