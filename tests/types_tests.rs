use chrono::NaiveDate;
use dca_engine::exchange::models::{classify_transaction, map_order_status, TxClass};
use dca_engine::types::{utc_date_from_ms, OrderStatus};

#[test]
fn status_arbitration_lets_fills_outrank_cancels() {
    use OrderStatus::*;

    // Working rows accept refreshes at the same rank and anything above.
    assert!(Submitted.admits(Submitted));
    assert!(Submitted.admits(PartiallyFilled));
    assert!(Submitted.admits(Cancelled));
    assert!(Submitted.admits(Filled));
    assert!(!PartiallyFilled.admits(Submitted));
    assert!(PartiallyFilled.admits(PartiallyFilled));

    // Terminal rows only yield to a strictly higher rank: a late fill
    // report overrides a cancel, never the other way around.
    assert!(Cancelled.admits(Filled));
    assert!(CancelledForMarket.admits(Filled));
    assert!(Error.admits(Filled));
    assert!(!Cancelled.admits(Cancelled));
    assert!(!Cancelled.admits(Error));
    assert!(!Filled.admits(Cancelled));
    assert!(!Filled.admits(Filled));
    assert!(!Filled.admits(PartiallyFilled));
}

#[test]
fn terminal_statuses_are_everything_but_working_states() {
    assert!(!OrderStatus::Submitted.is_terminal());
    assert!(!OrderStatus::PartiallyFilled.is_terminal());
    assert!(OrderStatus::Filled.is_terminal());
    assert!(OrderStatus::Cancelled.is_terminal());
    assert!(OrderStatus::CancelledForMarket.is_terminal());
    assert!(OrderStatus::Error.is_terminal());
}

#[test]
fn venue_status_vocabulary_maps_onto_ours() {
    assert_eq!(map_order_status("open"), Some(OrderStatus::Submitted));
    assert_eq!(map_order_status("new"), Some(OrderStatus::Submitted));
    assert_eq!(map_order_status("partially_filled"), Some(OrderStatus::PartiallyFilled));
    assert_eq!(map_order_status("filled"), Some(OrderStatus::Filled));
    assert_eq!(map_order_status("canceled"), Some(OrderStatus::Cancelled));
    assert_eq!(map_order_status("cancelled"), Some(OrderStatus::Cancelled));
    assert_eq!(map_order_status("expired"), Some(OrderStatus::Cancelled));
    assert_eq!(map_order_status("rejected"), Some(OrderStatus::Error));
    assert_eq!(map_order_status("frozen"), None);
}

#[test]
fn transaction_kinds_classify_or_are_rejected() {
    assert_eq!(classify_transaction("deposit"), Some(TxClass::Deposit));
    assert_eq!(classify_transaction("withdrawal"), Some(TxClass::Withdrawal));
    assert_eq!(classify_transaction("transfer_in"), Some(TxClass::TransferIn));
    assert_eq!(classify_transaction("transfer_out"), Some(TxClass::TransferOut));
    assert_eq!(classify_transaction("conversion"), Some(TxClass::Conversion));
    assert_eq!(classify_transaction("staking_reward"), None);
}

#[test]
fn trade_dates_derive_from_utc_milliseconds() {
    assert_eq!(
        utc_date_from_ms(0),
        NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()
    );
    assert_eq!(
        utc_date_from_ms(1_700_000_000_000),
        NaiveDate::from_ymd_opt(2023, 11, 14).unwrap()
    );
    // Out-of-range timestamps clamp instead of panicking.
    assert_eq!(utc_date_from_ms(i64::MIN), NaiveDate::MIN);
}
