use dca_engine::rules::MarketRules;
use rust_decimal::Decimal;
use std::str::FromStr;

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

fn rules() -> MarketRules {
    MarketRules {
        symbol: "BTC-USD".to_string(),
        tick_size: Some(dec("0.10")),
        step_size: Some(dec("0.001")),
        min_qty: Some(dec("0.001")),
        min_notional: Some(dec("10")),
    }
}

#[test]
fn rounding_down_respects_tick_and_step() {
    let rules = rules();
    assert_eq!(rules.round_price_down(dec("100.17")), dec("100.10"));
    assert_eq!(rules.round_qty_down(dec("0.0019")), dec("0.001"));
    assert_eq!(rules.round_qty_down(dec("0.002")), dec("0.002"));
}

#[test]
fn validation_enforces_lot_minimums() {
    let rules = rules();
    assert!(rules.validate(dec("25000"), dec("0.001")).is_ok());
    assert!(rules.validate(dec("25000"), dec("0.0005")).is_err());
    assert!(rules.validate(dec("25000"), Decimal::ZERO).is_err());
    // 1 * 0.001 = 0.001 notional, far below the 10 minimum.
    assert!(rules.validate(dec("1"), dec("0.001")).is_err());
}

#[test]
fn unset_rules_are_no_ops() {
    let rules = MarketRules {
        symbol: "BTC-USD".to_string(),
        tick_size: None,
        step_size: None,
        min_qty: None,
        min_notional: None,
    };
    assert_eq!(rules.round_price_down(dec("100.17")), dec("100.17"));
    assert_eq!(rules.round_qty_down(dec("0.0019")), dec("0.0019"));
    assert!(rules.validate(dec("1"), dec("0.0000001")).is_ok());
}
