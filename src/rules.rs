use anyhow::Result;
use rust_decimal::Decimal;

use crate::config::{parse_decimal, MarketCfg};

/// Venue lot rules for the traded market. All fields optional; an unset
/// or zero rule is a no-op.
#[derive(Debug, Clone)]
pub struct MarketRules {
    pub symbol: String,
    pub tick_size: Option<Decimal>,
    pub step_size: Option<Decimal>,
    pub min_qty: Option<Decimal>,
    pub min_notional: Option<Decimal>,
}

impl MarketRules {
    pub fn from_cfg(cfg: &MarketCfg) -> Result<Self> {
        Ok(MarketRules {
            symbol: cfg.symbol.clone(),
            tick_size: cfg
                .tick_size
                .as_deref()
                .map(|s| parse_decimal(s, "market.tick_size"))
                .transpose()?,
            step_size: cfg
                .step_size
                .as_deref()
                .map(|s| parse_decimal(s, "market.step_size"))
                .transpose()?,
            min_qty: cfg
                .min_qty
                .as_deref()
                .map(|s| parse_decimal(s, "market.min_qty"))
                .transpose()?,
            min_notional: cfg
                .min_notional
                .as_deref()
                .map(|s| parse_decimal(s, "market.min_notional"))
                .transpose()?,
        })
    }

    pub fn round_price_down(&self, price: Decimal) -> Decimal {
        match self.tick_size {
            Some(tick) if !tick.is_zero() => (price / tick).floor() * tick,
            _ => price,
        }
    }

    pub fn round_qty_down(&self, qty: Decimal) -> Decimal {
        match self.step_size {
            Some(step) if !step.is_zero() => (qty / step).floor() * step,
            _ => qty,
        }
    }

    /// Check an order against lot rules before it goes to the venue.
    /// `price` is the limit price, or the last traded price for market
    /// orders sized from a notional.
    pub fn validate(&self, price: Decimal, qty: Decimal) -> Result<()> {
        if qty <= Decimal::ZERO {
            anyhow::bail!("qty {} is not positive", qty);
        }
        if let Some(minq) = self.min_qty {
            if qty < minq {
                anyhow::bail!("qty {} < minQty {}", qty, minq);
            }
        }
        if let Some(minn) = self.min_notional {
            let notional = price * qty;
            if notional < minn {
                anyhow::bail!("notional {} < minNotional {}", notional, minn);
            }
        }
        Ok(())
    }
}
