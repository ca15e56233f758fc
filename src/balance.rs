use anyhow::Result;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::persistence::sqlite::SqliteStore;
use crate::types::DailyBalance;

/// Maintains the per-customer daily balance series. Rows are derived
/// data: each day is fully re-computed from the previous day's close
/// plus that day's ledger lines, so re-rolling a date is idempotent and
/// late fills propagate by rolling forward from the day they landed on.
/// Work is driven by the roll marks every ledger write leaves behind; a
/// roll interrupted by a crash finds its mark still set on the next run.
pub struct BalanceRoller {
    store: Arc<SqliteStore>,
    org_id: String,
    symbol: String,
}

impl BalanceRoller {
    pub fn new(store: Arc<SqliteStore>, org_id: String, symbol: String) -> Self {
        BalanceRoller {
            store,
            org_id,
            symbol,
        }
    }

    /// Re-roll every customer with a dirty mark, each from the earliest
    /// dirty date through today. Marks that moved while rolling stay set.
    pub async fn run_once(&self) -> Result<usize> {
        let mut days = 0;
        for mark in self.store.dirty_roll_marks(&self.org_id).await? {
            match self.roll_forward(&mark.customer_id, mark.dirty_from).await {
                Ok(n) => {
                    days += n;
                    self.store
                        .clear_roll_mark(&self.org_id, &mark.customer_id, mark.gen)
                        .await?;
                }
                Err(e) => {
                    tracing::warn!(customer = %mark.customer_id, error = ?e, "balance roll failed");
                }
            }
        }
        Ok(days)
    }

    /// Rebuild the daily series for one customer from `from` through the
    /// current UTC date. If the day before `from` has no balance row but
    /// earlier ledger lines exist, a previous roll was interrupted and
    /// the rebuild restarts at the customer's first ledger date.
    pub async fn roll_forward(&self, customer_id: &str, from: NaiveDate) -> Result<usize> {
        let mut from = from;
        let prev_close = match from.pred_opt() {
            Some(prev) => self.store.daily_balance(customer_id, prev).await?,
            None => None,
        };
        let (mut base, mut quote) = match prev_close {
            Some(b) => (b.base_balance, b.quote_balance),
            None => {
                if let Some(first) = self.store.earliest_ledger_date(customer_id).await? {
                    if first < from {
                        from = first;
                    }
                }
                (Decimal::ZERO, Decimal::ZERO)
            }
        };
        // A corrupt venue timestamp parses to a far-past trade date.
        // Refuse to walk pre-epoch days; the excluded lines surface as
        // reconciler drift instead of an unbounded loop here.
        let epoch = NaiveDate::default();
        if from < epoch {
            tracing::warn!(customer = %customer_id, %from, "pre-epoch ledger date clamped");
            from = epoch;
        }

        let today = Utc::now().date_naive();
        let mut date = from;
        let mut days = 0usize;
        while date <= today {
            for line in self.store.ledger_lines_for_date(customer_id, date).await? {
                base += line.amount_base - line.fee_base;
                quote += line.amount_quote - line.fee_quote;
            }
            let nav = match self.store.price_at_or_before(&self.symbol, date).await? {
                Some(price) => base * price + quote,
                None => {
                    if base != Decimal::ZERO {
                        tracing::warn!(
                            customer = %customer_id,
                            %date,
                            "no price mark at or before date; NAV omits base holdings"
                        );
                    }
                    quote
                }
            };
            self.store
                .upsert_daily_balance(&DailyBalance {
                    org_id: self.org_id.clone(),
                    customer_id: customer_id.to_string(),
                    date,
                    base_balance: base,
                    quote_balance: quote,
                    nav,
                })
                .await?;
            days += 1;
            let Some(next) = date.succ_opt() else { break };
            date = next;
        }
        tracing::debug!(customer = %customer_id, %from, days, "daily balances rolled");
        Ok(days)
    }
}
