use anyhow::Result;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::exchange::rest::ExchangeApi;
use crate::observability::{Alerts, LEDGER_LINES_POSTED};
use crate::persistence::sqlite::SqliteStore;
use crate::types::{
    utc_date_from_ms, FeeTransfer, FeeTransferStatus, Fill, FundingEvent, FundingKind,
    FundingSource, LedgerKind, NewLedgerLine, Severity, Side,
};

const BATCH: usize = 200;

#[derive(Debug, Clone)]
pub struct SettleCfg {
    pub org_id: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub platform_fee_rate: Decimal,
    pub sweep_fees: bool,
    pub inter_call_delay_ms: u64,
}

#[derive(Debug, Default)]
pub struct SettleReport {
    pub fills_posted: usize,
    pub funding_posted: usize,
}

/// Turns fills and funding events into ledger lines, exactly once each.
/// Amount columns are gross; fee columns carry the deduction, so the net
/// effect of a line is amount minus fee.
pub struct SettlementPoster {
    store: Arc<SqliteStore>,
    api: Arc<dyn ExchangeApi>,
    alerts: Alerts,
    cfg: SettleCfg,
}

impl SettlementPoster {
    pub fn new(
        store: Arc<SqliteStore>,
        api: Arc<dyn ExchangeApi>,
        alerts: Alerts,
        cfg: SettleCfg,
    ) -> Self {
        SettlementPoster {
            store,
            api,
            alerts,
            cfg,
        }
    }

    pub async fn run_once(&self) -> Result<SettleReport> {
        let mut report = SettleReport::default();

        for fill in self.store.unsettled_fills(BATCH).await? {
            match self.post_fill(&fill).await {
                Ok(Some(_)) => report.fills_posted += 1,
                Ok(None) => {}
                Err(e) => {
                    self.alerts
                        .emit(
                            "settlement",
                            Severity::Error,
                            None,
                            "failed to settle fill",
                            json!({ "fill_id": fill.id, "error": e.to_string() }),
                        )
                        .await;
                }
            }
        }

        for ev in self.store.unposted_funding(BATCH).await? {
            match self.post_funding(&ev).await {
                Ok(Some(_)) => report.funding_posted += 1,
                Ok(None) => {}
                Err(e) => {
                    self.alerts
                        .emit(
                            "settlement",
                            Severity::Error,
                            Some(&ev.customer_id),
                            "failed to post funding event",
                            json!({ "funding_id": ev.id, "error": e.to_string() }),
                        )
                        .await;
                }
            }
        }

        if self.cfg.sweep_fees {
            self.sweep_pending_fees().await;
        }

        Ok(report)
    }

    /// Post one fill to the ledger. Returns the touched customer/date,
    /// or None when a line for this fill already exists.
    pub async fn post_fill(&self, fill: &Fill) -> Result<Option<(String, NaiveDate)>> {
        let Some(order) = self.store.exchange_order(&fill.order_id).await? else {
            self.alerts
                .emit(
                    "settlement",
                    Severity::Error,
                    None,
                    "fill references an unknown order",
                    json!({ "fill_id": fill.id, "order_id": fill.order_id }),
                )
                .await;
            return Ok(None);
        };

        let date = utc_date_from_ms(fill.traded_at_ms);
        let notional = fill.price * fill.quantity;
        let (kind, amount_base, amount_quote) = match order.side {
            Side::Buy => (LedgerKind::Buy, fill.quantity, -notional),
            Side::Sell => (LedgerKind::Sell, -fill.quantity, notional),
        };

        let mut note = None;
        let (fee_base, fee_quote) = match (&fill.fee_asset, fill.fee_quantity) {
            (Some(asset), Some(q)) if *asset == self.cfg.base_asset => (q, Decimal::ZERO),
            (Some(asset), Some(q)) if *asset == self.cfg.quote_asset => (Decimal::ZERO, q),
            (Some(asset), Some(q)) if !q.is_zero() => {
                self.alerts
                    .emit(
                        "settlement",
                        Severity::Warn,
                        Some(&order.customer_id),
                        "fill fee in unrecognized asset; recorded in note only",
                        json!({ "fill_id": fill.id, "fee_asset": asset, "fee_quantity": q }),
                    )
                    .await;
                note = Some(format!("venue fee {q} {asset} not netted"));
                (Decimal::ZERO, Decimal::ZERO)
            }
            _ => (Decimal::ZERO, Decimal::ZERO),
        };

        let inserted = self
            .store
            .insert_ledger_line(&NewLedgerLine {
                org_id: order.org_id.clone(),
                customer_id: order.customer_id.clone(),
                trade_date: date,
                kind,
                amount_base,
                amount_quote,
                fee_base,
                fee_quote,
                ref_fill_id: Some(fill.id),
                ref_funding_id: None,
                note,
                created_at_ms: now_ms(),
            })
            .await?;
        if !inserted {
            return Ok(None);
        }
        LEDGER_LINES_POSTED.inc();
        tracing::info!(
            customer = %order.customer_id,
            order = %order.id,
            fill = fill.id,
            kind = kind.as_str(),
            %notional,
            "fill settled"
        );
        Ok(Some((order.customer_id, date)))
    }

    /// Post one funding event. Manual and synced deposits are charged
    /// the platform fee; reconciliation correctives post at face value.
    pub async fn post_funding(&self, ev: &FundingEvent) -> Result<Option<(String, NaiveDate)>> {
        let bad_sign = match ev.kind {
            FundingKind::Deposit => ev.amount < Decimal::ZERO,
            FundingKind::Withdrawal => ev.amount > Decimal::ZERO,
        };
        if bad_sign {
            self.alerts
                .emit(
                    "settlement",
                    Severity::Error,
                    Some(&ev.customer_id),
                    "funding event amount sign disagrees with its kind",
                    json!({ "funding_id": ev.id, "kind": ev.kind.as_str(), "amount": ev.amount }),
                )
                .await;
            return Ok(None);
        }

        let fee = if ev.kind == FundingKind::Deposit && ev.source != FundingSource::Reconciliation
        {
            (ev.amount * self.cfg.platform_fee_rate).round_dp(8)
        } else {
            Decimal::ZERO
        };

        let (amount_base, amount_quote, fee_base, fee_quote) =
            if ev.asset == self.cfg.base_asset {
                (ev.amount, Decimal::ZERO, fee, Decimal::ZERO)
            } else if ev.asset == self.cfg.quote_asset {
                (Decimal::ZERO, ev.amount, Decimal::ZERO, fee)
            } else {
                self.alerts
                    .emit(
                        "settlement",
                        Severity::Error,
                        Some(&ev.customer_id),
                        "funding event in unsupported asset; not posted",
                        json!({ "funding_id": ev.id, "asset": ev.asset }),
                    )
                    .await;
                return Ok(None);
            };

        let kind = match ev.kind {
            FundingKind::Deposit => LedgerKind::Topup,
            FundingKind::Withdrawal => LedgerKind::Withdrawal,
        };
        let date = utc_date_from_ms(ev.occurred_at_ms);

        let inserted = self
            .store
            .insert_ledger_line(&NewLedgerLine {
                org_id: ev.org_id.clone(),
                customer_id: ev.customer_id.clone(),
                trade_date: date,
                kind,
                amount_base,
                amount_quote,
                fee_base,
                fee_quote,
                ref_fill_id: None,
                ref_funding_id: Some(ev.id.clone()),
                note: None,
                created_at_ms: now_ms(),
            })
            .await?;
        if !inserted {
            return Ok(None);
        }
        LEDGER_LINES_POSTED.inc();

        if fee > Decimal::ZERO {
            self.store
                .insert_fee_transfer(&FeeTransfer {
                    id: Uuid::new_v4().to_string(),
                    org_id: ev.org_id.clone(),
                    customer_id: ev.customer_id.clone(),
                    asset: ev.asset.clone(),
                    amount: fee,
                    venue_transfer_id: None,
                    status: FeeTransferStatus::Pending,
                    created_at_ms: now_ms(),
                })
                .await?;
        }

        tracing::info!(
            customer = %ev.customer_id,
            funding = %ev.id,
            kind = kind.as_str(),
            amount = %ev.amount,
            %fee,
            source = ev.source.as_str(),
            "funding posted"
        );
        Ok(Some((ev.customer_id.clone(), date)))
    }

    /// Move collected platform fees from customer sub-accounts to the
    /// operator's main account. Best effort: a failed transfer stays
    /// pending and is retried next cycle.
    async fn sweep_pending_fees(&self) {
        let pending = match self.store.pending_fee_transfers(BATCH).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = ?e, "failed to load pending fee transfers");
                return;
            }
        };
        for t in pending {
            let customer = match self.store.customer(&t.customer_id).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(error = ?e, transfer = %t.id, "customer lookup failed");
                    continue;
                }
            };
            let Some(sub) = customer.and_then(|c| c.venue_subaccount) else {
                self.alerts
                    .emit(
                        "settlement",
                        Severity::Critical,
                        Some(&t.customer_id),
                        "fee sweep blocked: customer has no sub-account mapping",
                        json!({ "transfer_id": t.id }),
                    )
                    .await;
                continue;
            };
            match self.api.transfer_to_main(&sub, &t.asset, t.amount).await {
                Ok(ack) => {
                    if let Err(e) = self
                        .store
                        .mark_fee_transfer_done(&t.id, Some(&ack.transfer_id))
                        .await
                    {
                        tracing::warn!(error = ?e, transfer = %t.id, "failed to mark sweep done");
                    } else {
                        tracing::info!(
                            transfer = %t.id,
                            venue_transfer = %ack.transfer_id,
                            amount = %t.amount,
                            asset = %t.asset,
                            "platform fee swept"
                        );
                    }
                }
                Err(e) => {
                    self.alerts
                        .emit(
                            "settlement",
                            Severity::Error,
                            Some(&t.customer_id),
                            "fee sweep failed; will retry",
                            json!({ "transfer_id": t.id, "error": e.to_string() }),
                        )
                        .await;
                }
            }
            tokio::time::sleep(Duration::from_millis(self.cfg.inter_call_delay_ms)).await;
        }
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
