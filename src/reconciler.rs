use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::exchange::models::{classify_transaction, TxClass, VenueTransaction};
use crate::exchange::rest::ExchangeApi;
use crate::observability::{Alerts, FUNDING_EVENTS_CREATED, RECON_RUNS};
use crate::persistence::sqlite::SqliteStore;
use crate::settlement::SettlementPoster;
use crate::types::{Customer, FundingEvent, FundingKind, FundingSource, Severity};

const MAX_PAGES: usize = 1000;

#[derive(Debug, Clone)]
pub struct ReconCfg {
    pub org_id: String,
    pub base_asset: String,
    pub quote_asset: String,
    /// Overlap window re-read behind the cursor each run, so rows the
    /// venue published late are still picked up.
    pub lookback_ms: i64,
    pub page_limit: u32,
    pub base_tolerance: Decimal,
    pub quote_tolerance: Decimal,
    pub auto_correct: bool,
    pub inter_call_delay_ms: u64,
}

/// Ingests the venue's funding transactions and compares venue balances
/// against the ledger. Everything it books goes through the same
/// idempotent funding path as manual entries, so re-reading a window is
/// harmless.
pub struct Reconciler {
    store: Arc<SqliteStore>,
    api: Arc<dyn ExchangeApi>,
    alerts: Alerts,
    settlement: Arc<SettlementPoster>,
    cfg: ReconCfg,
}

impl Reconciler {
    pub fn new(
        store: Arc<SqliteStore>,
        api: Arc<dyn ExchangeApi>,
        alerts: Alerts,
        settlement: Arc<SettlementPoster>,
        cfg: ReconCfg,
    ) -> Self {
        Reconciler {
            store,
            api,
            alerts,
            settlement,
            cfg,
        }
    }

    /// One sweep over all active customers. Returns the number of
    /// funding events booked.
    pub async fn run_once(&self) -> Result<usize> {
        RECON_RUNS.inc();
        let mut booked = 0;
        for customer in self.store.active_customers().await? {
            let Some(sub) = customer.venue_subaccount.clone() else {
                tracing::debug!(customer = %customer.id, "no sub-account; skipped");
                continue;
            };
            match self.reconcile_customer(&customer, &sub).await {
                Ok(n) => booked += n,
                Err(e) => {
                    tracing::warn!(customer = %customer.id, error = ?e, "reconciliation failed");
                }
            }
            tokio::time::sleep(Duration::from_millis(self.cfg.inter_call_delay_ms)).await;
        }
        Ok(booked)
    }

    async fn reconcile_customer(&self, customer: &Customer, sub: &str) -> Result<usize> {
        let mut booked = self.ingest_transactions(customer, sub).await?;
        booked += self.check_drift(customer, sub).await?;
        Ok(booked)
    }

    /// Walk the venue transaction feed from just behind the stored
    /// cursor. The cursor advances only after a complete walk; a failed
    /// page leaves it where it was and the next run re-reads.
    async fn ingest_transactions(&self, customer: &Customer, sub: &str) -> Result<usize> {
        let cursor_ms = self
            .store
            .recon_cursor(&self.cfg.org_id, &customer.id)
            .await?;
        let since_ms = (cursor_ms - self.cfg.lookback_ms).max(0);
        let mut page_cursor: Option<String> = None;
        let mut max_seen = cursor_ms;
        let mut pages = 0usize;
        let mut booked = 0usize;
        loop {
            let page = self
                .api
                .transactions(sub, since_ms, page_cursor.as_deref(), self.cfg.page_limit)
                .await?;
            for tx in &page.items {
                max_seen = max_seen.max(tx.occurred_at_ms);
                if self.book_transaction(customer, tx).await? {
                    booked += 1;
                }
            }
            pages += 1;
            match page.next_cursor {
                Some(next) if !page.items.is_empty() => {
                    if pages >= MAX_PAGES {
                        tracing::warn!(
                            customer = %customer.id,
                            pages,
                            "transaction walk cut off; cursor not advanced"
                        );
                        return Ok(booked);
                    }
                    page_cursor = Some(next);
                }
                _ => break,
            }
            tokio::time::sleep(Duration::from_millis(self.cfg.inter_call_delay_ms)).await;
        }
        self.store
            .set_recon_cursor(&self.cfg.org_id, &customer.id, max_seen)
            .await?;
        Ok(booked)
    }

    async fn book_transaction(&self, customer: &Customer, tx: &VenueTransaction) -> Result<bool> {
        let Some(class) = classify_transaction(&tx.kind) else {
            self.alerts
                .emit(
                    "reconciler",
                    Severity::Warn,
                    Some(&customer.id),
                    "unrecognized venue transaction kind; skipped",
                    json!({ "tx_id": tx.tx_id, "kind": tx.kind, "amount": tx.amount }),
                )
                .await;
            return Ok(false);
        };
        let kind = match class {
            TxClass::Deposit | TxClass::TransferIn => FundingKind::Deposit,
            TxClass::Withdrawal => FundingKind::Withdrawal,
            TxClass::TransferOut => {
                // Our own fee sweeps land in this feed as outbound
                // transfers. Matching one completes the sweep instead of
                // booking a customer withdrawal.
                if self
                    .store
                    .match_fee_sweep(&customer.id, &tx.tx_id, &tx.asset, tx.amount.abs())
                    .await?
                {
                    tracing::debug!(customer = %customer.id, tx = %tx.tx_id, "fee sweep confirmed");
                    return Ok(false);
                }
                FundingKind::Withdrawal
            }
            TxClass::Conversion => {
                // Conversions move value between assets without crossing
                // the account boundary. Ours come through the order flow,
                // so any seen here are foreign.
                self.alerts
                    .emit(
                        "reconciler",
                        Severity::Warn,
                        Some(&customer.id),
                        "venue conversion outside the order flow; not booked",
                        json!({ "tx_id": tx.tx_id, "asset": tx.asset, "amount": tx.amount }),
                    )
                    .await;
                return Ok(false);
            }
        };

        let ev = FundingEvent {
            id: Uuid::new_v4().to_string(),
            org_id: self.cfg.org_id.clone(),
            customer_id: customer.id.clone(),
            kind,
            asset: tx.asset.clone(),
            amount: tx.amount,
            occurred_at_ms: tx.occurred_at_ms,
            idempotency_key: format!("venuetx:{}", tx.tx_id),
            source: FundingSource::Sync,
        };
        if !self.store.insert_funding_event(&ev).await? {
            return Ok(false);
        }
        FUNDING_EVENTS_CREATED.inc();
        tracing::info!(
            customer = %customer.id,
            kind = ev.kind.as_str(),
            asset = %ev.asset,
            amount = %ev.amount,
            tx = %tx.tx_id,
            "venue funding event booked"
        );
        // Post right away so the drift check below sees a current ledger.
        // The settlement sweep picks it up anyway if this fails.
        if let Err(e) = self.settlement.post_funding(&ev).await {
            tracing::warn!(customer = %customer.id, error = ?e, "funding post deferred");
        }
        Ok(true)
    }

    /// Compare venue balances for the traded pair against the ledger,
    /// net of sweeps that have not left the venue account yet. Skipped
    /// while anything is in flight for the customer.
    async fn check_drift(&self, customer: &Customer, sub: &str) -> Result<usize> {
        if self.store.has_open_activity(&customer.id).await? {
            tracing::debug!(customer = %customer.id, "drift check skipped; activity in flight");
            return Ok(0);
        }
        let venue = self.api.balances(sub).await?;
        let (ledger_base, ledger_quote) = self.store.ledger_balance(&customer.id).await?;
        let mut pending: HashMap<String, Decimal> = HashMap::new();
        for (asset, amount) in self.store.pending_fee_amounts(&customer.id).await? {
            *pending.entry(asset).or_insert(Decimal::ZERO) += amount;
        }

        let today = Utc::now().date_naive();
        let mut booked = 0usize;
        let checks = [
            (&self.cfg.base_asset, ledger_base, self.cfg.base_tolerance),
            (&self.cfg.quote_asset, ledger_quote, self.cfg.quote_tolerance),
        ];
        for (asset, ledger_total, tolerance) in checks {
            let venue_total = venue
                .iter()
                .find(|b| b.asset == *asset)
                .map(|b| b.total)
                .unwrap_or(Decimal::ZERO);
            let expected =
                ledger_total + pending.get(asset.as_str()).copied().unwrap_or(Decimal::ZERO);
            let drift = venue_total - expected;
            if drift.abs() <= tolerance {
                continue;
            }
            self.alerts
                .emit(
                    "reconciler",
                    Severity::Error,
                    Some(&customer.id),
                    "venue balance drifted from ledger",
                    json!({
                        "asset": asset,
                        "venue": venue_total,
                        "expected": expected,
                        "drift": drift,
                        "auto_correct": self.cfg.auto_correct,
                    }),
                )
                .await;
            if !self.cfg.auto_correct {
                continue;
            }
            let ev = FundingEvent {
                id: Uuid::new_v4().to_string(),
                org_id: self.cfg.org_id.clone(),
                customer_id: customer.id.clone(),
                kind: if drift > Decimal::ZERO {
                    FundingKind::Deposit
                } else {
                    FundingKind::Withdrawal
                },
                asset: asset.clone(),
                amount: drift,
                occurred_at_ms: Utc::now().timestamp_millis(),
                // One correction per customer, asset and day; repeated
                // runs inside a day see the corrected ledger instead of
                // stacking further corrections.
                idempotency_key: format!("drift:{}:{}:{}", customer.id, asset, today),
                source: FundingSource::Reconciliation,
            };
            if self.store.insert_funding_event(&ev).await? {
                FUNDING_EVENTS_CREATED.inc();
                booked += 1;
                tracing::info!(
                    customer = %customer.id,
                    asset = %asset,
                    %drift,
                    "corrective funding event booked"
                );
                self.settlement.post_funding(&ev).await?;
            }
        }
        Ok(booked)
    }
}
