use anyhow::Result;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::exchange::models::{map_order_status, OrderState, PlaceOrderRequest};
use crate::exchange::rest::{ExchangeApi, ExchangeError};
use crate::monitor::{apply_order_state, fetch_missing_fills};
use crate::observability::{Alerts, FALLBACK_CONVERSIONS, ORDER_REJECTIONS};
use crate::persistence::sqlite::SqliteStore;
use crate::realtime::WatchOrder;
use crate::rules::MarketRules;
use crate::settlement::SettlementPoster;
use crate::types::{
    ExchangeOrder, NewExchangeOrder, OrderStatus, OrderType, Severity,
};

#[derive(Debug, Clone)]
pub struct ConvertCfg {
    pub symbol: String,
    pub max_age_ms: i64,
    /// Fractional distance of last price from the resting limit that
    /// triggers conversion.
    pub price_move_threshold: Decimal,
    pub batch: usize,
    pub inter_call_delay_ms: u64,
}

/// Converts stale or adversely priced limit orders into market orders
/// for the unfilled remainder. This is the only component that cancels
/// anything. Fallback legs carry the deterministic client id
/// `{intent}-fb{n}`, so a crashed conversion resumes onto the same venue
/// order instead of double-buying.
pub struct FallbackConverter {
    store: Arc<SqliteStore>,
    api: Arc<dyn ExchangeApi>,
    alerts: Alerts,
    settlement: Arc<SettlementPoster>,
    rules: MarketRules,
    cfg: ConvertCfg,
}

impl FallbackConverter {
    pub fn new(
        store: Arc<SqliteStore>,
        api: Arc<dyn ExchangeApi>,
        alerts: Alerts,
        settlement: Arc<SettlementPoster>,
        rules: MarketRules,
        cfg: ConvertCfg,
    ) -> Self {
        FallbackConverter {
            store,
            api,
            alerts,
            settlement,
            rules,
            cfg,
        }
    }

    /// Review working limit legs once. Returns newly placed market legs
    /// for the push monitor.
    pub async fn run_once(&self, now_ms: i64) -> Result<Vec<WatchOrder>> {
        let candidates = self.store.fallback_candidates(self.cfg.batch).await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let last_price = self.api.ticker(&self.cfg.symbol).await?.last;
        let mut watch = Vec::new();
        for order in candidates {
            match self.review_order(&order, last_price, now_ms).await {
                Ok(Some(w)) => watch.push(w),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(order = %order.id, error = ?e, "fallback review failed");
                }
            }
            tokio::time::sleep(Duration::from_millis(self.cfg.inter_call_delay_ms)).await;
        }
        Ok(watch)
    }

    async fn review_order(
        &self,
        order: &ExchangeOrder,
        last_price: Decimal,
        now_ms: i64,
    ) -> Result<Option<WatchOrder>> {
        // Cancelled candidates are conversions interrupted mid-sequence;
        // the decision to convert was already made for them.
        let resuming = order.status.is_terminal();
        if !resuming {
            let aged = now_ms - order.submitted_at_ms >= self.cfg.max_age_ms;
            let moved = match order.price {
                Some(p) if p > Decimal::ZERO => {
                    ((last_price - p) / p).abs() >= self.cfg.price_move_threshold
                }
                _ => false,
            };
            if !aged && !moved {
                return Ok(None);
            }
            tracing::info!(
                order = %order.id,
                aged,
                moved,
                %last_price,
                limit = ?order.price,
                "limit order selected for market conversion"
            );
        } else {
            tracing::info!(
                order = %order.id,
                status = order.status.as_str(),
                "resuming interrupted conversion"
            );
        }

        let customer = self.store.customer(&order.customer_id).await?;
        let Some(sub) = customer.and_then(|c| c.venue_subaccount) else {
            self.alerts
                .emit(
                    "fallback",
                    Severity::Critical,
                    Some(&order.customer_id),
                    "customer has no venue sub-account mapping",
                    json!({ "order_id": order.id }),
                )
                .await;
            return Ok(None);
        };

        // Authoritative truth before touching anything: the order may
        // have filled since the poller last looked.
        let state = self
            .api
            .order_by_client_id(&order.client_order_id, &sub)
            .await?;
        let mut status = self.record(order, &state, &sub, now_ms).await?;

        if !status.is_terminal() {
            if let Some(vid) = state
                .order_id
                .clone()
                .or_else(|| order.exchange_order_id.clone())
            {
                // A cancel rejected because the order just filled or was
                // already cancelled is indistinguishable from success
                // here; the re-query below decides.
                if let Err(e) = self.api.cancel_order(&vid, &sub).await {
                    tracing::warn!(order = %order.id, error = ?e, "cancel failed; re-querying");
                }
            }
            let state2 = self
                .api
                .order_by_client_id(&order.client_order_id, &sub)
                .await?;
            status = self.record(order, &state2, &sub, now_ms).await?;
        }

        if status == OrderStatus::Filled {
            // Fully filled during the race; nothing to convert.
            self.store.set_fallback_done(&order.id).await?;
            return Ok(None);
        }
        if !status.is_terminal() {
            // Cancel has not landed on the venue yet. Leave the row for
            // the next cycle rather than guessing the remainder.
            return Ok(None);
        }

        let refreshed = self.store.exchange_order(&order.id).await?;
        let executed = refreshed
            .map(|o| o.executed_qty)
            .unwrap_or(order.executed_qty);
        let remaining = self.rules.round_qty_down(order.quantity - executed);
        if remaining <= Decimal::ZERO {
            self.store.set_fallback_done(&order.id).await?;
            return Ok(None);
        }

        self.store.mark_cancelled_for_market(&order.id).await?;
        let n = self.store.chain_len(&order.intent_id).await?;
        let client_id = format!("{}-fb{}", order.intent_id, n);
        let req = PlaceOrderRequest {
            client_order_id: client_id.clone(),
            symbol: self.cfg.symbol.clone(),
            side: order.side,
            order_type: OrderType::Market,
            price: None,
            quantity: remaining,
        };

        match self.api.place_order(&req, &sub).await {
            Ok(ack) => {
                let new_id = Uuid::new_v4().to_string();
                let inserted = self
                    .store
                    .insert_exchange_order(&NewExchangeOrder {
                        id: new_id.clone(),
                        org_id: order.org_id.clone(),
                        intent_id: order.intent_id.clone(),
                        customer_id: order.customer_id.clone(),
                        client_order_id: client_id.clone(),
                        exchange_order_id: ack.order_id.clone(),
                        replaces_order_id: Some(order.id.clone()),
                        side: order.side,
                        order_type: OrderType::Market,
                        price: None,
                        quantity: remaining,
                        status: map_order_status(&ack.status).unwrap_or(OrderStatus::Submitted),
                        submitted_at_ms: now_ms,
                        raw_payload: Some(serde_json::to_value(&ack)?),
                    })
                    .await?;
                self.store.set_fallback_done(&order.id).await?;
                if !inserted {
                    tracing::warn!(
                        order = %order.id,
                        "fallback client id already recorded; concurrent converter won"
                    );
                    return Ok(None);
                }
                FALLBACK_CONVERSIONS.inc();
                tracing::info!(
                    order = %order.id,
                    successor = %new_id,
                    %remaining,
                    "limit remainder re-submitted as market order"
                );
                Ok(Some(WatchOrder {
                    order_id: new_id,
                    client_order_id: client_id,
                }))
            }
            Err(ExchangeError::Rejected { code, message }) => {
                ORDER_REJECTIONS.inc();
                // Record the dead leg so the chain has an end, then stop.
                // No further automatic attempt is made for this intent.
                let _ = self
                    .store
                    .insert_exchange_order(&NewExchangeOrder {
                        id: Uuid::new_v4().to_string(),
                        org_id: order.org_id.clone(),
                        intent_id: order.intent_id.clone(),
                        customer_id: order.customer_id.clone(),
                        client_order_id: client_id,
                        exchange_order_id: None,
                        replaces_order_id: Some(order.id.clone()),
                        side: order.side,
                        order_type: OrderType::Market,
                        price: None,
                        quantity: remaining,
                        status: OrderStatus::Error,
                        submitted_at_ms: now_ms,
                        raw_payload: Some(json!({ "code": code, "message": message })),
                    })
                    .await?;
                self.store.set_fallback_done(&order.id).await?;
                self.alerts
                    .emit(
                        "fallback",
                        Severity::Critical,
                        Some(&order.customer_id),
                        "venue rejected fallback market order; remainder unexecuted",
                        json!({
                            "order_id": order.id,
                            "intent_id": order.intent_id,
                            "remaining": remaining,
                            "code": code,
                            "message": message,
                        }),
                    )
                    .await;
                Ok(None)
            }
            // Transient failure: the predecessor stays cancelled with no
            // successor and is resumed on the next pass.
            Err(e) => Err(e.into()),
        }
    }

    async fn record(
        &self,
        order: &ExchangeOrder,
        state: &OrderState,
        sub: &str,
        now_ms: i64,
    ) -> Result<OrderStatus> {
        let fills = fetch_missing_fills(&self.store, self.api.as_ref(), order, state, sub).await?;
        apply_order_state(
            &self.store,
            &self.alerts,
            &self.settlement,
            order,
            state,
            &fills,
            crate::types::UpdateSource::Poll,
            now_ms,
        )
        .await
    }
}
