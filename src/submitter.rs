use anyhow::Result;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::exchange::models::{map_order_status, PlaceOrderRequest};
use crate::exchange::rest::{ExchangeApi, ExchangeError};
use crate::observability::{Alerts, ORDERS_SUBMITTED, ORDER_REJECTIONS};
use crate::persistence::sqlite::SqliteStore;
use crate::realtime::WatchOrder;
use crate::rules::MarketRules;
use crate::types::{
    IntentStatus, NewExchangeOrder, OrderIntent, OrderStatus, OrderType, Severity,
};

#[derive(Debug, Clone)]
pub struct SubmitCfg {
    pub symbol: String,
    pub batch: usize,
    pub inter_call_delay_ms: u64,
}

/// Turns pending intents into venue orders. The intent id doubles as the
/// client order id, so a re-submission after a crash lands on the same
/// venue order instead of creating a second one.
pub struct OrderSubmitter {
    store: Arc<SqliteStore>,
    api: Arc<dyn ExchangeApi>,
    alerts: Alerts,
    rules: MarketRules,
    cfg: SubmitCfg,
}

impl OrderSubmitter {
    pub fn new(
        store: Arc<SqliteStore>,
        api: Arc<dyn ExchangeApi>,
        alerts: Alerts,
        rules: MarketRules,
        cfg: SubmitCfg,
    ) -> Self {
        OrderSubmitter {
            store,
            api,
            alerts,
            rules,
            cfg,
        }
    }

    /// Submit one batch of pending intents. Returns the orders that went
    /// live, for the push monitor to watch.
    pub async fn run_once(&self, now_ms: i64) -> Result<Vec<WatchOrder>> {
        let intents = self.store.pending_intents(self.cfg.batch).await?;
        let mut watch = Vec::new();
        for intent in intents {
            match self.submit_intent(&intent, now_ms).await {
                Ok(Some(w)) => watch.push(w),
                Ok(None) => {}
                Err(e) => {
                    // Transient venue trouble; the intent stays pending.
                    tracing::warn!(intent = %intent.id, error = ?e, "intent submission deferred");
                }
            }
            tokio::time::sleep(Duration::from_millis(self.cfg.inter_call_delay_ms)).await;
        }
        Ok(watch)
    }

    async fn submit_intent(
        &self,
        intent: &OrderIntent,
        now_ms: i64,
    ) -> Result<Option<WatchOrder>> {
        if let Some(existing) = self.store.non_error_order_for_intent(&intent.id).await? {
            tracing::debug!(
                intent = %intent.id,
                order = %existing.id,
                "intent already has a live order; healing status"
            );
            self.store
                .set_intent_status(&intent.id, IntentStatus::Executed)
                .await?;
            return Ok(None);
        }

        let sub = match self.store.customer(&intent.customer_id).await? {
            Some(c) if !c.active => {
                self.fail_intent(intent, Severity::Error, "customer is inactive", json!({}))
                    .await?;
                return Ok(None);
            }
            Some(c) => match c.venue_subaccount {
                Some(s) => s,
                None => {
                    self.fail_intent(
                        intent,
                        Severity::Critical,
                        "customer has no venue sub-account mapping",
                        json!({}),
                    )
                    .await?;
                    return Ok(None);
                }
            },
            None => {
                self.fail_intent(intent, Severity::Critical, "intent references an unknown customer", json!({}))
                    .await?;
                return Ok(None);
            }
        };

        // A limit price anchors sizing and validation; market orders use
        // the last traded price. The ticker call can fail transiently,
        // which leaves the intent pending for the next cycle.
        let reference_price = match intent.limit_price {
            Some(p) => self.rules.round_price_down(p),
            None => self.api.ticker(&self.cfg.symbol).await?.last,
        };
        if reference_price <= Decimal::ZERO {
            self.fail_intent(
                intent,
                Severity::Error,
                "no usable reference price for sizing",
                json!({ "reference_price": reference_price }),
            )
            .await?;
            return Ok(None);
        }

        let qty = match (intent.quantity, intent.notional) {
            (Some(q), None) => q,
            (None, Some(n)) => n / reference_price,
            _ => {
                self.fail_intent(
                    intent,
                    Severity::Error,
                    "intent must set exactly one of quantity and notional",
                    json!({}),
                )
                .await?;
                return Ok(None);
            }
        };
        let qty = self.rules.round_qty_down(qty);
        if let Err(e) = self.rules.validate(reference_price, qty) {
            self.fail_intent(
                intent,
                Severity::Error,
                "order violates market lot rules",
                json!({ "reason": e.to_string(), "qty": qty }),
            )
            .await?;
            return Ok(None);
        }

        let order_type = if intent.limit_price.is_some() {
            OrderType::Limit
        } else {
            OrderType::Market
        };
        let price = intent.limit_price.map(|p| self.rules.round_price_down(p));
        let req = PlaceOrderRequest {
            client_order_id: intent.id.clone(),
            symbol: self.cfg.symbol.clone(),
            side: intent.side,
            order_type,
            price,
            quantity: qty,
        };

        match self.api.place_order(&req, &sub).await {
            Ok(state) => {
                let status = map_order_status(&state.status).unwrap_or(OrderStatus::Submitted);
                let order_id = Uuid::new_v4().to_string();
                let inserted = self
                    .store
                    .insert_exchange_order(&NewExchangeOrder {
                        id: order_id.clone(),
                        org_id: intent.org_id.clone(),
                        intent_id: intent.id.clone(),
                        customer_id: intent.customer_id.clone(),
                        client_order_id: intent.id.clone(),
                        exchange_order_id: state.order_id.clone(),
                        replaces_order_id: None,
                        side: intent.side,
                        order_type,
                        price,
                        quantity: qty,
                        status,
                        submitted_at_ms: now_ms,
                        raw_payload: Some(serde_json::to_value(&state)?),
                    })
                    .await?;
                self.store
                    .set_intent_status(&intent.id, IntentStatus::Executed)
                    .await?;
                if !inserted {
                    tracing::warn!(
                        intent = %intent.id,
                        "client order id already recorded; concurrent submitter won"
                    );
                    return Ok(None);
                }
                ORDERS_SUBMITTED.inc();
                tracing::info!(
                    intent = %intent.id,
                    order = %order_id,
                    side = intent.side.as_str(),
                    order_type = order_type.as_str(),
                    %qty,
                    price = ?price,
                    "order submitted"
                );
                if status.is_terminal() {
                    return Ok(None);
                }
                Ok(Some(WatchOrder {
                    order_id,
                    client_order_id: intent.id.clone(),
                }))
            }
            Err(ExchangeError::Rejected { code, message }) => {
                ORDER_REJECTIONS.inc();
                let rejected = NewExchangeOrder {
                    id: Uuid::new_v4().to_string(),
                    org_id: intent.org_id.clone(),
                    intent_id: intent.id.clone(),
                    customer_id: intent.customer_id.clone(),
                    client_order_id: intent.id.clone(),
                    exchange_order_id: None,
                    replaces_order_id: None,
                    side: intent.side,
                    order_type,
                    price,
                    quantity: qty,
                    status: OrderStatus::Error,
                    submitted_at_ms: now_ms,
                    raw_payload: Some(json!({ "code": code, "message": message })),
                };
                self.store.insert_exchange_order(&rejected).await?;
                self.store
                    .set_intent_status(&intent.id, IntentStatus::Error)
                    .await?;
                let severity = if message.to_lowercase().contains("rate limit") {
                    Severity::Warn
                } else {
                    Severity::Error
                };
                self.alerts
                    .emit(
                        "submitter",
                        severity,
                        Some(&intent.customer_id),
                        "venue rejected order",
                        json!({ "intent_id": intent.id, "code": code, "message": message }),
                    )
                    .await;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn fail_intent(
        &self,
        intent: &OrderIntent,
        severity: Severity,
        message: &str,
        mut context: serde_json::Value,
    ) -> Result<()> {
        self.store
            .set_intent_status(&intent.id, IntentStatus::Error)
            .await?;
        if let Some(obj) = context.as_object_mut() {
            obj.insert("intent_id".into(), json!(intent.id));
        }
        self.alerts
            .emit(
                "submitter",
                severity,
                Some(&intent.customer_id),
                message,
                context,
            )
            .await;
        Ok(())
    }
}
