use anyhow::Result;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::exchange::models::{map_order_status, OrderState, VenueFill};
use crate::exchange::rest::ExchangeApi;
use crate::observability::{Alerts, FILLS_RECORDED};
use crate::persistence::sqlite::{OrderUpdateArgs, SqliteStore};
use crate::settlement::SettlementPoster;
use crate::types::{ExchangeOrder, NewFill, OrderStatus, Severity, UpdateSource};

/// Fetch fills from the venue when it reports more executed quantity
/// than our fill rows sum to. Push updates may carry no per-fill
/// detail, so the gap check runs against recorded rows, not the stored
/// executed counter.
pub async fn fetch_missing_fills(
    store: &SqliteStore,
    api: &dyn ExchangeApi,
    order: &ExchangeOrder,
    state: &OrderState,
    subaccount: &str,
) -> Result<Vec<VenueFill>> {
    if state.executed_quantity <= Decimal::ZERO {
        return Ok(Vec::new());
    }
    let recorded: Decimal = store
        .fills_for_order(&order.id)
        .await?
        .iter()
        .map(|f| f.quantity)
        .sum();
    if recorded >= state.executed_quantity {
        return Ok(Vec::new());
    }
    let Some(venue_id) = state
        .order_id
        .clone()
        .or_else(|| order.exchange_order_id.clone())
    else {
        return Ok(Vec::new());
    };
    Ok(api.order_fills(&venue_id, subaccount).await?)
}

/// Record one venue-observed order state: fills first (deduplicated),
/// then the forward-only status move, then settlement of any new fills.
/// Both the poller and the push monitor funnel through here, so the
/// arbitration between them lives in exactly one place.
pub async fn apply_order_state(
    store: &SqliteStore,
    alerts: &Alerts,
    settlement: &SettlementPoster,
    order: &ExchangeOrder,
    state: &OrderState,
    venue_fills: &[VenueFill],
    source: UpdateSource,
    now_ms: i64,
) -> Result<OrderStatus> {
    let Some(incoming) = map_order_status(&state.status) else {
        alerts
            .emit(
                "monitor",
                Severity::Warn,
                Some(&order.customer_id),
                "unknown venue order status; leaving stored state untouched",
                json!({ "order_id": order.id, "venue_status": state.status }),
            )
            .await;
        return Ok(order.status);
    };

    let fills: Vec<NewFill> = venue_fills
        .iter()
        .map(|f| NewFill {
            order_id: order.id.clone(),
            venue_trade_id: f.trade_id.clone(),
            traded_at_ms: f.traded_at_ms,
            price: f.price,
            quantity: f.quantity,
            fee_asset: f.fee_asset.clone(),
            fee_quantity: f.fee_quantity,
        })
        .collect();

    let raw = serde_json::to_value(state)?;
    let outcome = store
        .apply_order_update(OrderUpdateArgs {
            order_id: order.id.clone(),
            incoming,
            executed_qty: state.executed_quantity,
            cumulative_quote_qty: state.cumulative_quote_quantity,
            exchange_order_id: state.order_id.clone(),
            raw,
            fills,
            source,
            now_ms,
        })
        .await?;

    if !outcome.new_fills.is_empty() {
        FILLS_RECORDED.inc_by(outcome.new_fills.len() as u64);
    }
    for fill in &outcome.new_fills {
        // The unsettled-fills sweep retries anything that fails here.
        if let Err(e) = settlement.post_fill(fill).await {
            tracing::warn!(fill_id = fill.id, error = ?e, "fill settlement deferred to sweep");
        }
    }

    if outcome.applied && outcome.status != order.status {
        tracing::info!(
            order = %order.id,
            from = order.status.as_str(),
            to = outcome.status.as_str(),
            source = ?source,
            "order status advanced"
        );
        if outcome.status == OrderStatus::Error {
            let severity = if order.replaces_order_id.is_some() {
                // A dead fallback leg leaves the intent's remainder
                // unexecuted with nothing else in flight.
                Severity::Critical
            } else {
                Severity::Error
            };
            alerts
                .emit(
                    "monitor",
                    severity,
                    Some(&order.customer_id),
                    "order moved to error on venue",
                    json!({ "order_id": order.id, "intent_id": order.intent_id }),
                )
                .await;
        }
    }

    Ok(outcome.status)
}

#[derive(Debug, Clone)]
pub struct MonitorCfg {
    pub poll_grace_ms: i64,
    pub push_grace_ms: i64,
    pub batch: usize,
    pub inter_call_delay_ms: u64,
}

#[derive(Debug, Default)]
pub struct MonitorReport {
    pub polled: usize,
    pub terminal: usize,
    pub failed: usize,
}

/// Poll-based safety net behind the push stream. Walks non-terminal
/// orders that neither channel has touched recently and re-queries the
/// venue for each.
pub struct OrderMonitor {
    store: Arc<SqliteStore>,
    api: Arc<dyn ExchangeApi>,
    alerts: Alerts,
    settlement: Arc<SettlementPoster>,
    cfg: MonitorCfg,
}

impl OrderMonitor {
    pub fn new(
        store: Arc<SqliteStore>,
        api: Arc<dyn ExchangeApi>,
        alerts: Alerts,
        settlement: Arc<SettlementPoster>,
        cfg: MonitorCfg,
    ) -> Self {
        OrderMonitor {
            store,
            api,
            alerts,
            settlement,
            cfg,
        }
    }

    pub async fn run_once(&self, now_ms: i64) -> Result<MonitorReport> {
        let due = self
            .store
            .orders_due_for_poll(
                now_ms,
                self.cfg.poll_grace_ms,
                self.cfg.push_grace_ms,
                self.cfg.batch,
            )
            .await?;
        let mut report = MonitorReport::default();
        for order in due {
            report.polled += 1;
            match self.poll_order(&order, now_ms).await {
                Ok(status) if status.is_terminal() => report.terminal += 1,
                Ok(_) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(order = %order.id, error = ?e, "order poll failed");
                    // Keep the freshness stamp moving so one broken order
                    // cannot pin the whole batch on itself.
                    let _ = self.store.touch_polled(&order.id, now_ms).await;
                }
            }
            tokio::time::sleep(Duration::from_millis(self.cfg.inter_call_delay_ms)).await;
        }
        if report.polled > 0 {
            tracing::debug!(
                polled = report.polled,
                terminal = report.terminal,
                failed = report.failed,
                "poll cycle complete"
            );
        }
        Ok(report)
    }

    async fn poll_order(&self, order: &ExchangeOrder, now_ms: i64) -> Result<OrderStatus> {
        let customer = self.store.customer(&order.customer_id).await?;
        let Some(sub) = customer.and_then(|c| c.venue_subaccount) else {
            self.alerts
                .emit(
                    "monitor",
                    Severity::Critical,
                    Some(&order.customer_id),
                    "customer has no venue sub-account mapping",
                    json!({ "order_id": order.id }),
                )
                .await;
            self.store.touch_polled(&order.id, now_ms).await?;
            return Ok(order.status);
        };

        let state = self
            .api
            .order_by_client_id(&order.client_order_id, &sub)
            .await?;
        let fills =
            fetch_missing_fills(&self.store, self.api.as_ref(), order, &state, &sub).await?;

        apply_order_state(
            &self.store,
            &self.alerts,
            &self.settlement,
            order,
            &state,
            &fills,
            UpdateSource::Poll,
            now_ms,
        )
        .await
    }
}
