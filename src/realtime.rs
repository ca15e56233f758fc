use lru::LruCache;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::exchange::models::VenueFill;
use crate::exchange::push::PushClient;
use crate::monitor::apply_order_state;
use crate::observability::Alerts;
use crate::persistence::sqlite::SqliteStore;
use crate::settlement::SettlementPoster;
use crate::types::UpdateSource;

/// A freshly submitted order the push monitor should follow.
#[derive(Debug, Clone)]
pub struct WatchOrder {
    pub order_id: String,
    pub client_order_id: String,
}

#[derive(Debug, Clone)]
pub struct RealtimeCfg {
    pub base_timeout_sec: u64,
    pub per_order_timeout_sec: u64,
}

/// Short-lived push sessions over the venue's order stream. Each watch
/// runs for a bounded window scaled by batch size, then hands anything
/// still open back to the poller. Every failure here is tolerated
/// silently because polling alone is sufficient for correctness.
pub struct RealtimeOrderMonitor {
    store: Arc<SqliteStore>,
    alerts: Alerts,
    settlement: Arc<SettlementPoster>,
    push: PushClient,
    cfg: RealtimeCfg,
}

impl RealtimeOrderMonitor {
    pub fn new(
        store: Arc<SqliteStore>,
        alerts: Alerts,
        settlement: Arc<SettlementPoster>,
        push: PushClient,
        cfg: RealtimeCfg,
    ) -> Self {
        RealtimeOrderMonitor {
            store,
            alerts,
            settlement,
            push,
            cfg,
        }
    }

    pub async fn watch(&self, orders: Vec<WatchOrder>) {
        if orders.is_empty() {
            return;
        }
        let window = Duration::from_secs(
            self.cfg.base_timeout_sec + self.cfg.per_order_timeout_sec * orders.len() as u64,
        );
        let started = Instant::now();
        let ids: Vec<String> = orders.iter().map(|o| o.client_order_id.clone()).collect();
        let by_client: HashMap<String, String> = orders
            .iter()
            .map(|o| (o.client_order_id.clone(), o.order_id.clone()))
            .collect();
        let mut pending: HashSet<String> = ids.iter().cloned().collect();

        let mut session = match self.push.connect(&ids).await {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(error = ?e, "push session unavailable; poller will cover");
                return;
            }
        };
        tracing::debug!(orders = orders.len(), window = ?window, "push session watching");

        let mut seen: LruCache<String, ()> = LruCache::new(NonZeroUsize::new(1024).unwrap());

        loop {
            let Some(remaining) = window.checked_sub(started.elapsed()) else {
                break;
            };
            let upd = match tokio::time::timeout(remaining, session.next_event()).await {
                Err(_) => break,
                Ok(None) => break,
                Ok(Some(u)) => u,
            };

            let client_id = upd.order.client_order_id.clone();
            let Some(order_id) = by_client.get(&client_id) else {
                continue;
            };
            let dedup = format!(
                "{}|{}|{}|{}",
                client_id,
                upd.order.status,
                upd.order.executed_quantity,
                upd.fill.as_ref().map(|f| f.trade_id.as_str()).unwrap_or("")
            );
            if seen.put(dedup, ()).is_some() {
                continue;
            }

            let order = match self.store.exchange_order(order_id).await {
                Ok(Some(o)) => o,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(error = ?e, "order load failed during push handling");
                    continue;
                }
            };
            let fills: Vec<VenueFill> = upd.fill.clone().into_iter().collect();
            match apply_order_state(
                &self.store,
                &self.alerts,
                &self.settlement,
                &order,
                &upd.order,
                &fills,
                UpdateSource::Push,
                now_ms(),
            )
            .await
            {
                Ok(status) if status.is_terminal() => {
                    pending.remove(&client_id);
                    if pending.is_empty() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(order = %order.id, error = ?e, "push update apply failed");
                }
            }
        }

        session.close().await;
        tracing::debug!(outstanding = pending.len(), "push session closed");
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
