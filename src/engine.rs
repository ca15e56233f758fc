use anyhow::Result;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::balance::BalanceRoller;
use crate::config::{parse_decimal, AppConfig};
use crate::exchange::push::PushClient;
use crate::exchange::rest::{ExchangeApi, ExchangeRest};
use crate::fallback::{ConvertCfg, FallbackConverter};
use crate::monitor::{MonitorCfg, OrderMonitor};
use crate::observability::Alerts;
use crate::persistence::sqlite::SqliteStore;
use crate::realtime::{RealtimeCfg, RealtimeOrderMonitor};
use crate::reconciler::{ReconCfg, Reconciler};
use crate::rules::MarketRules;
use crate::settlement::{SettleCfg, SettlementPoster};
use crate::submitter::{OrderSubmitter, SubmitCfg};

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Shared view of the running engine for the admin surface.
#[derive(Clone)]
pub struct EngineHandle {
    pub ready: Arc<AtomicBool>,
    pub kill: Arc<AtomicBool>,
    pub store: Arc<SqliteStore>,
    alerts: Alerts,
}

impl EngineHandle {
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub async fn status_json(&self) -> serde_json::Value {
        let pending = self.store.count_pending_intents().await.unwrap_or(-1);
        let open = self.store.count_open_orders().await.unwrap_or(-1);
        serde_json::json!({
            "ready": self.ready.load(Ordering::Relaxed),
            "kill_switch": self.kill.load(Ordering::Relaxed),
            "pending_intents": pending,
            "open_orders": open,
        })
    }

    /// Stops new order placement. Monitoring, settlement and
    /// reconciliation keep running so money already in flight is still
    /// tracked to completion.
    pub async fn engage_kill(&self, reason: &str) {
        self.kill.store(true, Ordering::Relaxed);
        self.alerts
            .emit(
                "admin",
                crate::types::Severity::Warn,
                None,
                "kill switch engaged",
                serde_json::json!({ "reason": reason }),
            )
            .await;
    }

    pub async fn clear_kill(&self) {
        self.kill.store(false, Ordering::Relaxed);
        self.alerts
            .emit(
                "admin",
                crate::types::Severity::Info,
                None,
                "kill switch cleared",
                serde_json::json!({}),
            )
            .await;
    }
}

pub struct Engine {
    cfg: AppConfig,
    store: Arc<SqliteStore>,
    rest: Arc<ExchangeRest>,
    push: PushClient,
    alerts: Alerts,
    ready: Arc<AtomicBool>,
    kill: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(
        cfg: AppConfig,
        store: Arc<SqliteStore>,
        rest: Arc<ExchangeRest>,
        push: PushClient,
    ) -> Self {
        let alerts = Alerts::new(store.clone(), cfg.org_id.clone());
        Engine {
            cfg,
            store,
            rest,
            push,
            alerts,
            ready: Arc::new(AtomicBool::new(false)),
            kill: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            ready: self.ready.clone(),
            kill: self.kill.clone(),
            store: self.store.clone(),
            alerts: self.alerts.clone(),
        }
    }

    /// Spawns every periodic loop and parks. Loops are independent; one
    /// failing run is logged and retried on its next tick.
    pub async fn run(self) -> Result<()> {
        let cfg = &self.cfg;
        let rules = MarketRules::from_cfg(&cfg.market)?;
        let api: Arc<dyn ExchangeApi> = self.rest.clone();
        let inter_call_delay_ms = cfg.exchange.inter_call_delay_ms;

        let settlement = Arc::new(SettlementPoster::new(
            self.store.clone(),
            api.clone(),
            self.alerts.clone(),
            SettleCfg {
                org_id: cfg.org_id.clone(),
                base_asset: cfg.market.base_asset.clone(),
                quote_asset: cfg.market.quote_asset.clone(),
                platform_fee_rate: parse_decimal(
                    &cfg.settlement.platform_fee_rate,
                    "settlement.platform_fee_rate",
                )?,
                sweep_fees: cfg.settlement.sweep_fees,
                inter_call_delay_ms,
            },
        ));
        let roller = Arc::new(BalanceRoller::new(
            self.store.clone(),
            cfg.org_id.clone(),
            cfg.market.symbol.clone(),
        ));
        let realtime = Arc::new(RealtimeOrderMonitor::new(
            self.store.clone(),
            self.alerts.clone(),
            settlement.clone(),
            self.push.clone(),
            RealtimeCfg {
                base_timeout_sec: cfg.execution.push_base_timeout_sec,
                per_order_timeout_sec: cfg.execution.push_per_order_timeout_sec,
            },
        ));

        // First sync before any signed request goes out.
        match self.rest.sync_time().await {
            Ok(offset) => tracing::info!(offset_ms = offset, "venue clock offset set"),
            Err(e) => tracing::warn!(error = ?e, "initial time sync failed"),
        }

        {
            let rest = self.rest.clone();
            let interval = cfg.exchange.time_sync_interval_sec;
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(interval)).await;
                    match rest.sync_time().await {
                        Ok(offset) => tracing::debug!(offset_ms = offset, "time offset updated"),
                        Err(e) => tracing::warn!(error = ?e, "time sync failed"),
                    }
                }
            });
        }

        // Daily NAV needs a price mark per day even on days without fills.
        {
            let api = api.clone();
            let store = self.store.clone();
            let symbol = cfg.market.symbol.clone();
            let interval = cfg.execution.price_sample_interval_sec;
            tokio::spawn(async move {
                loop {
                    match api.ticker(&symbol).await {
                        Ok(t) => {
                            let today = Utc::now().date_naive();
                            if let Err(e) = store.upsert_price_mark(&symbol, today, t.last).await {
                                tracing::warn!(error = ?e, "price mark write failed");
                            }
                        }
                        Err(e) => tracing::warn!(error = ?e, "price sample failed"),
                    }
                    tokio::time::sleep(Duration::from_secs(interval)).await;
                }
            });
        }

        {
            let submitter = OrderSubmitter::new(
                self.store.clone(),
                api.clone(),
                self.alerts.clone(),
                rules.clone(),
                SubmitCfg {
                    symbol: cfg.market.symbol.clone(),
                    batch: cfg.execution.submit_batch,
                    inter_call_delay_ms,
                },
            );
            let realtime = realtime.clone();
            let kill = self.kill.clone();
            let interval = cfg.execution.submit_interval_sec;
            tokio::spawn(async move {
                loop {
                    if kill.load(Ordering::Relaxed) {
                        tracing::debug!("kill switch on; submissions paused");
                    } else {
                        match submitter.run_once(now_ms()).await {
                            Ok(watch) if !watch.is_empty() => {
                                let rt = realtime.clone();
                                tokio::spawn(async move { rt.watch(watch).await });
                            }
                            Ok(_) => {}
                            Err(e) => tracing::warn!(error = ?e, "submit pass failed"),
                        }
                    }
                    tokio::time::sleep(Duration::from_secs(interval)).await;
                }
            });
        }

        {
            let monitor = OrderMonitor::new(
                self.store.clone(),
                api.clone(),
                self.alerts.clone(),
                settlement.clone(),
                MonitorCfg {
                    poll_grace_ms: cfg.execution.poll_grace_sec as i64 * 1000,
                    push_grace_ms: cfg.execution.push_grace_sec as i64 * 1000,
                    batch: cfg.execution.poll_batch,
                    inter_call_delay_ms,
                },
            );
            let interval = cfg.execution.poll_interval_sec;
            tokio::spawn(async move {
                loop {
                    if let Err(e) = monitor.run_once(now_ms()).await {
                        tracing::warn!(error = ?e, "poll pass failed");
                    }
                    tokio::time::sleep(Duration::from_secs(interval)).await;
                }
            });
        }

        if cfg.fallback.enabled {
            let converter = FallbackConverter::new(
                self.store.clone(),
                api.clone(),
                self.alerts.clone(),
                settlement.clone(),
                rules.clone(),
                ConvertCfg {
                    symbol: cfg.market.symbol.clone(),
                    max_age_ms: cfg.fallback.max_age_sec as i64 * 1000,
                    price_move_threshold: parse_decimal(
                        &cfg.fallback.price_move_threshold,
                        "fallback.price_move_threshold",
                    )?,
                    batch: cfg.execution.poll_batch,
                    inter_call_delay_ms,
                },
            );
            let realtime = realtime.clone();
            let kill = self.kill.clone();
            let interval = cfg.fallback.check_interval_sec;
            tokio::spawn(async move {
                loop {
                    if kill.load(Ordering::Relaxed) {
                        tracing::debug!("kill switch on; conversions paused");
                    } else {
                        match converter.run_once(now_ms()).await {
                            Ok(watch) if !watch.is_empty() => {
                                let rt = realtime.clone();
                                tokio::spawn(async move { rt.watch(watch).await });
                            }
                            Ok(_) => {}
                            Err(e) => tracing::warn!(error = ?e, "fallback pass failed"),
                        }
                    }
                    tokio::time::sleep(Duration::from_secs(interval)).await;
                }
            });
        }

        {
            let settlement = settlement.clone();
            let roller = roller.clone();
            let interval = cfg.settlement.interval_sec;
            tokio::spawn(async move {
                loop {
                    if let Err(e) = settlement.run_once().await {
                        tracing::warn!(error = ?e, "settlement pass failed");
                    }
                    if let Err(e) = roller.run_once().await {
                        tracing::warn!(error = ?e, "balance roll failed");
                    }
                    tokio::time::sleep(Duration::from_secs(interval)).await;
                }
            });
        }

        if cfg.reconciler.enabled {
            let reconciler = Reconciler::new(
                self.store.clone(),
                api.clone(),
                self.alerts.clone(),
                settlement.clone(),
                ReconCfg {
                    org_id: cfg.org_id.clone(),
                    base_asset: cfg.market.base_asset.clone(),
                    quote_asset: cfg.market.quote_asset.clone(),
                    lookback_ms: cfg.reconciler.lookback_sec as i64 * 1000,
                    page_limit: cfg.reconciler.page_limit,
                    base_tolerance: parse_decimal(
                        &cfg.reconciler.base_tolerance,
                        "reconciler.base_tolerance",
                    )?,
                    quote_tolerance: parse_decimal(
                        &cfg.reconciler.quote_tolerance,
                        "reconciler.quote_tolerance",
                    )?,
                    auto_correct: cfg.reconciler.auto_correct,
                    inter_call_delay_ms,
                },
            );
            let roller = roller.clone();
            let interval = cfg.reconciler.interval_sec;
            tokio::spawn(async move {
                loop {
                    match reconciler.run_once().await {
                        Ok(booked) if booked > 0 => {
                            if let Err(e) = roller.run_once().await {
                                tracing::warn!(error = ?e, "balance roll failed");
                            }
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = ?e, "reconciliation pass failed"),
                    }
                    tokio::time::sleep(Duration::from_secs(interval)).await;
                }
            });
        }

        self.ready.store(true, Ordering::Relaxed);
        tracing::info!(symbol = %cfg.market.symbol, "engine running");
        std::future::pending::<()>().await;
        Ok(())
    }
}
