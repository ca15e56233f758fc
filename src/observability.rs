use once_cell::sync::Lazy;
use prometheus::{register_int_counter, IntCounter};
use std::sync::Arc;

use crate::config::ObservabilityCfg;
use crate::persistence::sqlite::SqliteStore;
use crate::types::Severity;
use tracing_subscriber::EnvFilter;

pub fn init_tracing(cfg: &ObservabilityCfg) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,dca_engine=debug"));

    if cfg.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }
    Ok(())
}

// Registration fails only on a duplicate metric name, which is a startup
// programming error, hence the unwraps.
pub static ORDERS_SUBMITTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("dca_orders_submitted_total", "Orders accepted by the venue").unwrap()
});

pub static ORDER_REJECTIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("dca_order_rejections_total", "Orders rejected by the venue").unwrap()
});

pub static FILLS_RECORDED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("dca_fills_recorded_total", "Fills persisted (deduplicated)").unwrap()
});

pub static FALLBACK_CONVERSIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "dca_fallback_conversions_total",
        "Stale limit orders converted to market remainders"
    )
    .unwrap()
});

pub static LEDGER_LINES_POSTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("dca_ledger_lines_posted_total", "Ledger lines written").unwrap()
});

pub static FUNDING_EVENTS_CREATED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "dca_funding_events_total",
        "Funding events recorded (deduplicated)"
    )
    .unwrap()
});

pub static RECON_RUNS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("dca_reconciler_runs_total", "Completed reconciliation passes").unwrap()
});

pub static ALERTS_EMITTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("dca_alerts_total", "Alert events raised").unwrap()
});

/// Persists operator alerts and mirrors them to the log. Persistence
/// failures are logged and swallowed so alerting can never take down the
/// path that raised the alert.
#[derive(Clone)]
pub struct Alerts {
    store: Arc<SqliteStore>,
    org_id: String,
}

impl Alerts {
    pub fn new(store: Arc<SqliteStore>, org_id: String) -> Self {
        Alerts { store, org_id }
    }

    pub async fn emit(
        &self,
        component: &str,
        severity: Severity,
        customer_id: Option<&str>,
        message: &str,
        context: serde_json::Value,
    ) {
        ALERTS_EMITTED.inc();
        match severity {
            Severity::Info => {
                tracing::info!(component, customer = ?customer_id, %context, "{message}")
            }
            Severity::Warn => {
                tracing::warn!(component, customer = ?customer_id, %context, "{message}")
            }
            Severity::Error | Severity::Critical => {
                tracing::error!(
                    component,
                    severity = severity.as_str(),
                    customer = ?customer_id,
                    %context,
                    "{message}"
                )
            }
        }
        if let Err(e) = self
            .store
            .insert_alert(
                &self.org_id,
                customer_id,
                component,
                severity,
                message,
                Some(context),
                now_ms(),
            )
            .await
        {
            tracing::warn!(error = ?e, "failed to persist alert event");
        }
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
