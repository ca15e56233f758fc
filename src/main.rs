use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

use dca_engine::admin;
use dca_engine::config::{AppConfig, Credentials};
use dca_engine::engine::Engine;
use dca_engine::exchange::push::PushClient;
use dca_engine::exchange::rest::ExchangeRest;
use dca_engine::exchange::signer::Signer;
use dca_engine::observability::init_tracing;
use dca_engine::persistence::sqlite::SqliteStore;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = AppConfig::load()?;
    init_tracing(&cfg.observability)?;

    let creds = Credentials::from_env()?;
    let signer = Signer::new(creds.api_secret);
    let rest = Arc::new(ExchangeRest::new(
        cfg.exchange.rest_base_url.clone(),
        creds.api_key.clone(),
        signer.clone(),
        Duration::from_secs(cfg.exchange.request_timeout_sec),
    )?);
    let push = PushClient::new(cfg.exchange.ws_url.clone(), creds.api_key, signer);

    let store = Arc::new(SqliteStore::new(&cfg.persistence.sqlite_path).await?);
    store.init_schema().await?;

    let engine = Engine::new(cfg.clone(), store, rest, push);

    let admin_task = {
        let admin_cfg = cfg.admin.clone();
        let handle = engine.handle();
        tokio::spawn(async move {
            if let Err(e) = admin::serve(admin_cfg, handle).await {
                tracing::error!(error = ?e, "admin server failed");
            }
        })
    };

    let mut engine_task = tokio::spawn(async move {
        if let Err(e) = engine.run().await {
            tracing::error!(error = ?e, "engine terminated with error");
        }
    });

    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::warn!("ctrl_c received; shutting down");
        }
        _ = &mut engine_task => {
            tracing::warn!("engine task ended; shutting down");
        }
    }

    admin_task.abort();
    Ok(())
}
