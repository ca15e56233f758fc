use crate::config::AdminCfg;
use crate::engine::EngineHandle;
use anyhow::Result;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};

#[derive(Clone)]
struct AdminState {
    cfg: AdminCfg,
    engine: EngineHandle,
}

fn authorized(cfg: &AdminCfg, headers: &HeaderMap) -> bool {
    if !cfg.require_token {
        return true;
    }
    let token = match std::env::var("ADMIN_TOKEN") {
        Ok(t) => t,
        Err(_) => return false,
    };
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    auth == format!("Bearer {}", token)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(st): State<AdminState>) -> StatusCode {
    if st.engine.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn status(State(st): State<AdminState>) -> Json<serde_json::Value> {
    Json(st.engine.status_json().await)
}

async fn kill(headers: HeaderMap, State(st): State<AdminState>) -> StatusCode {
    if !authorized(&st.cfg, &headers) {
        return StatusCode::UNAUTHORIZED;
    }
    st.engine.engage_kill("admin request").await;
    StatusCode::OK
}

async fn unkill(headers: HeaderMap, State(st): State<AdminState>) -> StatusCode {
    if !authorized(&st.cfg, &headers) {
        return StatusCode::UNAUTHORIZED;
    }
    st.engine.clear_kill().await;
    StatusCode::OK
}

async fn alerts(
    headers: HeaderMap,
    State(st): State<AdminState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if !authorized(&st.cfg, &headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let alerts = st
        .engine
        .store
        .recent_alerts(100)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(serde_json::json!({ "alerts": alerts })))
}

async fn metrics() -> (StatusCode, String) {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buf = vec![];
    let _ = encoder.encode(&metric_families, &mut buf);
    (StatusCode::OK, String::from_utf8_lossy(&buf).to_string())
}

pub async fn serve(cfg: AdminCfg, engine: EngineHandle) -> Result<()> {
    let st = AdminState {
        cfg: cfg.clone(),
        engine,
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/status", get(status))
        .route("/kill", post(kill))
        .route("/kill/clear", post(unkill))
        .route("/alerts", get(alerts))
        .route("/metrics", get(metrics))
        .with_state(st);

    let addr = cfg.bind.parse()?;
    tracing::info!(bind = %cfg.bind, "admin server listening");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}
