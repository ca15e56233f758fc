use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::exchange::models::{OrderState, VenueFill};
use crate::exchange::signer::Signer;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
enum PushMessage {
    AuthAck {
        ok: bool,
        #[serde(default)]
        message: Option<String>,
    },
    SubscribeAck {
        channel: String,
    },
    OrderUpdate(PushOrderUpdate),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushOrderUpdate {
    pub order: OrderState,
    #[serde(default)]
    pub fill: Option<VenueFill>,
}

/// Connects authenticated sessions to the venue's order-update stream.
/// The operator key authenticates once; updates for any subscribed
/// sub-account order arrive on the same socket.
#[derive(Clone)]
pub struct PushClient {
    ws_url: String,
    api_key: String,
    signer: Signer,
}

impl PushClient {
    pub fn new(ws_url: String, api_key: String, signer: Signer) -> Self {
        PushClient {
            ws_url,
            api_key,
            signer,
        }
    }

    /// Opens a session subscribed to updates for the given client order
    /// ids. Fails fast on auth or subscribe rejection; callers treat any
    /// failure here as "no push this round" and fall back to polling.
    pub async fn connect(&self, client_order_ids: &[String]) -> Result<PushSession> {
        let (mut ws, _) = tokio_tungstenite::connect_async(&self.ws_url)
            .await
            .context("connect order stream")?;

        let ts = now_ms();
        let path = url_path(&self.ws_url);
        let sig = self.signer.sign(ts, "GET", path, "", None)?;
        let auth = serde_json::json!({
            "type": "auth",
            "data": { "api_key": self.api_key, "timestamp": ts, "signature": sig },
        });
        ws.send(Message::Text(auth.to_string()))
            .await
            .context("send auth frame")?;
        match read_message(&mut ws).await? {
            Some(PushMessage::AuthAck { ok: true, .. }) => {}
            Some(PushMessage::AuthAck { ok: false, message }) => {
                anyhow::bail!("stream auth rejected: {}", message.unwrap_or_default())
            }
            other => anyhow::bail!("unexpected reply to auth frame: {:?}", other),
        }

        let sub = serde_json::json!({
            "type": "subscribe",
            "data": { "channel": "orders", "client_order_ids": client_order_ids },
        });
        ws.send(Message::Text(sub.to_string()))
            .await
            .context("send subscribe frame")?;
        match read_message(&mut ws).await? {
            Some(PushMessage::SubscribeAck { channel }) if channel == "orders" => {}
            other => anyhow::bail!("unexpected reply to subscribe frame: {:?}", other),
        }

        Ok(PushSession { ws })
    }
}

pub struct PushSession {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl PushSession {
    /// Next order update, or None once the stream ends. Socket errors
    /// end the session quietly; the poller remains the source of truth.
    pub async fn next_event(&mut self) -> Option<PushOrderUpdate> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(t))) => match serde_json::from_str::<PushMessage>(&t) {
                    Ok(PushMessage::OrderUpdate(upd)) => return Some(upd),
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::debug!(error = ?e, "unparseable stream frame; skipping");
                        continue;
                    }
                },
                Some(Ok(Message::Ping(p))) => {
                    let _ = self.ws.send(Message::Pong(p)).await;
                }
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::debug!(error = ?e, "order stream error; ending session");
                    return None;
                }
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

async fn read_message(
    ws: &mut WebSocketStream<MaybeTlsStream<TcpStream>>,
) -> Result<Option<PushMessage>> {
    while let Some(msg) = ws.next().await {
        match msg.context("order stream read")? {
            Message::Text(t) => {
                let parsed = serde_json::from_str(&t).context("parse stream frame")?;
                return Ok(Some(parsed));
            }
            Message::Ping(p) => {
                let _ = ws.send(Message::Pong(p)).await;
            }
            Message::Close(_) => return Ok(None),
            _ => {}
        }
    }
    Ok(None)
}

/// Path-and-query portion of a URL, for signing.
fn url_path(url: &str) -> &str {
    match url.find("://") {
        Some(i) => match url[i + 3..].find('/') {
            Some(j) => &url[i + 3 + j..],
            None => "/",
        },
        None => url,
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
