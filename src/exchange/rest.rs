use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use thiserror::Error;

use crate::exchange::models::{
    CancelAck, OrderState, PlaceOrderRequest, ServerTime, Ticker, TransactionPage, TransferAck,
    VenueBalance, VenueErrorBody, VenueFill,
};
use crate::exchange::signer::Signer;

const HDR_API_KEY: &str = "X-Api-Key";
const HDR_TIMESTAMP: &str = "X-Timestamp";
const HDR_SIGNATURE: &str = "X-Signature";
const HDR_SUBACCOUNT: &str = "X-Subaccount-Id";

#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The venue understood the request and said no. Retrying the same
    /// request will not help.
    #[error("venue rejected request: {code}: {message}")]
    Rejected { code: String, message: String },
    #[error("rate limited by venue")]
    RateLimited,
    #[error("venue server error: http {status}")]
    Server { status: u16 },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid venue payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("request signing failed: {0}")]
    Sign(String),
}

impl ExchangeError {
    /// Transient errors are left for the next cycle; nothing durable is
    /// written for them.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::RateLimited | ExchangeError::Server { .. } | ExchangeError::Transport(_)
        )
    }
}

/// Venue operations the engine depends on. Tests drive components
/// through stub implementations of this trait.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn place_order(
        &self,
        req: &PlaceOrderRequest,
        subaccount: &str,
    ) -> Result<OrderState, ExchangeError>;

    async fn cancel_order(
        &self,
        venue_order_id: &str,
        subaccount: &str,
    ) -> Result<CancelAck, ExchangeError>;

    async fn order_by_client_id(
        &self,
        client_order_id: &str,
        subaccount: &str,
    ) -> Result<OrderState, ExchangeError>;

    async fn order_fills(
        &self,
        venue_order_id: &str,
        subaccount: &str,
    ) -> Result<Vec<VenueFill>, ExchangeError>;

    async fn ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError>;

    async fn balances(&self, subaccount: &str) -> Result<Vec<VenueBalance>, ExchangeError>;

    async fn transactions(
        &self,
        subaccount: &str,
        since_ms: i64,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<TransactionPage, ExchangeError>;

    async fn transfer_to_main(
        &self,
        from_subaccount: &str,
        asset: &str,
        amount: Decimal,
    ) -> Result<TransferAck, ExchangeError>;
}

pub struct ExchangeRest {
    base_url: String,
    api_key: String,
    signer: Signer,
    client: Client,
    time_offset_ms: AtomicI64,
}

impl ExchangeRest {
    pub fn new(
        base_url: String,
        api_key: String,
        signer: Signer,
        request_timeout: Duration,
    ) -> Result<Self, ExchangeError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(ExchangeRest {
            base_url,
            api_key,
            signer,
            client,
            time_offset_ms: AtomicI64::new(0),
        })
    }

    pub async fn server_time(&self) -> Result<i64, ExchangeError> {
        let url = format!("{}/v1/time", self.base_url);
        let resp = self.client.get(url).send().await?;
        let t: ServerTime = into_json(resp).await?;
        Ok(t.server_time_ms)
    }

    /// Re-derives the local/venue clock offset used to timestamp signed
    /// requests. Returns the new offset.
    pub async fn sync_time(&self) -> Result<i64, ExchangeError> {
        let server = self.server_time().await?;
        let offset = server - local_now_ms();
        self.time_offset_ms.store(offset, Ordering::Relaxed);
        Ok(offset)
    }

    fn now_ms(&self) -> i64 {
        local_now_ms() + self.time_offset_ms.load(Ordering::Relaxed)
    }

    fn headers(
        &self,
        method: &str,
        path_and_query: &str,
        body: &str,
        subaccount: Option<&str>,
    ) -> Result<Vec<(&'static str, String)>, ExchangeError> {
        let ts = self.now_ms();
        let sig = self
            .signer
            .sign(ts, method, path_and_query, body, subaccount)
            .map_err(|e| ExchangeError::Sign(e.to_string()))?;
        let mut headers = vec![
            (HDR_API_KEY, self.api_key.clone()),
            (HDR_TIMESTAMP, ts.to_string()),
            (HDR_SIGNATURE, sig),
        ];
        if let Some(sub) = subaccount {
            headers.push((HDR_SUBACCOUNT, sub.to_string()));
        }
        Ok(headers)
    }

    async fn signed_get<T: DeserializeOwned>(
        &self,
        path_and_query: &str,
        subaccount: Option<&str>,
    ) -> Result<T, ExchangeError> {
        let headers = self.headers("GET", path_and_query, "", subaccount)?;
        let url = format!("{}{}", self.base_url, path_and_query);
        let mut req = self.client.get(url);
        for (k, v) in headers {
            req = req.header(k, v);
        }
        into_json(req.send().await?).await
    }

    async fn signed_post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &str,
        subaccount: Option<&str>,
    ) -> Result<T, ExchangeError> {
        let headers = self.headers("POST", path, body, subaccount)?;
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .body(body.to_string());
        for (k, v) in headers {
            req = req.header(k, v);
        }
        into_json(req.send().await?).await
    }

    async fn signed_delete<T: DeserializeOwned>(
        &self,
        path: &str,
        subaccount: Option<&str>,
    ) -> Result<T, ExchangeError> {
        let headers = self.headers("DELETE", path, "", subaccount)?;
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.delete(url);
        for (k, v) in headers {
            req = req.header(k, v);
        }
        into_json(req.send().await?).await
    }
}

#[async_trait]
impl ExchangeApi for ExchangeRest {
    async fn place_order(
        &self,
        req: &PlaceOrderRequest,
        subaccount: &str,
    ) -> Result<OrderState, ExchangeError> {
        let body = serde_json::to_string(req)?;
        self.signed_post("/v1/orders", &body, Some(subaccount)).await
    }

    async fn cancel_order(
        &self,
        venue_order_id: &str,
        subaccount: &str,
    ) -> Result<CancelAck, ExchangeError> {
        let path = format!("/v1/orders/{}", urlencoding::encode(venue_order_id));
        self.signed_delete(&path, Some(subaccount)).await
    }

    async fn order_by_client_id(
        &self,
        client_order_id: &str,
        subaccount: &str,
    ) -> Result<OrderState, ExchangeError> {
        let path = format!(
            "/v1/orders/by-client-id/{}",
            urlencoding::encode(client_order_id)
        );
        self.signed_get(&path, Some(subaccount)).await
    }

    async fn order_fills(
        &self,
        venue_order_id: &str,
        subaccount: &str,
    ) -> Result<Vec<VenueFill>, ExchangeError> {
        let path = format!("/v1/orders/{}/fills", urlencoding::encode(venue_order_id));
        self.signed_get(&path, Some(subaccount)).await
    }

    async fn ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let path = format!("/v1/ticker?symbol={}", urlencoding::encode(symbol));
        self.signed_get(&path, None).await
    }

    async fn balances(&self, subaccount: &str) -> Result<Vec<VenueBalance>, ExchangeError> {
        self.signed_get("/v1/balances", Some(subaccount)).await
    }

    async fn transactions(
        &self,
        subaccount: &str,
        since_ms: i64,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<TransactionPage, ExchangeError> {
        let mut path = format!("/v1/transactions?since_ms={}&limit={}", since_ms, limit);
        if let Some(c) = cursor {
            path.push_str(&format!("&cursor={}", urlencoding::encode(c)));
        }
        self.signed_get(&path, Some(subaccount)).await
    }

    async fn transfer_to_main(
        &self,
        from_subaccount: &str,
        asset: &str,
        amount: Decimal,
    ) -> Result<TransferAck, ExchangeError> {
        let body = serde_json::to_string(&serde_json::json!({
            "from_subaccount": from_subaccount,
            "to": "main",
            "asset": asset,
            "amount": amount,
        }))?;
        self.signed_post("/v1/transfers", &body, None).await
    }
}

async fn into_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ExchangeError> {
    let status = resp.status();
    if status.is_success() {
        let body = resp.text().await?;
        return serde_json::from_str(&body).map_err(ExchangeError::Decode);
    }
    if status.as_u16() == 429 {
        return Err(ExchangeError::RateLimited);
    }
    let body = resp.text().await.unwrap_or_default();
    if status.is_client_error() {
        let (mut code, message) = match serde_json::from_str::<VenueErrorBody>(&body) {
            Ok(b) => (b.code, b.message),
            Err(_) => (String::new(), body),
        };
        if code.is_empty() {
            code = status.as_u16().to_string();
        }
        return Err(ExchangeError::Rejected { code, message });
    }
    Err(ExchangeError::Server {
        status: status.as_u16(),
    })
}

fn local_now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
