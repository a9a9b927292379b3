//! Signed REST client for venue trading and history endpoints.

use crate::config::ApiCredentials;
use crate::exchange::types::*;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, instrument};

/// Errors from venue REST calls, split so callers can classify retryability.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Network-level failure or 5xx: transient, safe to retry.
    #[error("transport error: {0}")]
    Transport(String),
    /// Structured rejection from the venue (bad signature, bad params, ...):
    /// never retried.
    #[error("venue rejected request (code {code}): {message}")]
    Rejected { code: i64, message: String },
    /// Response body did not parse as expected.
    #[error("failed to parse venue response: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::Transport(err.to_string())
    }
}

impl ApiError {
    /// Transient failures are worth another attempt; venue rejections are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Transport(_))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerTime {
    server_time: i64,
}

/// REST client for a single venue/subaccount pairing.
///
/// Signed requests carry a timestamp corrected by `server_time_offset` (venue
/// time minus local time, measured once) plus a `recvWindow`.
pub struct VenueClient {
    http: Client,
    venue: Venue,
    base_url: String,
    api_key: String,
    secret_key: String,
    recv_window_ms: u64,
    server_time_offset: AtomicI64,
}

impl VenueClient {
    /// Create a client for the venue's production endpoints.
    pub fn new(
        venue: Venue,
        credentials: &ApiCredentials,
        timeout: Duration,
        recv_window_ms: u64,
    ) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            venue,
            base_url: venue.rest_base().to_string(),
            api_key: credentials.api_key.clone(),
            secret_key: credentials.secret_key.clone(),
            recv_window_ms,
            server_time_offset: AtomicI64::new(0),
        })
    }

    /// Point the client at a different base URL (tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn venue(&self) -> Venue {
        self.venue
    }

    pub fn recv_window(&self) -> Duration {
        Duration::from_millis(self.recv_window_ms)
    }

    /// Generate HMAC-SHA256 signature for authenticated requests.
    fn sign(&self, query_string: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query_string.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Local timestamp in milliseconds, corrected toward venue time.
    fn timestamp(&self) -> i64 {
        let local = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_millis() as i64;
        local + self.server_time_offset.load(Ordering::Relaxed)
    }

    /// Measure venue time minus local time and remember the offset.
    ///
    /// Called once at startup; signed requests reuse the correction.
    #[instrument(skip(self))]
    pub async fn sync_clock(&self) -> Result<(), ApiError> {
        let url = format!("{}{}/time", self.base_url, self.venue.api_prefix());
        let before = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_millis() as i64;

        let response = self.http.get(&url).send().await?;
        let server: ServerTime = Self::decode(response).await?;

        let offset = server.server_time - before;
        self.server_time_offset.store(offset, Ordering::Relaxed);
        info!(venue = %self.venue, offset_ms = offset, "Clock synchronized with venue");
        Ok(())
    }

    /// Build the canonical signed query string from parameters.
    fn signed_query(&self, mut params: Vec<(String, String)>) -> String {
        params.push(("recvWindow".to_string(), self.recv_window_ms.to_string()));
        params.push(("timestamp".to_string(), self.timestamp().to_string()));

        let query_string: String = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let signature = self.sign(&query_string);
        format!("{}&signature={}", query_string, signature)
    }

    async fn send_signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: Vec<(String, String)>,
    ) -> Result<T, ApiError> {
        let query = self.signed_query(params);
        let url = format!("{}{}{}?{}", self.base_url, self.venue.api_prefix(), path, query);

        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        Self::decode(response).await
    }

    /// Decode a response, mapping venue error bodies and 5xx to `ApiError`.
    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            return serde_json::from_str(&body)
                .map_err(|e| ApiError::Parse(format!("{} in body: {}", e, body)));
        }

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ApiError::Transport(format!("HTTP {}: {}", status, body)));
        }

        match serde_json::from_str::<VenueErrorBody>(&body) {
            Ok(err) => Err(ApiError::Rejected {
                code: err.code,
                message: err.msg,
            }),
            Err(_) => Err(ApiError::Rejected {
                code: status.as_u16() as i64,
                message: body,
            }),
        }
    }

    // ==================== Orders (Authenticated) ====================

    /// Place a new order.
    #[instrument(skip(self, order), fields(symbol = %order.symbol))]
    pub async fn place_order(&self, order: &NewOrder) -> Result<OrderAck, ApiError> {
        let mut params = vec![
            ("symbol".to_string(), order.symbol.clone()),
            ("side".to_string(), order.side.as_str().to_string()),
            ("type".to_string(), order.order_type.as_str().to_string()),
        ];

        if let Some(qty) = &order.quantity {
            params.push(("quantity".to_string(), qty.to_string()));
        }

        if let Some(price) = &order.price {
            params.push(("price".to_string(), price.to_string()));
        }

        if let Some(tif) = &order.time_in_force {
            params.push(("timeInForce".to_string(), tif.as_str().to_string()));
        }

        if let Some(reduce_only) = order.reduce_only {
            params.push(("reduceOnly".to_string(), reduce_only.to_string()));
        }

        if let Some(client_id) = &order.new_client_order_id {
            params.push(("newClientOrderId".to_string(), client_id.clone()));
        }

        debug!("Placing order: {:?}", order);
        self.send_signed(Method::POST, "/order", params).await
    }

    /// Cancel an order by client order id.
    #[instrument(skip(self, cancel), fields(symbol = %cancel.symbol))]
    pub async fn cancel_order(&self, cancel: &CancelOrder) -> Result<OrderAck, ApiError> {
        let params = vec![
            ("symbol".to_string(), cancel.symbol.clone()),
            (
                "origClientOrderId".to_string(),
                cancel.orig_client_order_id.clone(),
            ),
        ];

        self.send_signed(Method::DELETE, "/order", params).await
    }

    /// Modify an existing order's price/quantity.
    #[instrument(skip(self, edit), fields(symbol = %edit.symbol))]
    pub async fn edit_order(&self, edit: &EditOrder) -> Result<OrderAck, ApiError> {
        let params = vec![
            ("symbol".to_string(), edit.symbol.clone()),
            (
                "origClientOrderId".to_string(),
                edit.orig_client_order_id.clone(),
            ),
            ("side".to_string(), edit.side.as_str().to_string()),
            ("quantity".to_string(), edit.quantity.to_string()),
            ("price".to_string(), edit.price.to_string()),
        ];

        self.send_signed(Method::PUT, "/order", params).await
    }

    // ==================== History (Authenticated) ====================

    /// Page historical orders for a symbol within `[start_ms, end_ms]`.
    #[instrument(skip(self))]
    pub async fn historical_orders(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<HistoricalOrder>, ApiError> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("startTime".to_string(), start_ms.to_string()),
            ("endTime".to_string(), end_ms.to_string()),
        ];

        self.send_signed(Method::GET, "/allOrders", params).await
    }

    /// Fetch recent account trades for a symbol from `start_ms` onward.
    #[instrument(skip(self))]
    pub async fn account_trades(
        &self,
        symbol: &str,
        start_ms: i64,
    ) -> Result<Vec<AccountTrade>, ApiError> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("startTime".to_string(), start_ms.to_string()),
        ];

        self.send_signed(Method::GET, "/userTrades", params).await
    }
}
