//! Alpaca REST API Client
//!
//! Provides REST API integration for:
//! - Submitting, polling and canceling orders (`/v2/orders`)
//! - Account-wide liquidation (`DELETE /v2/positions`)
//! - Latest trade prices from the market data API
//!
//! # Authentication
//!
//! Every request carries the `APCA-API-KEY-ID` and `APCA-API-SECRET-KEY`
//! headers. No request signing is involved.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::debug;

use warden_domain::{Price, Symbol};
use warden_exec::{
    BrokerOrderAck, BrokerOrderReport, BrokerOrderRequest, BrokerOrderStatus, BrokerPort,
    ExecError,
};

// =============================================================================
// Constants
// =============================================================================

/// Paper trading API base URL
pub const ALPACA_PAPER_URL: &str = "https://paper-api.alpaca.markets";

/// Market data API base URL
pub const ALPACA_DATA_URL: &str = "https://data.alpaca.markets";

/// Request timeout in seconds
const REQUEST_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur in the Alpaca REST client.
#[derive(Debug, Clone, Error)]
pub enum AlpacaError {
    /// HTTP request failed before a response arrived
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    /// API returned a non-success status
    #[error("Alpaca API error {status}: {message}")]
    ApiError { status: u16, message: String },

    /// Failed to parse response
    #[error("Failed to parse response: {0}")]
    ParseError(String),

    /// Request timed out
    #[error("Request timed out")]
    Timeout,
}

impl From<AlpacaError> for ExecError {
    fn from(err: AlpacaError) -> Self {
        match err {
            AlpacaError::ApiError { status: 429, message } => ExecError::RateLimited(message),
            AlpacaError::ApiError { status, message } if status >= 500 => {
                ExecError::Server { status, message }
            }
            AlpacaError::ApiError { status, message } => {
                ExecError::Rejected { status: Some(status), message }
            }
            AlpacaError::RequestFailed(msg) => ExecError::Network(msg),
            AlpacaError::Timeout => ExecError::Timeout("alpaca request".to_string()),
            AlpacaError::ParseError(msg) => ExecError::Rejected { status: None, message: msg },
        }
    }
}

// =============================================================================
// Alpaca REST Client
// =============================================================================

/// Connection settings
#[derive(Debug, Clone)]
pub struct AlpacaConfig {
    pub api_key: String,
    pub api_secret: String,
    /// Trading API, e.g. `https://paper-api.alpaca.markets`
    pub base_url: String,
    /// Market data API
    pub data_url: String,
    pub request_timeout: Duration,
}

impl AlpacaConfig {
    /// Paper trading endpoints with the default timeout
    pub fn paper(api_key: String, api_secret: String) -> Self {
        Self {
            api_key,
            api_secret,
            base_url: ALPACA_PAPER_URL.to_string(),
            data_url: ALPACA_DATA_URL.to_string(),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
        }
    }
}

/// Alpaca REST API client.
pub struct AlpacaClient {
    client: Client,
    config: AlpacaConfig,
}

impl AlpacaClient {
    /// Create a new Alpaca client.
    pub fn new(config: AlpacaConfig) -> Self {
        Self { client: Client::new(), config }
    }

    /// Send an authenticated request and return the raw body.
    async fn send(
        &self,
        method: Method,
        url: String,
        body: Option<&serde_json::Value>,
    ) -> Result<String, AlpacaError> {
        let mut request = self
            .client
            .request(method.clone(), &url)
            .header("APCA-API-KEY-ID", &self.config.api_key)
            .header("APCA-API-SECRET-KEY", &self.config.api_secret);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = timeout(self.config.request_timeout, request.send())
            .await
            .map_err(|_| AlpacaError::Timeout)?
            .map_err(|e| AlpacaError::RequestFailed(e.to_string()))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| AlpacaError::ParseError(e.to_string()))?;
        debug!(%method, %url, status = status.as_u16(), "Alpaca response");

        if !status.is_success() {
            return Err(api_error(status, &text));
        }

        Ok(text)
    }

    fn trading_url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn data_url(&self, path: &str) -> String {
        format!("{}{}", self.config.data_url.trim_end_matches('/'), path)
    }

    // =========================================================================
    // Order API
    // =========================================================================

    /// Submit an order.
    ///
    /// # Endpoint
    ///
    /// `POST /v2/orders`
    pub async fn submit_order(&self, request: &BrokerOrderRequest) -> Result<AlpacaOrder, AlpacaError> {
        let body = order_body(request);
        let text = self.send(Method::POST, self.trading_url("/v2/orders"), Some(&body)).await?;
        parse(&text)
    }

    /// Fetch an order by its Alpaca id.
    ///
    /// # Endpoint
    ///
    /// `GET /v2/orders/{id}`
    pub async fn get_order(&self, order_id: &str) -> Result<AlpacaOrder, AlpacaError> {
        let url = self.trading_url(&format!("/v2/orders/{}", order_id));
        let text = self.send(Method::GET, url, None).await?;
        parse(&text)
    }

    /// Cancel an order by its Alpaca id.
    pub async fn cancel_order(&self, order_id: &str) -> Result<(), AlpacaError> {
        let url = self.trading_url(&format!("/v2/orders/{}", order_id));
        self.send(Method::DELETE, url, None).await?;
        Ok(())
    }

    /// Cancel every open order. Returns the number of orders affected.
    pub async fn cancel_all_orders(&self) -> Result<usize, AlpacaError> {
        let text = self.send(Method::DELETE, self.trading_url("/v2/orders"), None).await?;
        count_items(&text)
    }

    /// Close every position at market. Returns the number of positions affected.
    pub async fn close_all_positions(&self) -> Result<usize, AlpacaError> {
        let text = self.send(Method::DELETE, self.trading_url("/v2/positions"), None).await?;
        count_items(&text)
    }

    /// Latest trade price for a stock symbol.
    ///
    /// # Endpoint
    ///
    /// `GET {data}/v2/stocks/{symbol}/trades/latest`
    pub async fn latest_trade(&self, symbol: &str) -> Result<Option<Decimal>, AlpacaError> {
        let url = self.data_url(&format!("/v2/stocks/{}/trades/latest", symbol));
        match self.send(Method::GET, url, None).await {
            Ok(text) => {
                let response: LatestTradeResponse = parse(&text)?;
                Ok(response.trade.map(|t| t.price))
            }
            Err(AlpacaError::ApiError { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl BrokerPort for AlpacaClient {
    async fn place_order(&self, request: &BrokerOrderRequest) -> Result<BrokerOrderAck, ExecError> {
        let order = self.submit_order(request).await?;
        Ok(BrokerOrderAck {
            broker_order_id: order.id.clone(),
            client_order_id: order.client_order_id.clone(),
            status: order.broker_status(),
            raw: order.raw.clone(),
        })
    }

    async fn get_order(&self, broker_order_id: &str) -> Result<BrokerOrderReport, ExecError> {
        let order = AlpacaClient::get_order(self, broker_order_id).await?;
        order.report()
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), ExecError> {
        Ok(AlpacaClient::cancel_order(self, broker_order_id).await?)
    }

    async fn cancel_all_orders(&self) -> Result<usize, ExecError> {
        Ok(AlpacaClient::cancel_all_orders(self).await?)
    }

    async fn liquidate_all_positions(&self) -> Result<usize, ExecError> {
        Ok(self.close_all_positions().await?)
    }

    async fn latest_price(&self, symbol: &Symbol) -> Result<Option<Price>, ExecError> {
        match self.latest_trade(symbol.as_str()).await? {
            Some(price) => Ok(Some(Price::new(price)?)),
            None => Ok(None),
        }
    }
}

// =============================================================================
// Wire helpers
// =============================================================================

fn api_error(status: StatusCode, body: &str) -> AlpacaError {
    let message = serde_json::from_str::<AlpacaErrorResponse>(body)
        .map(|e| e.message)
        .unwrap_or_else(|_| body.to_string());
    AlpacaError::ApiError { status: status.as_u16(), message }
}

fn parse<T: for<'de> Deserialize<'de>>(text: &str) -> Result<T, AlpacaError> {
    serde_json::from_str(text).map_err(|e| AlpacaError::ParseError(e.to_string()))
}

/// Bulk endpoints answer with one array element per affected item
fn count_items(text: &str) -> Result<usize, AlpacaError> {
    if text.trim().is_empty() {
        return Ok(0);
    }
    let items: Vec<serde_json::Value> = parse(text)?;
    Ok(items.len())
}

fn order_body(request: &BrokerOrderRequest) -> serde_json::Value {
    let mut body = serde_json::json!({
        "symbol": request.symbol.as_str(),
        "qty": request.quantity.as_decimal().to_string(),
        "side": request.side.as_str(),
        "type": request.order_type.as_str(),
        "time_in_force": request.time_in_force,
        "client_order_id": request.client_order_id,
    });
    if let Some(limit) = request.limit_price {
        body["limit_price"] = serde_json::Value::String(limit.as_decimal().to_string());
    }
    body
}

fn map_status(status: &str) -> BrokerOrderStatus {
    match status {
        "partially_filled" => BrokerOrderStatus::PartiallyFilled,
        "filled" => BrokerOrderStatus::Filled,
        "canceled" | "done_for_day" | "replaced" => BrokerOrderStatus::Canceled,
        "rejected" | "suspended" | "stopped" => BrokerOrderStatus::Rejected,
        "expired" => BrokerOrderStatus::Expired,
        _ => BrokerOrderStatus::New,
    }
}

// =============================================================================
// Alpaca Types (from API responses)
// =============================================================================

/// Alpaca error response.
#[derive(Debug, Deserialize)]
struct AlpacaErrorResponse {
    message: String,
}

/// Alpaca order object (the fields we use), with the full body kept in `raw`.
#[derive(Debug, Clone, Serialize)]
pub struct AlpacaOrder {
    pub id: String,
    pub client_order_id: String,
    pub status: String,
    pub filled_qty: Decimal,
    pub filled_avg_price: Option<Decimal>,
    pub raw: serde_json::Value,
}

impl<'de> Deserialize<'de> for AlpacaOrder {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Fields {
            id: String,
            client_order_id: String,
            status: String,
            #[serde(default)]
            filled_qty: Option<Decimal>,
            #[serde(default)]
            filled_avg_price: Option<Decimal>,
        }

        let raw = serde_json::Value::deserialize(deserializer)?;
        let fields = Fields::deserialize(&raw).map_err(serde::de::Error::custom)?;
        Ok(Self {
            id: fields.id,
            client_order_id: fields.client_order_id,
            status: fields.status,
            filled_qty: fields.filled_qty.unwrap_or(Decimal::ZERO),
            filled_avg_price: fields.filled_avg_price,
            raw,
        })
    }
}

impl AlpacaOrder {
    /// Normalized order status
    pub fn broker_status(&self) -> BrokerOrderStatus {
        map_status(&self.status)
    }

    /// Convert to the broker-neutral fill report
    pub fn report(&self) -> Result<BrokerOrderReport, ExecError> {
        let avg_fill_price = match self.filled_avg_price {
            Some(price) if price > Decimal::ZERO => Some(Price::new(price)?),
            _ => None,
        };
        Ok(BrokerOrderReport {
            broker_order_id: self.id.clone(),
            status: self.broker_status(),
            filled_quantity: self.filled_qty,
            avg_fill_price,
            raw: self.raw.clone(),
        })
    }
}

/// Latest trade response.
#[derive(Debug, Deserialize)]
struct LatestTradeResponse {
    trade: Option<LatestTrade>,
}

#[derive(Debug, Deserialize)]
struct LatestTrade {
    #[serde(rename = "p")]
    price: Decimal,
}

// =============================================================================
// Tests
// =============================================================================
