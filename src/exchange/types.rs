//! Type definitions for venue API requests and responses.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A venue is one tradable API surface; spot and futures are distinct venues
/// with their own endpoints, even on the same exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Venue {
    BinanceSpot,
    BinanceFutures,
}

impl Venue {
    /// REST API base URL.
    pub fn rest_base(&self) -> &'static str {
        match self {
            Venue::BinanceSpot => "https://api.binance.com",
            Venue::BinanceFutures => "https://fapi.binance.com",
        }
    }

    /// WebSocket stream base URL.
    pub fn ws_base(&self) -> &'static str {
        match self {
            Venue::BinanceSpot => "wss://stream.binance.com:9443",
            Venue::BinanceFutures => "wss://fstream.binance.com",
        }
    }

    /// Path prefix for the trading API (`/api/v3` spot, `/fapi/v1` futures).
    pub fn api_prefix(&self) -> &'static str {
        match self {
            Venue::BinanceSpot => "/api/v3",
            Venue::BinanceFutures => "/fapi/v1",
        }
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Venue::BinanceSpot => write!(f, "binance-spot"),
            Venue::BinanceFutures => write!(f, "binance-futures"),
        }
    }
}

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "LIMIT",
            OrderType::Market => "MARKET",
        }
    }
}

/// Time in force for limit orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Gtc, // Good Till Cancel
    Ioc, // Immediate or Cancel
    Fok, // Fill or Kill
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Gtc => "GTC",
            TimeInForce::Ioc => "IOC",
            TimeInForce::Fok => "FOK",
        }
    }
}

/// Order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
    ExpiredInMatch,
}

impl OrderStatus {
    /// Whether the order reached a fully executed terminal state.
    pub fn is_filled(&self) -> bool {
        matches!(self, OrderStatus::Filled)
    }
}

/// New order request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    pub symbol: String,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub quantity: Option<Decimal>,
    pub price: Option<Decimal>,
    pub time_in_force: Option<TimeInForce>,
    pub reduce_only: Option<bool>,
    pub new_client_order_id: Option<String>,
}

/// Cancel request, keyed by the caller-assigned client order id.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOrder {
    pub symbol: String,
    pub orig_client_order_id: String,
}

/// Order modification request (price and/or quantity).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EditOrder {
    pub symbol: String,
    pub orig_client_order_id: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Decimal,
}

/// Order acknowledgment from the venue.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    pub order_id: i64,
    pub symbol: String,
    pub status: OrderStatus,
    pub client_order_id: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub avg_price: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::str")]
    pub orig_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub executed_qty: Decimal,
    pub side: OrderSide,
    pub update_time: i64,
}

/// Structured error body returned by the venue.
#[derive(Debug, Clone, Deserialize)]
pub struct VenueErrorBody {
    pub code: i64,
    pub msg: String,
}

/// Historical order record from the paged order-history endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalOrder {
    pub order_id: i64,
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub status: OrderStatus,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub avg_price: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::str")]
    pub executed_qty: Decimal,
    pub update_time: i64,
}

/// Trade record from the live account-trades endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountTrade {
    pub id: i64,
    pub order_id: i64,
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub qty: Decimal,
    pub buyer: bool,
    pub time: i64,
}

/// Canonical executed-fill record shared by the gateway and reconciliation.
///
/// The composite dedup key is `(order_id, client_order_id, price,
/// executed_qty)`; both writers of the durable store use it so neither can
/// reintroduce a record the other removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FillRecord {
    pub order_id: i64,
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub executed_qty: Decimal,
    pub status: OrderStatus,
    /// Execution time in epoch milliseconds
    pub transact_time: i64,
}

impl FillRecord {
    /// Composite key identifying a fill across representations.
    pub fn composite_key(&self) -> (i64, &str, Decimal, Decimal) {
        (
            self.order_id,
            self.client_order_id.as_str(),
            self.price,
            self.executed_qty,
        )
    }
}

impl From<&HistoricalOrder> for FillRecord {
    fn from(order: &HistoricalOrder) -> Self {
        Self {
            order_id: order.order_id,
            client_order_id: order.client_order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            // Aggregate records carry the average execution price when present
            price: order.avg_price.filter(|p| !p.is_zero()).unwrap_or(order.price),
            executed_qty: order.executed_qty,
            status: order.status,
            transact_time: order.update_time,
        }
    }
}

/// One price level of an order book side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceLevel {
    pub price: Decimal,
    pub qty: Decimal,
}

/// Order book snapshot with best-first ordering on both sides.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthSnapshot {
    pub symbol: String,
    /// Bids, best (highest) first
    pub bids: Vec<PriceLevel>,
    /// Asks, best (lowest) first
    pub asks: Vec<PriceLevel>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_venue_endpoints() {
        assert_eq!(Venue::BinanceFutures.api_prefix(), "/fapi/v1");
        assert_eq!(Venue::BinanceSpot.api_prefix(), "/api/v3");
        assert_eq!(Venue::BinanceFutures.to_string(), "binance-futures");
    }

    #[test]
    fn test_fill_from_historical_prefers_avg_price() {
        let order = HistoricalOrder {
            order_id: 77,
            client_order_id: "v1:4".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            status: OrderStatus::Filled,
            price: dec!(100),
            avg_price: Some(dec!(100.5)),
            executed_qty: dec!(2),
            update_time: 1_700_000_000_000,
        };

        let fill = FillRecord::from(&order);
        assert_eq!(fill.price, dec!(100.5));
        assert_eq!(fill.composite_key(), (77, "v1:4", dec!(100.5), dec!(2)));
    }

    #[test]
    fn test_fill_from_historical_falls_back_to_limit_price() {
        let order = HistoricalOrder {
            order_id: 78,
            client_order_id: "v1:5".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Sell,
            status: OrderStatus::Filled,
            price: dec!(101),
            avg_price: Some(Decimal::ZERO),
            executed_qty: dec!(1),
            update_time: 1_700_000_000_000,
        };

        assert_eq!(FillRecord::from(&order).price, dec!(101));
    }
}
