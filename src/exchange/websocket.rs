//! WebSocket market-data feeds.
//!
//! One connection per instrument leg. The transport owns its reconnect policy
//! (exponential backoff, capped); staleness detection lives upstream in the
//! stream manager, which decides *when* to reconnect.

use crate::config::FeedKind;
use crate::exchange::types::{DepthSnapshot, PriceLevel, Venue};
use futures_util::stream::{SplitStream, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);
const CONNECT_ATTEMPTS: u32 = 8;

/// Errors from the feed transport.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("websocket connect failed after {attempts} attempts: {last}")]
    ConnectExhausted { attempts: u32, last: String },
    #[error("websocket stream error: {0}")]
    Stream(String),
    #[error("websocket closed by server")]
    Closed,
}

/// Parsed inbound feed message.
#[derive(Debug, Clone)]
pub enum FeedMessage {
    /// Numeric price from a mark/last feed
    Price(Decimal),
    /// Order book snapshot from a depth feed
    Depth(DepthSnapshot),
}

#[derive(Debug, Deserialize)]
struct MarkPricePayload {
    #[serde(rename = "p")]
    mark_price: String,
}

#[derive(Debug, Deserialize)]
struct TradePayload {
    #[serde(rename = "p")]
    price: String,
}

#[derive(Debug, Deserialize)]
struct DepthPayload {
    // Futures streams use short keys, spot partial-depth uses long ones.
    #[serde(default, rename = "b", alias = "bids")]
    bids: Vec<[String; 2]>,
    #[serde(default, rename = "a", alias = "asks")]
    asks: Vec<[String; 2]>,
}

/// One live market-data connection for a single symbol.
pub struct MarketFeed {
    symbol: String,
    kind: FeedKind,
    read: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl MarketFeed {
    /// Stream endpoint for a symbol and feed kind.
    fn stream_url(venue: Venue, symbol: &str, kind: FeedKind) -> String {
        let channel = match kind {
            FeedKind::Mark => format!("{}@markPrice@1s", symbol.to_lowercase()),
            FeedKind::Last => format!("{}@trade", symbol.to_lowercase()),
            FeedKind::Depth => format!("{}@depth20@100ms", symbol.to_lowercase()),
        };
        format!("{}/ws/{}", venue.ws_base(), channel)
    }

    /// Connect with the transport's own retry policy: exponential backoff,
    /// bounded attempts.
    pub async fn connect(venue: Venue, symbol: &str, kind: FeedKind) -> Result<Self, FeedError> {
        let url = Self::stream_url(venue, symbol, kind);
        let mut delay = BACKOFF_INITIAL;
        let mut last_err = String::new();

        for attempt in 1..=CONNECT_ATTEMPTS {
            info!(%url, attempt, "Connecting to market feed");
            match connect_async(&url).await {
                Ok((ws_stream, _)) => {
                    let (_write, read) = ws_stream.split();
                    return Ok(Self {
                        symbol: symbol.to_string(),
                        kind,
                        read,
                    });
                }
                Err(e) => {
                    last_err = e.to_string();
                    warn!(%url, attempt, error = %last_err, "Feed connect failed, backing off");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(BACKOFF_MAX);
                }
            }
        }

        Err(FeedError::ConnectExhausted {
            attempts: CONNECT_ATTEMPTS,
            last: last_err,
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Next parsed message. Malformed payloads are dropped with a warning and
    /// the read continues; `Err` means the connection itself is gone.
    pub async fn next(&mut self) -> Result<FeedMessage, FeedError> {
        while let Some(msg) = self.read.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    match parse_payload(self.kind, &self.symbol, &text) {
                        Some(parsed) => return Ok(parsed),
                        None => {
                            warn!(symbol = %self.symbol, "Dropping malformed feed payload");
                        }
                    }
                }
                Ok(Message::Ping(_)) => {
                    debug!(symbol = %self.symbol, "Received ping");
                    // Pong is handled automatically by tungstenite
                }
                Ok(Message::Close(_)) => {
                    info!(symbol = %self.symbol, "Feed closed by server");
                    return Err(FeedError::Closed);
                }
                Err(e) => {
                    return Err(FeedError::Stream(e.to_string()));
                }
                _ => {}
            }
        }

        Err(FeedError::Closed)
    }
}

/// Parse a venue payload into a feed message; `None` drops the payload.
fn parse_payload(kind: FeedKind, symbol: &str, text: &str) -> Option<FeedMessage> {
    match kind {
        FeedKind::Mark => {
            let payload: MarkPricePayload = serde_json::from_str(text).ok()?;
            Decimal::from_str(&payload.mark_price)
                .ok()
                .map(FeedMessage::Price)
        }
        FeedKind::Last => {
            let payload: TradePayload = serde_json::from_str(text).ok()?;
            Decimal::from_str(&payload.price).ok().map(FeedMessage::Price)
        }
        FeedKind::Depth => {
            let payload: DepthPayload = serde_json::from_str(text).ok()?;
            Some(FeedMessage::Depth(DepthSnapshot {
                symbol: symbol.to_string(),
                bids: parse_levels(&payload.bids)?,
                asks: parse_levels(&payload.asks)?,
            }))
        }
    }
}

fn parse_levels(raw: &[[String; 2]]) -> Option<Vec<PriceLevel>> {
    raw.iter()
        .map(|[price, qty]| {
            Some(PriceLevel {
                price: Decimal::from_str(price).ok()?,
                qty: Decimal::from_str(qty).ok()?,
            })
        })
        .collect()
}
