//! Venue integrations.
//!
//! Provides REST and WebSocket connectivity for Binance spot and futures:
//! - Market data feeds (mark price, last trade, order book depth)
//! - Signed order operations (create, cancel, edit)
//! - Historical orders and account trades for reconciliation
//! - A connectivity probe gating stale-socket reconnects

mod client;
mod probe;
mod types;
mod websocket;

pub use client::{ApiError, VenueClient};
pub use probe::ConnectivityProbe;
pub use types::*;
pub use websocket::{FeedError, FeedMessage, MarketFeed};
