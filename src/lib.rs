//! # Grid Hedger
//!
//! A Rust trading core that keeps a fleet of always-on market-data connections
//! alive, turns streamed prices into trigger events against a precomputed price
//! grid, executes the resulting orders idempotently, reconciles fills against
//! exchange history, and runs a two-leg delta-hedge decision loop.
//!
//! ## Architecture
//!
//! - `config`: Configuration management, validation, and typed credential lookup
//! - `exchange`: Binance API client (REST + WebSocket) and connectivity probe
//! - `stream`: Instrument stream manager with trigger-grid crossing detection
//! - `execution`: Order gateway with bounded retry and duplicate-submission cache
//! - `reconcile`: Scheduled fill reconciliation against venue order history
//! - `hedge`: Order-book-depth-aware delta-hedge decision loop
//! - `store`: Abstract document store (SQLite and in-memory backends)
//! - `utils`: Shared decimal arithmetic helpers

pub mod config;
pub mod exchange;
pub mod execution;
pub mod hedge;
pub mod reconcile;
pub mod store;
pub mod stream;
pub mod utils;

pub use config::Config;
