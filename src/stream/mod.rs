//! Market data stream management.
//!
//! Keeps one or two venue connections alive per instrument, exposes the latest
//! price or ratio, and turns grid crossings into discrete trigger events
//! without missing intermediate levels on a price jump.

mod grid;
mod manager;

pub use grid::{GridBounds, GridPoint, GridSide, TriggerEvent, TriggerGrid};
pub use manager::{
    ConnState, GridLoader, InstrumentStream, OrderIntent, StreamError, StreamEvent, TriggerWorker,
};
