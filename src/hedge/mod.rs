//! Delta-hedge decision loop.
//!
//! Decides, from live order-book depth on two venues, whether a hedge can be
//! entered at size, and fires both legs together once a confirmation
//! threshold is met.

mod depth;
mod runner;

pub use depth::achievable_price;
pub use runner::{
    Decision, HedgeEvaluator, HedgeLeg, HedgeLegHandle, HedgeLoop, HedgeOutcome, HedgeState,
    UnfavorableReason,
};
