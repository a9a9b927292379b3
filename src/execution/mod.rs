//! Order execution with idempotent retrying.
//!
//! - `DupeCache`: bounded duplicate-submission cache shared between the
//!   gateway's retry path and the stream manager's fill callback
//! - `retry`: typed retry policy separating transient from fatal failures
//! - `ExecutionGateway`: signed create/cancel/edit submission with bounded
//!   retry and out-of-band fill detection

mod cache;
mod gateway;
mod retry;

pub use cache::DupeCache;
pub use gateway::{ExecutionGateway, ExecutionError, GatewayEvent, OrderAction, SubmitOutcome};
pub use retry::{retry, RetryError};
