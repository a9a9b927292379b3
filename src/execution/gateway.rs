//! Order execution gateway.
//!
//! Submits create/cancel/edit requests with authentication, bounded retry, and
//! duplicate-submission protection. A retry only proceeds after the duplicate
//! cache has been checked: a cache hit means the order filled through an
//! out-of-band channel despite the request-level failure, and resubmitting
//! would conflict.

use crate::config::ExecutionConfig;
use crate::exchange::{
    ApiError, CancelOrder, EditOrder, FillRecord, NewOrder, OrderAck, VenueClient,
};
use crate::execution::cache::DupeCache;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// A request the gateway can submit.
#[derive(Debug, Clone)]
pub enum OrderAction {
    Create(NewOrder),
    Cancel(CancelOrder),
    Edit(EditOrder),
}

impl OrderAction {
    pub fn symbol(&self) -> &str {
        match self {
            OrderAction::Create(o) => &o.symbol,
            OrderAction::Cancel(c) => &c.symbol,
            OrderAction::Edit(e) => &e.symbol,
        }
    }

    /// The idempotency token attached to this action, when present.
    pub fn client_order_id(&self) -> Option<&str> {
        match self {
            OrderAction::Create(o) => o.new_client_order_id.as_deref(),
            OrderAction::Cancel(c) => Some(&c.orig_client_order_id),
            OrderAction::Edit(e) => Some(&e.orig_client_order_id),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OrderAction::Create(_) => "create",
            OrderAction::Cancel(_) => "cancel",
            OrderAction::Edit(_) => "edit",
        }
    }
}

/// Terminal success of a submission.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// The venue acknowledged the request.
    Placed(OrderAck),
    /// A retry discovered the order already filled out-of-band; no further
    /// request was issued.
    AlreadyExecuted(FillRecord),
}

/// Terminal failure of a submission. Carries the original request parameters
/// for operator diagnosis.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("{} {} rejected by venue (code {code}): {message}", .action.kind(), .action.symbol())]
    Rejected {
        code: i64,
        message: String,
        action: OrderAction,
    },
    #[error("{} {} failed after {attempts} attempts: {last}", .action.kind(), .action.symbol())]
    RetriesExhausted {
        attempts: u32,
        last: String,
        action: OrderAction,
    },
}

/// Terminal outcome notification published to subscribers.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    Success {
        symbol: String,
        client_order_id: Option<String>,
        already_executed: bool,
    },
    Error {
        symbol: String,
        client_order_id: Option<String>,
        reason: String,
    },
}

/// Gateway for one venue/subaccount pairing, sharing a duplicate cache with
/// that pairing's stream manager.
pub struct ExecutionGateway {
    client: Arc<VenueClient>,
    cache: Arc<DupeCache>,
    max_retries: u32,
    events: broadcast::Sender<GatewayEvent>,
}

impl ExecutionGateway {
    pub fn new(client: Arc<VenueClient>, cache: Arc<DupeCache>, config: &ExecutionConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            client,
            cache,
            max_retries: config.max_retries,
            events,
        }
    }

    /// Subscribe to terminal success/error notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    /// The duplicate cache shared with the owning stream manager.
    pub fn cache(&self) -> Arc<DupeCache> {
        Arc::clone(&self.cache)
    }

    /// Submit an action with bounded retry and duplicate protection.
    pub async fn submit(&self, action: OrderAction) -> Result<SubmitOutcome, ExecutionError> {
        let client_order_id = action.client_order_id().map(str::to_string);
        let mut last_error = String::new();

        for attempt in 1..=self.max_retries {
            match self.send(&action).await {
                Ok(ack) => {
                    // A confirmed placement supersedes any out-of-band record.
                    if let Some(id) = &client_order_id {
                        self.cache.remove(id);
                    }
                    info!(
                        symbol = %action.symbol(),
                        kind = action.kind(),
                        order_id = ack.order_id,
                        status = ?ack.status,
                        attempt,
                        "Order request acknowledged"
                    );
                    self.publish(GatewayEvent::Success {
                        symbol: action.symbol().to_string(),
                        client_order_id,
                        already_executed: false,
                    });
                    return Ok(SubmitOutcome::Placed(ack));
                }
                Err(ApiError::Rejected { code, message }) => {
                    error!(
                        symbol = %action.symbol(),
                        kind = action.kind(),
                        code,
                        message = %message,
                        "Venue rejected request, not retrying"
                    );
                    self.publish(GatewayEvent::Error {
                        symbol: action.symbol().to_string(),
                        client_order_id,
                        reason: message.clone(),
                    });
                    return Err(ExecutionError::Rejected {
                        code,
                        message,
                        action,
                    });
                }
                Err(e) => {
                    warn!(
                        symbol = %action.symbol(),
                        kind = action.kind(),
                        attempt,
                        max_retries = self.max_retries,
                        error = %e,
                        "Transient submission failure"
                    );
                    last_error = e.to_string();

                    // Settle past the receive window so the venue has resolved
                    // the in-flight request before we inspect or resend.
                    tokio::time::sleep(self.client.recv_window()).await;

                    if let Some(id) = &client_order_id {
                        if let Some(fill) = self.cache.remove(id) {
                            info!(
                                symbol = %action.symbol(),
                                client_order_id = %id,
                                "Order already executed out-of-band, stopping retries"
                            );
                            self.publish(GatewayEvent::Success {
                                symbol: action.symbol().to_string(),
                                client_order_id,
                                already_executed: true,
                            });
                            return Ok(SubmitOutcome::AlreadyExecuted(fill));
                        }
                    }
                }
            }
        }

        self.publish(GatewayEvent::Error {
            symbol: action.symbol().to_string(),
            client_order_id,
            reason: last_error.clone(),
        });
        Err(ExecutionError::RetriesExhausted {
            attempts: self.max_retries,
            last: last_error,
            action,
        })
    }

    async fn send(&self, action: &OrderAction) -> Result<OrderAck, ApiError> {
        match action {
            OrderAction::Create(order) => self.client.place_order(order).await,
            OrderAction::Cancel(cancel) => self.client.cancel_order(cancel).await,
            OrderAction::Edit(edit) => self.client.edit_order(edit).await,
        }
    }

    fn publish(&self, event: GatewayEvent) {
        // Nobody listening is fine; events are best-effort notifications.
        let _ = self.events.send(event);
    }
}
