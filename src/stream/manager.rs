//! Instrument stream manager.
//!
//! Owns one or two feed connections per monitored instrument, keeps the latest
//! price (or ratio price) current, and turns grid crossings into discrete
//! trigger events. Each leg runs its own connection task; a single processing
//! task consumes parsed samples in arrival order so trigger evaluation for an
//! instrument is strictly ordered, and one slow venue call can never stall
//! another instrument's updates.

use crate::config::StreamConfig;
use crate::exchange::{
    CancelOrder, ConnectivityProbe, DepthSnapshot, EditOrder, FeedMessage, FillRecord,
    MarketFeed, NewOrder, OrderSide, OrderType, TimeInForce,
};
use crate::execution::{DupeCache, ExecutionError, ExecutionGateway, OrderAction, SubmitOutcome};
use crate::stream::grid::{GridBounds, GridSide, TriggerEvent, TriggerGrid};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Errors surfaced by the stream manager.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("stream has been closed")]
    Closed,
    #[error("stream is already open")]
    AlreadyOpen,
    #[error("invalid grid: {0}")]
    InvalidGrid(String),
    #[error("grid load failed: {0}")]
    GridLoad(String),
}

/// Connection lifecycle state of one leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Open,
    Stale,
    Recovering,
    Closing,
    Closed,
}

/// Events emitted by an open stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A grid level was crossed
    Trigger(TriggerEvent),
    /// Observable price update (only when `announce_prices` is set)
    Price { price: Decimal },
    /// Order book snapshot from a depth feed
    Depth { leg: usize, snapshot: DepthSnapshot },
    LegConnected { leg: usize },
    LegDisconnected { leg: usize },
}

/// Lazily-loaded grid source, resolved once at `open()`.
#[async_trait]
pub trait GridLoader: Send + Sync {
    async fn load(&self) -> Result<Vec<Decimal>, String>;
}

/// Offloaded per-trigger work, run outside the price-processing path.
pub type TriggerWorker = Arc<dyn Fn(TriggerEvent) + Send + Sync>;

/// A strategy decision bound to a grid coordinate.
///
/// Renders the globally unique client order id (`tag:grid` or
/// `tag:grid/side`) used both as the exchange-facing idempotency token and as
/// the reconciliation join key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderIntent {
    pub tag: String,
    pub grid_index: usize,
    pub side: Option<GridSide>,
}

impl OrderIntent {
    pub fn new(tag: impl Into<String>, grid_index: usize) -> Self {
        Self {
            tag: tag.into(),
            grid_index,
            side: None,
        }
    }

    pub fn with_side(mut self, side: GridSide) -> Self {
        self.side = Some(side);
        self
    }

    pub fn client_order_id(&self) -> String {
        match self.side {
            Some(side) => format!("{}:{}/{}", self.tag, self.grid_index, side.as_str()),
            None => format!("{}:{}", self.tag, self.grid_index),
        }
    }
}

/// Message from a leg task to the processing task.
enum ProcMsg {
    Sample { leg: usize, message: FeedMessage },
    ResetGrid(TriggerGrid),
}

/// Manager for one monitored instrument.
///
/// `open()` spawns the leg and processing tasks and hands back the event
/// receiver; `close()` is terminal and idempotent.
pub struct InstrumentStream {
    config: StreamConfig,
    gateway: Arc<ExecutionGateway>,
    probe: ConnectivityProbe,
    cache: Arc<DupeCache>,
    grid_loader: Option<Arc<dyn GridLoader>>,
    trigger_worker: Option<TriggerWorker>,
    opened: AtomicBool,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    proc_tx: Mutex<Option<mpsc::Sender<ProcMsg>>>,
    conn_states: Arc<Mutex<Vec<ConnState>>>,
}

impl InstrumentStream {
    pub fn new(
        config: StreamConfig,
        gateway: Arc<ExecutionGateway>,
        probe: ConnectivityProbe,
    ) -> Self {
        let legs = config.symbols.len();
        let cache = gateway.cache();
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            gateway,
            probe,
            cache,
            grid_loader: None,
            trigger_worker: None,
            opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            proc_tx: Mutex::new(None),
            conn_states: Arc::new(Mutex::new(vec![ConnState::Closed; legs])),
        }
    }

    /// Use a lazily-loaded grid instead of inline config levels.
    pub fn with_grid_loader(mut self, loader: Arc<dyn GridLoader>) -> Self {
        self.grid_loader = Some(loader);
        self
    }

    /// Dispatch a unit of work per trigger outside the price path.
    pub fn with_trigger_worker(mut self, worker: TriggerWorker) -> Self {
        self.trigger_worker = Some(worker);
        self
    }

    /// Symbol used for order placement (the first leg).
    pub fn primary_symbol(&self) -> &str {
        &self.config.symbols[0]
    }

    pub fn conn_state(&self, leg: usize) -> ConnState {
        self.conn_states.lock().unwrap()[leg]
    }

    /// Open the stream: resolve the grid, connect every leg, start processing.
    ///
    /// Calling `open()` after `close()` is a no-op beyond a logged notice.
    pub async fn open(&self) -> Result<mpsc::Receiver<StreamEvent>, StreamError> {
        if self.closed.load(Ordering::SeqCst) {
            info!(
                symbol = %self.primary_symbol(),
                "Stream already closed; open() is a no-op"
            );
            return Err(StreamError::Closed);
        }
        if self.opened.swap(true, Ordering::SeqCst) {
            return Err(StreamError::AlreadyOpen);
        }

        let grid = self.resolve_grid().await?;

        let (event_tx, event_rx) = mpsc::channel(256);
        let (proc_tx, proc_rx) = mpsc::channel(1024);
        *self.proc_tx.lock().unwrap() = Some(proc_tx.clone());

        let mut tasks = self.tasks.lock().unwrap();

        tasks.push(tokio::spawn(run_processor(ProcessorParams {
            symbol: self.primary_symbol().to_string(),
            two_legged: self.config.symbols.len() == 2,
            announce: self.config.announce_prices,
            grid,
            rx: proc_rx,
            event_tx: event_tx.clone(),
            worker: self.trigger_worker.clone(),
        })));

        for (leg, symbol) in self.config.symbols.iter().enumerate() {
            tasks.push(tokio::spawn(run_leg(LegParams {
                leg,
                venue: self.config.venue,
                symbol: symbol.clone(),
                kind: self.config.feed,
                control_time: Duration::from_secs(self.config.control_time_secs),
                probe: self.probe.clone(),
                proc_tx: proc_tx.clone(),
                event_tx: event_tx.clone(),
                shutdown: self.shutdown.subscribe(),
                states: Arc::clone(&self.conn_states),
            })));
        }

        info!(
            symbol = %self.primary_symbol(),
            legs = self.config.symbols.len(),
            feed = ?self.config.feed,
            "Instrument stream opened"
        );
        Ok(event_rx)
    }

    async fn resolve_grid(&self) -> Result<Option<TriggerGrid>, StreamError> {
        if !self.config.grid.is_empty() {
            return TriggerGrid::new(self.config.grid.clone())
                .map(Some)
                .map_err(StreamError::InvalidGrid);
        }

        if let Some(loader) = &self.grid_loader {
            let levels = loader.load().await.map_err(StreamError::GridLoad)?;
            return TriggerGrid::new(levels)
                .map(Some)
                .map_err(StreamError::InvalidGrid);
        }

        Ok(None)
    }

    /// Swap in a new grid; bounds are re-derived on the next price update.
    pub async fn reset_grid(&self, levels: Vec<Decimal>) -> Result<(), StreamError> {
        let grid = TriggerGrid::new(levels).map_err(StreamError::InvalidGrid)?;
        let tx = self.proc_tx.lock().unwrap().clone();
        match tx {
            Some(tx) => tx
                .send(ProcMsg::ResetGrid(grid))
                .await
                .map_err(|_| StreamError::Closed),
            None => Err(StreamError::Closed),
        }
    }

    /// Terminal close: stops every timer and task, detaches listeners.
    ///
    /// Idempotent; in-flight network calls already issued complete or fail on
    /// their own.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut states = self.conn_states.lock().unwrap();
            states.iter_mut().for_each(|s| *s = ConnState::Closing);
        }

        let _ = self.shutdown.send(true);
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        *self.proc_tx.lock().unwrap() = None;

        {
            let mut states = self.conn_states.lock().unwrap();
            states.iter_mut().for_each(|s| *s = ConnState::Closed);
        }

        info!(symbol = %self.primary_symbol(), "Instrument stream closed");
    }

    /// Record a fill observed through the venue's own fill stream. The
    /// execution gateway checks this cache before retrying a failed request.
    pub fn record_out_of_band_fill(&self, fill: FillRecord) {
        let id = fill.client_order_id.clone();
        self.cache.insert(&id, fill);
    }

    // ==================== Order helpers ====================
    // Thin retrying façade over the execution gateway, parameterized with this
    // instrument's symbol.

    pub async fn create_order(
        &self,
        intent: &OrderIntent,
        side: OrderSide,
        order_type: OrderType,
        quantity: Decimal,
        price: Option<Decimal>,
    ) -> Result<SubmitOutcome, ExecutionError> {
        let order = NewOrder {
            symbol: self.primary_symbol().to_string(),
            side,
            order_type,
            quantity: Some(quantity),
            price,
            time_in_force: matches!(order_type, OrderType::Limit).then_some(TimeInForce::Gtc),
            reduce_only: None,
            new_client_order_id: Some(intent.client_order_id()),
        };
        self.gateway.submit(OrderAction::Create(order)).await
    }

    pub async fn cancel_order(&self, intent: &OrderIntent) -> Result<SubmitOutcome, ExecutionError> {
        let cancel = CancelOrder {
            symbol: self.primary_symbol().to_string(),
            orig_client_order_id: intent.client_order_id(),
        };
        self.gateway.submit(OrderAction::Cancel(cancel)).await
    }

    pub async fn edit_order(
        &self,
        intent: &OrderIntent,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<SubmitOutcome, ExecutionError> {
        let edit = EditOrder {
            symbol: self.primary_symbol().to_string(),
            orig_client_order_id: intent.client_order_id(),
            side,
            quantity,
            price,
        };
        self.gateway.submit(OrderAction::Edit(edit)).await
    }
}

struct LegParams {
    leg: usize,
    venue: crate::exchange::Venue,
    symbol: String,
    kind: crate::config::FeedKind,
    control_time: Duration,
    probe: ConnectivityProbe,
    proc_tx: mpsc::Sender<ProcMsg>,
    event_tx: mpsc::Sender<StreamEvent>,
    shutdown: watch::Receiver<bool>,
    states: Arc<Mutex<Vec<ConnState>>>,
}

fn set_state(states: &Arc<Mutex<Vec<ConnState>>>, leg: usize, state: ConnState) {
    states.lock().unwrap()[leg] = state;
}

/// One leg's connection loop: connect, pump messages, detect staleness.
async fn run_leg(mut params: LegParams) {
    loop {
        if *params.shutdown.borrow() {
            return;
        }

        set_state(&params.states, params.leg, ConnState::Connecting);
        let connect = MarketFeed::connect(params.venue, &params.symbol, params.kind);
        let mut feed = tokio::select! {
            _ = params.shutdown.changed() => return,
            result = connect => match result {
                Ok(feed) => feed,
                Err(e) => {
                    // The transport already exhausted its own backoff policy.
                    error!(
                        symbol = %params.symbol,
                        leg = params.leg,
                        error = %e,
                        "Feed connection exhausted its retry policy"
                    );
                    set_state(&params.states, params.leg, ConnState::Closed);
                    let _ = params
                        .event_tx
                        .send(StreamEvent::LegDisconnected { leg: params.leg })
                        .await;
                    return;
                }
            },
        };

        set_state(&params.states, params.leg, ConnState::Open);
        let _ = params
            .event_tx
            .send(StreamEvent::LegConnected { leg: params.leg })
            .await;

        // The staleness timer re-arms on every inbound message: each select
        // iteration races the next message against a fresh control window.
        loop {
            tokio::select! {
                _ = params.shutdown.changed() => return,
                message = feed.next() => match message {
                    Ok(msg) => {
                        if params
                            .proc_tx
                            .send(ProcMsg::Sample { leg: params.leg, message: msg })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(
                            symbol = %params.symbol,
                            leg = params.leg,
                            error = %e,
                            "Feed dropped, reconnecting"
                        );
                        set_state(&params.states, params.leg, ConnState::Recovering);
                        let _ = params
                            .event_tx
                            .send(StreamEvent::LegDisconnected { leg: params.leg })
                            .await;
                        break;
                    }
                },
                _ = tokio::time::sleep(params.control_time) => {
                    // Socket reports open but has stopped delivering.
                    set_state(&params.states, params.leg, ConnState::Stale);
                    warn!(
                        symbol = %params.symbol,
                        leg = params.leg,
                        control_secs = params.control_time.as_secs(),
                        "No message within control time, checking connectivity"
                    );

                    // Reconnect only once general connectivity is confirmed;
                    // a failed probe reschedules the check instead of
                    // hammering the venue while the outage is local.
                    loop {
                        if *params.shutdown.borrow() {
                            return;
                        }
                        if params.probe.is_online().await {
                            break;
                        }
                        debug!(
                            symbol = %params.symbol,
                            leg = params.leg,
                            "Connectivity probe failed, rescheduling check"
                        );
                        tokio::select! {
                            _ = params.shutdown.changed() => return,
                            _ = tokio::time::sleep(params.control_time) => {}
                        }
                    }

                    set_state(&params.states, params.leg, ConnState::Recovering);
                    let _ = params
                        .event_tx
                        .send(StreamEvent::LegDisconnected { leg: params.leg })
                        .await;
                    break;
                }
            }
        }
    }
}

struct ProcessorParams {
    symbol: String,
    two_legged: bool,
    announce: bool,
    grid: Option<TriggerGrid>,
    rx: mpsc::Receiver<ProcMsg>,
    event_tx: mpsc::Sender<StreamEvent>,
    worker: Option<TriggerWorker>,
}

/// Combine leg prices into the instrument price.
///
/// The ratio is only valid once both legs have reported a non-zero price;
/// until then the single populated leg is authoritative.
fn effective_price(two_legged: bool, legs: &[Option<Decimal>; 2]) -> Option<Decimal> {
    let first = legs[0].unwrap_or(Decimal::ZERO);
    if !two_legged {
        return (!first.is_zero()).then_some(first);
    }

    let second = legs[1].unwrap_or(Decimal::ZERO);
    if !first.is_zero() && !second.is_zero() {
        Some(first / second)
    } else if !first.is_zero() {
        Some(first)
    } else if !second.is_zero() {
        Some(second)
    } else {
        None
    }
}

/// Ordered per-instrument processing: price merging, trigger evaluation,
/// event emission.
async fn run_processor(mut params: ProcessorParams) {
    let mut leg_prices: [Option<Decimal>; 2] = [None, None];
    let mut last_price: Option<Decimal> = None;
    let mut bounds: Option<GridBounds> = None;

    while let Some(msg) = params.rx.recv().await {
        match msg {
            ProcMsg::ResetGrid(grid) => {
                info!(symbol = %params.symbol, levels = grid.len(), "Grid reset");
                params.grid = Some(grid);
                bounds = None;
            }
            ProcMsg::Sample { leg, message: FeedMessage::Depth(snapshot) } => {
                if params
                    .event_tx
                    .send(StreamEvent::Depth { leg, snapshot })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            ProcMsg::Sample { leg, message: FeedMessage::Price(price) } => {
                leg_prices[leg] = Some(price);
                let Some(price) = effective_price(params.two_legged, &leg_prices) else {
                    continue;
                };

                // Unchanged price is a no-op for trigger purposes.
                if last_price == Some(price) {
                    continue;
                }
                last_price = Some(price);

                if params.announce
                    && params
                        .event_tx
                        .send(StreamEvent::Price { price })
                        .await
                        .is_err()
                {
                    return;
                }

                let Some(grid) = &params.grid else { continue };

                match bounds {
                    None => {
                        // First observation (or first after a reset) only
                        // initializes the bounds.
                        let initial = grid.bounds(price);
                        debug!(
                            symbol = %params.symbol,
                            %price,
                            lower = ?initial.lower,
                            upper = ?initial.upper,
                            "Trigger bounds initialized"
                        );
                        bounds = Some(initial);
                    }
                    Some(current) => {
                        if let Some((next, events)) = grid.crossings(&current, price) {
                            bounds = Some(next);
                            for event in events {
                                info!(
                                    symbol = %params.symbol,
                                    index = event.index,
                                    level = %event.level,
                                    side = event.side.as_str(),
                                    %price,
                                    "Grid level crossed"
                                );
                                if let Some(worker) = &params.worker {
                                    let worker = Arc::clone(worker);
                                    let work_event = event.clone();
                                    tokio::spawn(async move { worker(work_event) });
                                }
                                if params
                                    .event_tx
                                    .send(StreamEvent::Trigger(event))
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_client_order_id_rendering() {
        let intent = OrderIntent::new("v2", 7);
        assert_eq!(intent.client_order_id(), "v2:7");

        let sided = OrderIntent::new("v2", 7).with_side(GridSide::Upper);
        assert_eq!(sided.client_order_id(), "v2:7/upper");
    }

    #[test]
    fn test_effective_price_single_leg() {
        assert_eq!(effective_price(false, &[Some(dec!(101)), None]), Some(dec!(101)));
        assert_eq!(effective_price(false, &[Some(dec!(0)), None]), None);
        assert_eq!(effective_price(false, &[None, None]), None);
    }

    #[test]
    fn test_effective_price_ratio_requires_both_legs() {
        // One leg only: that leg is authoritative.
        assert_eq!(effective_price(true, &[Some(dec!(30000)), None]), Some(dec!(30000)));
        assert_eq!(effective_price(true, &[None, Some(dec!(1500))]), Some(dec!(1500)));
        // Both legs non-zero: ratio.
        assert_eq!(
            effective_price(true, &[Some(dec!(30000)), Some(dec!(1500))]),
            Some(dec!(20))
        );
        // A zero leg never contributes to the ratio.
        assert_eq!(
            effective_price(true, &[Some(dec!(30000)), Some(dec!(0))]),
            Some(dec!(30000))
        );
    }

    async fn drive_processor(
        grid_levels: Vec<Decimal>,
        announce: bool,
        two_legged: bool,
        samples: Vec<(usize, Decimal)>,
    ) -> Vec<StreamEvent> {
        let (proc_tx, proc_rx) = mpsc::channel(64);
        let (event_tx, mut event_rx) = mpsc::channel(64);

        let grid = (!grid_levels.is_empty()).then(|| TriggerGrid::new(grid_levels).unwrap());
        let handle = tokio::spawn(run_processor(ProcessorParams {
            symbol: "BTCUSDT".to_string(),
            two_legged,
            announce,
            grid,
            rx: proc_rx,
            event_tx,
            worker: None,
        }));

        for (leg, price) in samples {
            proc_tx
                .send(ProcMsg::Sample {
                    leg,
                    message: FeedMessage::Price(price),
                })
                .await
                .unwrap();
        }
        drop(proc_tx);
        handle.await.unwrap();

        let mut events = Vec::new();
        while let Some(event) = event_rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_price_jump_walks_every_level() {
        let events = drive_processor(
            vec![dec!(90), dec!(95), dec!(100), dec!(105), dec!(110)],
            false,
            false,
            vec![(0, dec!(100)), (0, dec!(112))],
        )
        .await;

        let triggers: Vec<&TriggerEvent> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Trigger(t) => Some(t),
                _ => None,
            })
            .collect();

        assert_eq!(triggers.len(), 2);
        assert_eq!(triggers[0].index, 3);
        assert_eq!(triggers[0].level, dec!(105));
        assert_eq!(triggers[1].index, 4);
        assert_eq!(triggers[1].level, dec!(110));
        assert!(triggers.iter().all(|t| t.side == GridSide::Upper));
    }

    #[tokio::test]
    async fn test_first_observation_initializes_without_triggering() {
        let events = drive_processor(
            vec![dec!(90), dec!(95), dec!(100)],
            false,
            false,
            vec![(0, dec!(97))],
        )
        .await;

        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_unchanged_price_is_a_noop() {
        let events = drive_processor(
            vec![dec!(90), dec!(100)],
            true,
            false,
            vec![(0, dec!(95)), (0, dec!(95)), (0, dec!(95))],
        )
        .await;

        let prices = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Price { .. }))
            .count();
        assert_eq!(prices, 1);
    }

    #[tokio::test]
    async fn test_ratio_stream_triggers_on_ratio_crossings() {
        // Ratio starts at 30000/1500 = 20, then the first leg rallies so the
        // ratio crosses the 21 level.
        let events = drive_processor(
            vec![dec!(19), dec!(20), dec!(21), dec!(22)],
            false,
            true,
            vec![
                (0, dec!(30000)),
                (1, dec!(1500)),
                (0, dec!(32250)), // ratio 21.5
            ],
        )
        .await;

        let triggers: Vec<&TriggerEvent> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Trigger(t) => Some(t),
                _ => None,
            })
            .collect();

        // First leg alone (price 30000) initializes bounds beyond the grid
        // top; both legs arriving brings the ratio to 20, walking back down;
        // the rally then crosses 21 upward. The walk is strictly ordered.
        assert!(!triggers.is_empty());
        let last = triggers.last().unwrap();
        assert_eq!(last.side, GridSide::Upper);
        assert_eq!(last.level, dec!(21));
    }

    #[tokio::test]
    async fn test_announce_flag_gates_price_events() {
        let silent = drive_processor(vec![], false, false, vec![(0, dec!(50))]).await;
        assert!(silent.is_empty());

        let announced = drive_processor(vec![], true, false, vec![(0, dec!(50))]).await;
        assert_eq!(announced.len(), 1);
        assert!(matches!(announced[0], StreamEvent::Price { price } if price == dec!(50)));
    }
}
