//! Delta-hedge decision loop.
//!
//! Watches live depth on two legs, computes the achievable execution price at
//! the target size on each, and fires both legs together only after a
//! sustained run of favorable observations. A single unfavorable tick erases
//! all accumulated confirmations; there is no partial credit and no decay.

use crate::config::HedgeConfig;
use crate::exchange::{DepthSnapshot, NewOrder, OrderSide, OrderType};
use crate::execution::{ExecutionError, ExecutionGateway, OrderAction, SubmitOutcome};
use crate::hedge::depth::achievable_price;
use crate::stream::{InstrumentStream, StreamEvent};
use crate::utils::decimal::{percentage_diff, round_down_to_lot};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const SECONDARY_LOT: Decimal = dec!(0.001);

/// Which hedge leg a depth update belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HedgeLeg {
    /// The leg being bought (walks asks)
    Buy,
    /// The leg being sold (walks bids)
    Sell,
}

/// Loop lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HedgeState {
    Idle,
    AwaitingDepth,
    Validating,
    Committed,
}

/// Result of evaluating one depth update.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// One of the books has not reported yet
    AwaitingDepth,
    /// Unfavorable observation; the validation counter was reset
    Unfavorable { reason: UnfavorableReason },
    /// Favorable observation; more confirmations still required
    Favorable { count: u32 },
    /// The validation threshold was reached
    Fire { buy_price: Decimal, sell_price: Decimal },
    /// The loop already committed; no further evaluation happens
    Committed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnfavorableReason {
    InsufficientBuyDepth,
    InsufficientSellDepth,
    SpreadBelowThreshold,
}

/// Deterministic decision core, fed one depth update at a time.
pub struct HedgeEvaluator {
    config: HedgeConfig,
    target_quantity: Decimal,
    state: HedgeState,
    counter: u32,
    buy_book: Option<DepthSnapshot>,
    sell_book: Option<DepthSnapshot>,
}

impl HedgeEvaluator {
    pub fn new(config: HedgeConfig, target_quantity: Decimal) -> Self {
        Self {
            config,
            target_quantity,
            state: HedgeState::Idle,
            counter: 0,
            buy_book: None,
            sell_book: None,
        }
    }

    pub fn state(&self) -> HedgeState {
        self.state
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Secondary-leg quantity: scaled by the hedge factor and normalized for
    /// contract-multiplier differences between the instruments.
    pub fn secondary_quantity(&self) -> Decimal {
        round_down_to_lot(
            self.target_quantity * self.config.hedge_factor / self.config.price_normalization,
            SECONDARY_LOT,
        )
    }

    /// Evaluate a depth update for one leg.
    pub fn on_depth(&mut self, leg: HedgeLeg, snapshot: DepthSnapshot) -> Decision {
        if self.state == HedgeState::Committed {
            return Decision::Committed;
        }

        match leg {
            HedgeLeg::Buy => self.buy_book = Some(snapshot),
            HedgeLeg::Sell => self.sell_book = Some(snapshot),
        }

        let (Some(buy_book), Some(sell_book)) = (&self.buy_book, &self.sell_book) else {
            self.state = HedgeState::AwaitingDepth;
            return Decision::AwaitingDepth;
        };
        self.state = HedgeState::Validating;

        let Some(buy_price) = achievable_price(&buy_book.asks, self.target_quantity) else {
            self.counter = 0;
            return Decision::Unfavorable {
                reason: UnfavorableReason::InsufficientBuyDepth,
            };
        };

        let sell_size = self.target_quantity * self.config.hedge_factor;
        let Some(sell_price) = achievable_price(&sell_book.bids, sell_size) else {
            self.counter = 0;
            return Decision::Unfavorable {
                reason: UnfavorableReason::InsufficientSellDepth,
            };
        };

        // The counter leg must clear the first leg's achievable price by the
        // configured margin.
        let required = buy_price * (Decimal::ONE + self.config.profit_percent / dec!(100));
        if sell_price < required {
            self.counter = 0;
            return Decision::Unfavorable {
                reason: UnfavorableReason::SpreadBelowThreshold,
            };
        }

        self.counter += 1;
        if self.counter >= self.config.validation_threshold {
            self.state = HedgeState::Committed;
            Decision::Fire {
                buy_price,
                sell_price,
            }
        } else {
            Decision::Favorable {
                count: self.counter,
            }
        }
    }
}

/// One leg's wiring: its stream (for depth and closing), the gateway that
/// will carry its order, and the symbol to trade.
pub struct HedgeLegHandle {
    pub stream: Arc<InstrumentStream>,
    pub events: mpsc::Receiver<StreamEvent>,
    pub gateway: Arc<ExecutionGateway>,
    pub symbol: String,
}

/// Both legs' terminal submission results.
#[derive(Debug)]
pub struct HedgeOutcome {
    pub buy_price: Decimal,
    pub sell_price: Decimal,
    pub buy_result: Result<SubmitOutcome, ExecutionError>,
    pub sell_result: Result<SubmitOutcome, ExecutionError>,
}

/// Orchestrates one hedge invocation over two live depth streams.
///
/// `Committed` is terminal: firing closes both subscriptions and submits both
/// legs; a fresh loop is required to re-enter.
pub struct HedgeLoop {
    evaluator: HedgeEvaluator,
    buy: HedgeLegHandle,
    sell: HedgeLegHandle,
    client_tag: String,
    status_interval: Duration,
}

impl HedgeLoop {
    pub fn new(
        config: HedgeConfig,
        target_quantity: Decimal,
        client_tag: impl Into<String>,
        buy: HedgeLegHandle,
        sell: HedgeLegHandle,
    ) -> Self {
        let status_interval = Duration::from_secs(config.status_interval_secs);
        Self {
            evaluator: HedgeEvaluator::new(config, target_quantity),
            buy,
            sell,
            client_tag: client_tag.into(),
            status_interval,
        }
    }

    /// Run until the hedge fires or both depth streams end.
    ///
    /// Returns `None` when the streams closed before the threshold was
    /// reached.
    pub async fn run(self) -> Option<HedgeOutcome> {
        let HedgeLoop {
            mut evaluator,
            buy,
            sell,
            client_tag,
            status_interval,
        } = self;
        let mut buy_events = buy.events;
        let mut sell_events = sell.events;

        let mut status = tokio::time::interval(status_interval);
        status.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let (buy_price, sell_price) = loop {
            let (leg, event) = tokio::select! {
                _ = status.tick() => {
                    debug!(
                        state = ?evaluator.state(),
                        counter = evaluator.counter(),
                        threshold = evaluator.config.validation_threshold,
                        "Hedge validation status"
                    );
                    continue;
                }
                event = buy_events.recv() => (HedgeLeg::Buy, event),
                event = sell_events.recv() => (HedgeLeg::Sell, event),
            };

            match depth_of(event) {
                DepthEvent::Snapshot(snapshot) => {
                    if let Decision::Fire { buy_price, sell_price } = step(&mut evaluator, leg, snapshot) {
                        break (buy_price, sell_price);
                    }
                }
                DepthEvent::Other => {}
                DepthEvent::Ended => {
                    warn!(?leg, "Depth stream ended before hedge fired");
                    return None;
                }
            }
        };

        // Threshold reached: the status timer stops here, both book
        // subscriptions close, and both legs go out together.
        drop(status);
        drop(buy_events);
        drop(sell_events);
        buy.stream.close();
        sell.stream.close();

        info!(
            %buy_price,
            %sell_price,
            spread_pct = %percentage_diff(sell_price, buy_price),
            "Hedge validated, submitting both legs"
        );

        let buy_order = OrderAction::Create(NewOrder {
            symbol: buy.symbol.clone(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity: Some(evaluator.target_quantity),
            price: None,
            time_in_force: None,
            reduce_only: None,
            new_client_order_id: Some(format!("{}/buy", client_tag)),
        });
        let sell_order = OrderAction::Create(NewOrder {
            symbol: sell.symbol.clone(),
            side: OrderSide::Sell,
            order_type: OrderType::Market,
            quantity: Some(evaluator.secondary_quantity()),
            price: None,
            time_in_force: None,
            reduce_only: None,
            new_client_order_id: Some(format!("{}/sell", client_tag)),
        });

        let (buy_result, sell_result) = tokio::join!(
            buy.gateway.submit(buy_order),
            sell.gateway.submit(sell_order),
        );

        Some(HedgeOutcome {
            buy_price,
            sell_price,
            buy_result,
            sell_result,
        })
    }
}

fn depth_of(event: Option<StreamEvent>) -> DepthEvent {
    match event {
        Some(StreamEvent::Depth { snapshot, .. }) => DepthEvent::Snapshot(snapshot),
        Some(_) => DepthEvent::Other,
        None => DepthEvent::Ended,
    }
}

fn step(evaluator: &mut HedgeEvaluator, leg: HedgeLeg, snapshot: DepthSnapshot) -> Decision {
    let decision = evaluator.on_depth(leg, snapshot);
    match &decision {
        Decision::Unfavorable { reason } => {
            debug!(?leg, ?reason, "Unfavorable tick, validation counter reset");
        }
        Decision::Favorable { count } => {
            debug!(
                ?leg,
                count,
                threshold = evaluator.config.validation_threshold,
                "Favorable tick"
            );
        }
        _ => {}
    }
    decision
}

enum DepthEvent {
    Snapshot(DepthSnapshot),
    Other,
    Ended,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PriceLevel;
    use rust_decimal_macros::dec;

    fn config(threshold: u32) -> HedgeConfig {
        HedgeConfig {
            validation_threshold: threshold,
            profit_percent: dec!(1),
            hedge_factor: dec!(1),
            price_normalization: dec!(1),
            status_interval_secs: 60,
        }
    }

    fn book(symbol: &str, bids: Vec<(Decimal, Decimal)>, asks: Vec<(Decimal, Decimal)>) -> DepthSnapshot {
        DepthSnapshot {
            symbol: symbol.to_string(),
            bids: bids
                .into_iter()
                .map(|(price, qty)| PriceLevel { price, qty })
                .collect(),
            asks: asks
                .into_iter()
                .map(|(price, qty)| PriceLevel { price, qty })
                .collect(),
        }
    }

    fn favorable_buy() -> DepthSnapshot {
        book("SPOT", vec![], vec![(dec!(100), dec!(2))])
    }

    fn favorable_sell() -> DepthSnapshot {
        // 102 clears 100 * 1.01.
        book("PERP", vec![(dec!(102), dec!(2))], vec![])
    }

    fn unfavorable_sell() -> DepthSnapshot {
        // 100.5 does not clear 101.
        book("PERP", vec![(dec!(100.5), dec!(2))], vec![])
    }

    #[test]
    fn test_awaiting_depth_until_both_books_report() {
        let mut eval = HedgeEvaluator::new(config(3), dec!(1));
        assert_eq!(eval.state(), HedgeState::Idle);

        let decision = eval.on_depth(HedgeLeg::Buy, favorable_buy());
        assert_eq!(decision, Decision::AwaitingDepth);
        assert_eq!(eval.state(), HedgeState::AwaitingDepth);

        let decision = eval.on_depth(HedgeLeg::Sell, favorable_sell());
        assert_eq!(decision, Decision::Favorable { count: 1 });
        assert_eq!(eval.state(), HedgeState::Validating);
    }

    #[test]
    fn test_one_unfavorable_tick_erases_all_confirmations() {
        // threshold 5: 4 favorable, 1 unfavorable, then 5 favorable. The
        // hedge fires exactly on the 9th favorable observation overall, the
        // last tick of the sequence.
        let mut eval = HedgeEvaluator::new(config(5), dec!(1));
        eval.on_depth(HedgeLeg::Buy, favorable_buy());

        for i in 1..=4u32 {
            let decision = eval.on_depth(HedgeLeg::Sell, favorable_sell());
            assert_eq!(decision, Decision::Favorable { count: i });
        }

        let decision = eval.on_depth(HedgeLeg::Sell, unfavorable_sell());
        assert_eq!(
            decision,
            Decision::Unfavorable {
                reason: UnfavorableReason::SpreadBelowThreshold
            }
        );
        assert_eq!(eval.counter(), 0);

        for i in 1..=4u32 {
            let decision = eval.on_depth(HedgeLeg::Sell, favorable_sell());
            assert_eq!(decision, Decision::Favorable { count: i });
        }
        let decision = eval.on_depth(HedgeLeg::Sell, favorable_sell());
        assert!(matches!(decision, Decision::Fire { .. }));
        assert_eq!(eval.state(), HedgeState::Committed);
    }

    #[test]
    fn test_fire_reports_achievable_prices_at_size() {
        let mut eval = HedgeEvaluator::new(config(1), dec!(1));
        eval.on_depth(
            HedgeLeg::Buy,
            book(
                "SPOT",
                vec![],
                vec![(dec!(100), dec!(0.4)), (dec!(100.2), dec!(1))],
            ),
        );
        let decision = eval.on_depth(
            HedgeLeg::Sell,
            book(
                "PERP",
                vec![(dec!(103), dec!(0.6)), (dec!(102.5), dec!(1))],
                vec![],
            ),
        );

        // Walked past the top of both books.
        assert_eq!(
            decision,
            Decision::Fire {
                buy_price: dec!(100.2),
                sell_price: dec!(102.5),
            }
        );
    }

    #[test]
    fn test_insufficient_depth_is_unfavorable() {
        let mut eval = HedgeEvaluator::new(config(2), dec!(5));
        eval.on_depth(HedgeLeg::Buy, book("SPOT", vec![], vec![(dec!(100), dec!(1))]));
        let decision = eval.on_depth(HedgeLeg::Sell, book("PERP", vec![(dec!(102), dec!(10))], vec![]));

        assert_eq!(
            decision,
            Decision::Unfavorable {
                reason: UnfavorableReason::InsufficientBuyDepth
            }
        );
    }

    #[test]
    fn test_committed_state_is_terminal() {
        let mut eval = HedgeEvaluator::new(config(1), dec!(1));
        eval.on_depth(HedgeLeg::Buy, favorable_buy());
        let decision = eval.on_depth(HedgeLeg::Sell, favorable_sell());
        assert!(matches!(decision, Decision::Fire { .. }));

        let decision = eval.on_depth(HedgeLeg::Sell, favorable_sell());
        assert_eq!(decision, Decision::Committed);
    }

    #[test]
    fn test_secondary_quantity_normalization() {
        let mut cfg = config(1);
        cfg.hedge_factor = dec!(2);
        cfg.price_normalization = dec!(3);
        let eval = HedgeEvaluator::new(cfg, dec!(1));

        // 1 * 2 / 3 = 0.666..., floored to the secondary lot.
        assert_eq!(eval.secondary_quantity(), dec!(0.666));
    }
}
