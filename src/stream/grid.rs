//! Trigger grid: ordered price levels and crossing detection.
//!
//! The grid yields bounds around a price; crossings against the *current*
//! bounds (never the whole grid) produce trigger events. When one update jumps
//! several levels, every intermediate level gets its own event, in index order
//! matching the direction of the move, so no level is silently skipped.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which bound a price crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GridSide {
    Upper,
    Lower,
}

impl GridSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            GridSide::Upper => "upper",
            GridSide::Lower => "lower",
        }
    }
}

/// One grid level with its index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridPoint {
    pub index: usize,
    pub price: Decimal,
}

/// Bounds around a price.
///
/// `lower` is undefined iff the price is below the first level; `upper` is
/// undefined iff the price is at or above the last level. When both are
/// defined, `upper.index == lower.index + 1` and
/// `lower.price <= price < upper.price`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GridBounds {
    pub lower: Option<GridPoint>,
    pub upper: Option<GridPoint>,
}

/// A crossing of one grid level.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerEvent {
    /// Index of the crossed level
    pub index: usize,
    /// Price of the crossed level
    pub level: Decimal,
    /// Direction of the crossing
    pub side: GridSide,
    /// The price observation that produced the crossing
    pub observed_price: Decimal,
}

/// Ascending sequence of trigger price levels.
#[derive(Debug, Clone)]
pub struct TriggerGrid {
    levels: Vec<Decimal>,
}

impl TriggerGrid {
    /// Build a grid from strictly ascending levels.
    pub fn new(levels: Vec<Decimal>) -> Result<Self, String> {
        if let Some(pair) = levels.windows(2).find(|w| w[0] >= w[1]) {
            return Err(format!(
                "grid levels must be strictly ascending, found {} before {}",
                pair[0], pair[1]
            ));
        }
        Ok(Self { levels })
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn level(&self, index: usize) -> Decimal {
        self.levels[index]
    }

    /// Bounds around `price`, derived from the full grid.
    pub fn bounds(&self, price: Decimal) -> GridBounds {
        if self.levels.is_empty() {
            return GridBounds::default();
        }

        // First level strictly greater than the price; the level before it is
        // the lower bound. A price sitting exactly on a level keeps that level
        // as its lower bound, so landing on a level does not re-trigger.
        let split = self.levels.partition_point(|&level| level <= price);

        let lower = split.checked_sub(1).map(|index| GridPoint {
            index,
            price: self.levels[index],
        });
        let upper = (split < self.levels.len()).then(|| GridPoint {
            index: split,
            price: self.levels[split],
        });

        GridBounds { lower, upper }
    }

    /// Evaluate a price update against the current bounds.
    ///
    /// Returns the recomputed bounds and the trigger events for every level
    /// crossed, or `None` when the price stays inside the bounds.
    pub fn crossings(
        &self,
        bounds: &GridBounds,
        price: Decimal,
    ) -> Option<(GridBounds, Vec<TriggerEvent>)> {
        if let Some(upper) = bounds.upper {
            if price > upper.price {
                let next = self.bounds(price);
                let landing = next
                    .lower
                    .expect("a price above a grid level always has a lower bound");

                let events = (upper.index..=landing.index)
                    .map(|index| TriggerEvent {
                        index,
                        level: self.levels[index],
                        side: GridSide::Upper,
                        observed_price: price,
                    })
                    .collect();
                return Some((next, events));
            }
        }

        if let Some(lower) = bounds.lower {
            if price < lower.price {
                let next = self.bounds(price);
                let landing = next
                    .upper
                    .expect("a price below a grid level always has an upper bound");

                let events = (landing.index..=lower.index)
                    .rev()
                    .map(|index| TriggerEvent {
                        index,
                        level: self.levels[index],
                        side: GridSide::Lower,
                        observed_price: price,
                    })
                    .collect();
                return Some((next, events));
            }
        }

        None
    }
}
