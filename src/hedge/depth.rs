//! Order-book depth walking.

use crate::exchange::PriceLevel;
use rust_decimal::Decimal;

/// Achievable execution price for `target_qty` against one book side.
///
/// Walks the levels best-first, accumulating quantity until the target is
/// covered; the price of the level that crosses the threshold is what a
/// marketable order of that size would actually pay, not the top-of-book
/// price. Returns `None` when the visible depth cannot absorb the size.
pub fn achievable_price(levels: &[PriceLevel], target_qty: Decimal) -> Option<Decimal> {
    if target_qty <= Decimal::ZERO {
        return None;
    }

    let mut accumulated = Decimal::ZERO;
    for level in levels {
        accumulated += level.qty;
        if accumulated >= target_qty {
            return Some(level.price);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn level(price: Decimal, qty: Decimal) -> PriceLevel {
        PriceLevel { price, qty }
    }

    #[test]
    fn test_price_is_the_crossing_level_not_top_of_book() {
        let asks = vec![
            level(dec!(100), dec!(0.5)),
            level(dec!(101), dec!(0.3)),
            level(dec!(102), dec!(5)),
        ];

        assert_eq!(achievable_price(&asks, dec!(1)), Some(dec!(102)));
        assert_eq!(achievable_price(&asks, dec!(0.5)), Some(dec!(100)));
        assert_eq!(achievable_price(&asks, dec!(0.8)), Some(dec!(101)));
    }

    #[test]
    fn test_insufficient_depth_returns_none() {
        let bids = vec![level(dec!(99), dec!(0.2)), level(dec!(98), dec!(0.2))];
        assert_eq!(achievable_price(&bids, dec!(1)), None);
    }

    #[test]
    fn test_empty_book_and_zero_size() {
        assert_eq!(achievable_price(&[], dec!(1)), None);
        assert_eq!(achievable_price(&[level(dec!(100), dec!(1))], dec!(0)), None);
    }
}
