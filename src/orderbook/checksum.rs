//! Book checksum in the exchange's format.
//!
//! The exchange appends a CRC32 of the top of the book to every book
//! message. Recomputing it locally is the only way to notice that the
//! local book has drifted from the exchange's.
//!
//! The input string is built from the best `checksum_depth` asks
//! (ascending), followed by the best `checksum_depth` bids (descending).
//! For every level the price and then the quantity are rendered with
//! exactly the symbol's number of decimals, the decimal point is removed
//! and leading zeros are stripped.

use rust_decimal::Decimal;

use super::Orderbook;

/// Compute the checksum of the top `checksum_depth` levels of `book`
#[must_use]
pub fn compute(book: &Orderbook, checksum_depth: usize) -> u32 {
    crc32fast::hash(checksum_input(book, checksum_depth).as_bytes())
}

/// The string the checksum is computed over
///
/// Exposed for diagnosing mismatches.
#[must_use]
pub fn checksum_input(book: &Orderbook, checksum_depth: usize) -> String {
    let precision = book.precision();
    let mut input = String::with_capacity(checksum_depth * 2 * 24);

    for (price, qty) in book.asks().take(checksum_depth) {
        push_component(&mut input, precision.price(price));
        push_component(&mut input, precision.qty(qty));
    }
    for (price, qty) in book.bids().take(checksum_depth) {
        push_component(&mut input, precision.price(price));
        push_component(&mut input, precision.qty(qty));
    }

    input
}

/// Append `value` without decimal point and leading zeros
///
/// `value` must already carry the exchange's scale, e.g. `0.00100000`
/// renders as `100000`.
fn push_component(out: &mut String, value: Decimal) {
    let rendered = value.to_string();
    let digits = rendered.replace('.', "");
    out.push_str(digits.trim_start_matches('0'));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Precision, Side};
    use rust_decimal_macros::dec;

    // Digests of a synthetic BTC/USD depth-10 book (price 1 dp, qty 8 dp),
    // computed with the exchange's checksum rule.
    const SNAPSHOT_CHECKSUM: u32 = 2166257135;
    const BEST_ASK_REMOVED_CHECKSUM: u32 = 754631245;

    fn btc_book() -> Orderbook {
        let mut book = Orderbook::new("BTC/USD", 10, Precision::new(1, 8), 1);
        book.apply_snapshot(
            vec![
                (dec!(45283.5), dec!(0.1)),
                (dec!(45283.4), dec!(1.2)),
                (dec!(45282.1), dec!(0.79)),
                (dec!(45281.0), dec!(0.5)),
                (dec!(45280.3), dec!(0.01)),
                (dec!(45279.0), dec!(0.25)),
                (dec!(45278.6), dec!(3.0)),
                (dec!(45277.7), dec!(0.6)),
                (dec!(45276.5), dec!(1.1)),
                (dec!(45275.2), dec!(0.04)),
            ],
            vec![
                (dec!(45285.2), dec!(0.001)),
                (dec!(45286.4), dec!(1.54571953)),
                (dec!(45287.1), dec!(0.2)),
                (dec!(45287.9), dec!(0.03)),
                (dec!(45288.5), dec!(2.5)),
                (dec!(45289.0), dec!(0.75)),
                (dec!(45290.3), dec!(0.1)),
                (dec!(45291.6), dec!(1.0)),
                (dec!(45292.2), dec!(0.35)),
                (dec!(45293.8), dec!(4.0)),
            ],
        );
        book
    }

    #[test]
    fn test_checksum_input_format() {
        let book = btc_book();
        let input = checksum_input(&book, 10);
        // Asks first: 45285.2 / 0.00100000 -> "452852" + "100000"
        assert!(input.starts_with("452852100000452864154571953"));
        // Bids last: 45275.2 / 0.04000000 -> "452752" + "4000000"
        assert!(input.ends_with("4527524000000"));
    }

    #[test]
    fn test_snapshot_checksum_matches_fixture() {
        assert_eq!(compute(&btc_book(), 10), SNAPSHOT_CHECKSUM);
    }

    #[test]
    fn test_checksum_after_best_ask_removed() {
        let mut book = btc_book();
        book.apply_delta(Side::Ask, dec!(45285.2), dec!(0), None).unwrap();
        assert_eq!(book.best_ask(), Some((dec!(45286.4), dec!(1.54571953))));
        assert_eq!(compute(&book, 10), BEST_ASK_REMOVED_CHECKSUM);
    }

    #[test]
    fn test_checksum_is_deterministic() {
        let book = btc_book();
        assert_eq!(compute(&book, 10), compute(&book, 10));
    }

    #[test]
    fn test_other_precision() {
        let mut book = Orderbook::new("ETH/USD", 10, Precision::new(2, 8), 1);
        book.apply_snapshot(
            vec![
                (dec!(2550.18), dec!(1.0)),
                (dec!(2549.9), dec!(0.45)),
                (dec!(2549.02), dec!(7.25)),
            ],
            vec![
                (dec!(2550.41), dec!(3.5)),
                (dec!(2550.55), dec!(0.125)),
                (dec!(2551), dec!(10)),
            ],
        );
        assert_eq!(compute(&book, 10), 1569151826);
    }

    #[test]
    fn test_empty_book_checksum() {
        let book = Orderbook::new("BTC/USD", 10, Precision::new(1, 8), 1);
        assert_eq!(checksum_input(&book, 10), "");
        assert_eq!(compute(&book, 10), 0);
    }
}
