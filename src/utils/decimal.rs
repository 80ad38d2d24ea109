//! Decimal arithmetic utilities for financial calculations.

use rust_decimal::Decimal;

/// Round a price to the one-cent tick US equities trade in.
///
/// Applied wherever the engine derives a price instead of reading one off
/// a bar: slippage-adjusted limits and exit thresholds.
pub fn round_to_cent(price: Decimal) -> Decimal {
    price.round_dp(2)
}

/// Mean of a slice of decimals; zero for an empty slice.
pub fn mean(values: &[Decimal]) -> Decimal {
    if values.is_empty() {
        return Decimal::ZERO;
    }
    let sum: Decimal = values.iter().copied().sum();
    sum / Decimal::from(values.len() as i64)
}
