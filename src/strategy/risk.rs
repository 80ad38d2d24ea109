//! Pre-trade risk simulation and size reduction.

use rust_decimal::Decimal;

/// Account state the simulation starts from.
#[derive(Debug, Clone, Copy)]
pub struct RiskInputs {
    pub equity: Decimal,
    pub cash: Decimal,
    /// Current long market value across open positions.
    pub gross_exposure: Decimal,
}

#[derive(Debug, Clone, Copy)]
pub struct RiskLimits {
    pub daily_gross_cap: Decimal,
    pub max_leverage: Decimal,
    /// Negative values permit margin.
    pub min_cash_ratio: Decimal,
    pub min_shares: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct RiskOutcome {
    pub gross_ratio_after: Decimal,
    pub leverage_after: Decimal,
    pub cash_ratio_after: Decimal,
    pub passes: bool,
}

/// Compute the post-trade account and check it against the limits.
pub fn simulate(
    inputs: RiskInputs,
    limits: RiskLimits,
    shares: i64,
    price: Decimal,
    fee: Decimal,
) -> RiskOutcome {
    let notional = price * Decimal::from(shares);
    let cash_after = inputs.cash - notional - fee;
    let gross_after = inputs.gross_exposure + notional;
    let equity_after = cash_after + gross_after;

    if equity_after <= Decimal::ZERO {
        return RiskOutcome {
            gross_ratio_after: Decimal::MAX,
            leverage_after: Decimal::MAX,
            cash_ratio_after: Decimal::MIN,
            passes: false,
        };
    }

    // Gross ratio is measured against pre-trade equity, leverage against
    // the post-trade account.
    let gross_ratio_after = if inputs.equity > Decimal::ZERO {
        gross_after / inputs.equity
    } else {
        Decimal::MAX
    };
    let leverage_after = gross_after / equity_after;
    let cash_ratio_after = cash_after / equity_after;

    let passes = gross_ratio_after <= limits.daily_gross_cap
        && leverage_after <= limits.max_leverage
        && cash_ratio_after >= limits.min_cash_ratio;

    RiskOutcome {
        gross_ratio_after,
        leverage_after,
        cash_ratio_after,
        passes,
    }
}

/// Reduce the share count stepwise until the simulation passes.
///
/// Returns `None` when no size at or above `min_shares` fits.
pub fn scale_down_to_fit<F>(
    inputs: RiskInputs,
    limits: RiskLimits,
    shares: i64,
    price: Decimal,
    fee_for: F,
) -> Option<i64>
where
    F: Fn(i64) -> Decimal,
{
    let step = (shares / 10).max(1);
    let mut current = shares;
    while current >= limits.min_shares.max(1) {
        if simulate(inputs, limits, current, price, fee_for(current)).passes {
            return Some(current);
        }
        current -= step;
    }
    None
}
