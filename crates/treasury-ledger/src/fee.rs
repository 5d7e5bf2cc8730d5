//! Platform fee calculation.
//!
//! Fees are a pure function of the payout amount. The same calculator
//! instance quotes single payouts and batch pre-flights, so both paths
//! agree on what an item costs.

use rust_decimal::{Decimal, RoundingStrategy};
use treasury_types::{FeeConfig, constants::FEE_SCALE};

/// Computes the fee charged on top of a payout amount.
pub trait FeeCalculator: Send + Sync {
    fn calculate_fee(&self, amount: Decimal) -> Decimal;
}

/// `max(amount * basis_points / 10000, minimum_fee)`, rounded to cents.
#[derive(Debug, Clone)]
pub struct BasisPointsFeeCalculator {
    basis_points: u32,
    minimum_fee: Decimal,
}

impl BasisPointsFeeCalculator {
    #[must_use]
    pub fn new(basis_points: u32, minimum_fee: Decimal) -> Self {
        Self {
            basis_points,
            minimum_fee,
        }
    }
}

impl From<&FeeConfig> for BasisPointsFeeCalculator {
    fn from(config: &FeeConfig) -> Self {
        Self::new(config.basis_points, config.minimum_fee)
    }
}

impl Default for BasisPointsFeeCalculator {
    fn default() -> Self {
        Self::from(&FeeConfig::default())
    }
}

impl FeeCalculator for BasisPointsFeeCalculator {
    fn calculate_fee(&self, amount: Decimal) -> Decimal {
        let proportional = amount * Decimal::from(self.basis_points) / Decimal::from(10_000u32);
        proportional
            .max(self.minimum_fee)
            .round_dp_with_strategy(FEE_SCALE, RoundingStrategy::MidpointAwayFromZero)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(units: i64, scale: u32) -> Decimal {
        Decimal::new(units, scale)
    }

    #[test]
    fn floor_applies_to_small_amounts() {
        let fees = BasisPointsFeeCalculator::default();
        assert_eq!(fees.calculate_fee(d(4000, 2)), d(100, 2));
        assert_eq!(fees.calculate_fee(d(1, 2)), d(100, 2));
    }

    #[test]
    fn percentage_applies_above_floor() {
        let fees = BasisPointsFeeCalculator::default();
        assert_eq!(fees.calculate_fee(d(50_000, 2)), d(500, 2));
        assert_eq!(fees.calculate_fee(d(12_345, 1)), d(1235, 2));
    }

    #[test]
    fn custom_schedule() {
        let fees = BasisPointsFeeCalculator::new(250, Decimal::ZERO);
        assert_eq!(fees.calculate_fee(d(10_000, 2)), d(250, 2));
        assert_eq!(fees.calculate_fee(d(1, 2)), Decimal::ZERO);
    }
}
