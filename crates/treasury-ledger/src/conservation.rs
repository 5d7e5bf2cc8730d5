//! Money conservation checks.
//!
//! Invariant enforced before every balance commit:
//! ```text
//! available + reserved + total_payouts + total_fees == total_deposited
//! available >= 0, reserved >= 0
//! ```
//!
//! Money only moves between buckets or leaves through settlement. If the
//! invariant ever fails the mutation is refused and logged at error level.

use rust_decimal::Decimal;
use treasury_types::{BalanceMutation, MerchantBalance, Result, TreasuryError};

/// Verify the static invariant on a single balance row.
///
/// # Errors
/// Returns [`TreasuryError::LedgerInvariantViolation`] if any bucket is
/// negative or the buckets do not sum to the lifetime deposits.
pub fn verify(balance: &MerchantBalance) -> Result<()> {
    if balance.available < Decimal::ZERO || balance.reserved < Decimal::ZERO {
        return Err(violation(
            balance,
            format!(
                "negative bucket: available={}, reserved={}",
                balance.available, balance.reserved
            ),
        ));
    }
    let accounted = balance.held() + balance.disbursed();
    if accounted != balance.total_deposited {
        return Err(violation(
            balance,
            format!(
                "accounted {accounted} != deposited {} (available={}, reserved={}, payouts={}, fees={})",
                balance.total_deposited,
                balance.available,
                balance.reserved,
                balance.total_payouts,
                balance.total_fees,
            ),
        ));
    }
    Ok(())
}

/// Verify that `after` is what `mutation` may produce from `before`.
///
/// Reservations and releases move money between buckets without changing
/// `available + reserved`; credits grow it by the deposit; settlements
/// shrink it by exactly what they add to the lifetime counters.
///
/// # Errors
/// Returns [`TreasuryError::LedgerInvariantViolation`] on any mismatch.
pub fn verify_transition(
    before: &MerchantBalance,
    after: &MerchantBalance,
    mutation: &BalanceMutation,
) -> Result<()> {
    verify(after)?;
    let held_delta = after.held() - before.held();
    let expected = match mutation {
        BalanceMutation::Credit { amount, .. } => *amount,
        BalanceMutation::Reserve { .. } | BalanceMutation::Release { .. } => Decimal::ZERO,
        BalanceMutation::Settle { amount, fee, .. } => -(*amount + *fee),
    };
    if held_delta != expected {
        return Err(violation(
            after,
            format!(
                "{} changed held funds by {held_delta}, expected {expected}",
                mutation.name()
            ),
        ));
    }
    if after.total_deposited < before.total_deposited
        || after.total_payouts < before.total_payouts
        || after.total_fees < before.total_fees
    {
        return Err(violation(after, "lifetime counter decreased".into()));
    }
    Ok(())
}

fn violation(balance: &MerchantBalance, reason: String) -> TreasuryError {
    tracing::error!(
        merchant_id = %balance.merchant_id,
        %reason,
        "CRITICAL: ledger conservation check failed"
    );
    TreasuryError::LedgerInvariantViolation {
        reason: format!("merchant {}: {reason}", balance.merchant_id),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use treasury_types::{IdempotencyKey, MerchantId};

    use super::*;

    fn funded(available: i64) -> MerchantBalance {
        let mut bal = MerchantBalance::new(MerchantId::new(), Utc::now());
        bal.available = Decimal::new(available, 2);
        bal.total_deposited = Decimal::new(available, 2);
        bal
    }

    #[test]
    fn zero_balance_is_conserved() {
        let bal = MerchantBalance::new(MerchantId::new(), Utc::now());
        assert!(verify(&bal).is_ok());
    }

    #[test]
    fn missing_money_is_detected() {
        let mut bal = funded(10_000);
        bal.available -= Decimal::ONE;
        let err = verify(&bal).unwrap_err();
        assert!(matches!(err, TreasuryError::LedgerInvariantViolation { .. }));
    }

    #[test]
    fn negative_available_is_detected() {
        let mut bal = funded(0);
        bal.available = Decimal::NEGATIVE_ONE;
        bal.reserved = Decimal::ONE;
        assert!(verify(&bal).is_err());
    }

    #[test]
    fn reserve_must_not_change_held() {
        let before = funded(10_000);
        let mut after = before.clone();
        after.available -= Decimal::new(4100, 2);
        after.reserved += Decimal::new(4100, 2);
        let reserve = BalanceMutation::Reserve {
            amount: Decimal::new(4000, 2),
            fee: Decimal::ONE,
            key: IdempotencyKey::new("k"),
            payout_id: None,
        };
        assert!(verify_transition(&before, &after, &reserve).is_ok());

        // A reserve that also credits is not a reserve.
        after.available += Decimal::ONE;
        after.total_deposited += Decimal::ONE;
        assert!(verify_transition(&before, &after, &reserve).is_err());
    }
}
