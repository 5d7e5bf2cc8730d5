//! One merchant's ledger row and the pure mutation step applied to it.
//!
//! [`plan_mutation`] computes the next balance and its journal row from the
//! current balance without touching anything. Stores call it inside their
//! row lock and commit both results together, or neither.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use treasury_types::{
    BalanceMutation, GENESIS_HASH, MerchantBalance, MerchantId, Result, TransactionDraft,
    TransactionKind, TreasuryError, TreasuryTransaction,
};

use crate::{conservation, idempotency::IdempotencyGuard};

/// Result of applying one mutation to a merchant row.
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    /// Balance after the mutation (unchanged on replay).
    pub balance: MerchantBalance,
    /// Journal row written, `None` on replay.
    pub transaction: Option<TreasuryTransaction>,
    /// The idempotency key had already been applied.
    pub replayed: bool,
}

impl MutationOutcome {
    #[must_use]
    pub fn replay(balance: MerchantBalance) -> Self {
        Self {
            balance,
            transaction: None,
            replayed: true,
        }
    }
}

/// Compute the balance and journal row `mutation` produces from `current`.
///
/// # Errors
/// - `InvalidAmount` for non-positive amounts or a negative fee
/// - `InsufficientBalance` if a reservation does not fit in `available`
/// - `InsufficientReserved` if a release or settlement exceeds `reserved`
/// - `LedgerInvariantViolation` if the result would not conserve money
pub fn plan_mutation(
    current: &MerchantBalance,
    mutation: &BalanceMutation,
    prev_hash: &str,
    now: DateTime<Utc>,
) -> Result<(MerchantBalance, TreasuryTransaction)> {
    let mut next = current.clone();
    let draft = match mutation {
        BalanceMutation::Credit {
            amount,
            note,
            tx_reference,
        } => {
            require_positive(*amount, "credit")?;
            next.available += *amount;
            next.total_deposited += *amount;
            TransactionDraft {
                merchant_id: current.merchant_id,
                kind: TransactionKind::Deposit,
                amount: *amount,
                payout_id: None,
                idempotency_key: mutation.idempotency_key(),
                tx_reference: tx_reference.clone(),
                description: note.clone(),
                balance_after: next.available,
            }
        }
        BalanceMutation::Reserve {
            amount,
            fee,
            key,
            payout_id,
        } => {
            let hold = hold_of(*amount, *fee)?;
            if next.available < hold {
                return Err(TreasuryError::InsufficientBalance {
                    needed: hold,
                    available: next.available,
                });
            }
            next.available -= hold;
            next.reserved += hold;
            TransactionDraft {
                merchant_id: current.merchant_id,
                kind: TransactionKind::PayoutReserved,
                amount: hold,
                payout_id: *payout_id,
                idempotency_key: Some(key.clone()),
                tx_reference: None,
                description: format!("Reserved {amount} + {fee} fee"),
                balance_after: next.available,
            }
        }
        BalanceMutation::Release {
            amount,
            fee,
            payout_id,
            key,
        } => {
            let hold = hold_of(*amount, *fee)?;
            require_reserved(&next, hold)?;
            next.reserved -= hold;
            next.available += hold;
            TransactionDraft {
                merchant_id: current.merchant_id,
                kind: TransactionKind::PayoutReleased,
                amount: hold,
                payout_id: *payout_id,
                idempotency_key: Some(key.clone()),
                tx_reference: None,
                description: format!("Released {amount} + {fee} fee"),
                balance_after: next.available,
            }
        }
        BalanceMutation::Settle {
            amount,
            fee,
            payout_id,
            tx_reference,
        } => {
            let hold = hold_of(*amount, *fee)?;
            require_reserved(&next, hold)?;
            next.reserved -= hold;
            next.total_payouts += *amount;
            next.total_fees += *fee;
            TransactionDraft {
                merchant_id: current.merchant_id,
                kind: TransactionKind::PayoutDebited,
                amount: hold,
                payout_id: Some(*payout_id),
                idempotency_key: mutation.idempotency_key(),
                tx_reference: tx_reference.clone(),
                description: format!("Payout {payout_id} settled: {amount} + {fee} fee"),
                balance_after: next.available,
            }
        }
    };
    next.updated_at = now;

    conservation::verify_transition(current, &next, mutation)?;
    let transaction = TreasuryTransaction::seal(draft, prev_hash, now);
    Ok((next, transaction))
}

fn require_positive(amount: Decimal, what: &str) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(TreasuryError::InvalidAmount {
            reason: format!("{what} amount must be positive, got {amount}"),
        });
    }
    Ok(())
}

fn hold_of(amount: Decimal, fee: Decimal) -> Result<Decimal> {
    require_positive(amount, "payout")?;
    if fee < Decimal::ZERO {
        return Err(TreasuryError::InvalidAmount {
            reason: format!("fee must not be negative, got {fee}"),
        });
    }
    Ok(amount + fee)
}

fn require_reserved(balance: &MerchantBalance, hold: Decimal) -> Result<()> {
    if balance.reserved < hold {
        return Err(TreasuryError::InsufficientReserved {
            needed: hold,
            reserved: balance.reserved,
        });
    }
    Ok(())
}

/// In-memory merchant row: balance, replay guard and journal together.
#[derive(Debug, Clone)]
pub struct LedgerAccount {
    pub balance: MerchantBalance,
    guard: IdempotencyGuard,
    journal: Vec<TreasuryTransaction>,
}

impl LedgerAccount {
    #[must_use]
    pub fn new(merchant_id: MerchantId, now: DateTime<Utc>) -> Self {
        Self {
            balance: MerchantBalance::new(merchant_id, now),
            guard: IdempotencyGuard::default(),
            journal: Vec::new(),
        }
    }

    /// Apply `mutation` all-or-nothing. A known idempotency key is a replay.
    pub fn apply(&mut self, mutation: &BalanceMutation, now: DateTime<Utc>) -> Result<MutationOutcome> {
        let key = mutation.idempotency_key();
        if key.as_ref().is_some_and(|k| self.guard.is_applied(k)) {
            return Ok(MutationOutcome::replay(self.balance.clone()));
        }

        let (next, transaction) = plan_mutation(&self.balance, mutation, self.head_hash(), now)?;

        self.balance = next;
        self.journal.push(transaction.clone());
        if let Some(key) = key {
            if mutation.has_permanent_key() {
                self.guard.mark_permanent(key);
            } else {
                self.guard.mark_applied(key);
            }
        }
        Ok(MutationOutcome {
            balance: self.balance.clone(),
            transaction: Some(transaction),
            replayed: false,
        })
    }

    /// Hash of the newest journal row.
    #[must_use]
    pub fn head_hash(&self) -> &str {
        self.journal.last().map_or(GENESIS_HASH, |tx| tx.entry_hash.as_str())
    }

    /// Journal, oldest first.
    #[must_use]
    pub fn journal(&self) -> &[TreasuryTransaction] {
        &self.journal
    }
}

#[cfg(test)]
mod tests {
    use treasury_types::{IdempotencyKey, PayoutId, verify_chain};

    use super::*;

    fn d(units: i64) -> Decimal {
        Decimal::new(units, 2)
    }

    fn credit(amount: i64) -> BalanceMutation {
        BalanceMutation::Credit {
            amount: d(amount),
            note: "Deposit".into(),
            tx_reference: None,
        }
    }

    fn reserve(amount: i64, fee: i64, key: &str) -> BalanceMutation {
        BalanceMutation::Reserve {
            amount: d(amount),
            fee: d(fee),
            key: IdempotencyKey::new(key),
            payout_id: None,
        }
    }

    fn funded() -> LedgerAccount {
        let mut acct = LedgerAccount::new(MerchantId::new(), Utc::now());
        acct.apply(&credit(10_000), Utc::now()).unwrap();
        acct
    }

    #[test]
    fn credit_increases_available_and_deposited() {
        let acct = funded();
        assert_eq!(acct.balance.available, d(10_000));
        assert_eq!(acct.balance.total_deposited, d(10_000));
        assert_eq!(acct.journal()[0].kind, TransactionKind::Deposit);
    }

    #[test]
    fn non_positive_credit_rejected() {
        let mut acct = funded();
        let err = acct.apply(&credit(0), Utc::now()).unwrap_err();
        assert!(matches!(err, TreasuryError::InvalidAmount { .. }));
        assert_eq!(acct.journal().len(), 1);
    }

    #[test]
    fn reserve_moves_between_buckets() {
        let mut acct = funded();
        let before = acct.balance.held();
        let out = acct.apply(&reserve(4000, 100, "k1"), Utc::now()).unwrap();
        assert_eq!(out.balance.available, d(5900));
        assert_eq!(out.balance.reserved, d(4100));
        assert_eq!(out.balance.held(), before);
        let tx = out.transaction.unwrap();
        assert_eq!(tx.kind, TransactionKind::PayoutReserved);
        assert_eq!(tx.balance_after, d(5900));
    }

    #[test]
    fn reserve_fails_closed() {
        let mut acct = funded();
        let err = acct.apply(&reserve(10_000, 100, "k1"), Utc::now()).unwrap_err();
        assert!(matches!(err, TreasuryError::InsufficientBalance { .. }));
        assert_eq!(acct.balance.available, d(10_000));
        assert_eq!(acct.balance.reserved, Decimal::ZERO);
        assert_eq!(acct.journal().len(), 1);
    }

    #[test]
    fn replayed_key_is_noop() {
        let mut acct = funded();
        acct.apply(&reserve(1000, 10, "key-A"), Utc::now()).unwrap();
        let out = acct.apply(&reserve(1000, 10, "key-A"), Utc::now()).unwrap();
        assert!(out.replayed);
        assert!(out.transaction.is_none());
        assert_eq!(acct.balance.reserved, d(1010));
        assert_eq!(acct.journal().len(), 2);
    }

    #[test]
    fn failed_reserve_does_not_burn_key() {
        let mut acct = funded();
        assert!(acct.apply(&reserve(20_000, 0, "k"), Utc::now()).is_err());
        acct.apply(&credit(20_000), Utc::now()).unwrap();
        let out = acct.apply(&reserve(20_000, 0, "k"), Utc::now()).unwrap();
        assert!(!out.replayed);
    }

    #[test]
    fn settle_moves_reserved_to_lifetime_counters() {
        let mut acct = funded();
        let payout_id = PayoutId::new();
        acct.apply(&reserve(4000, 100, "k1"), Utc::now()).unwrap();
        let settle = BalanceMutation::Settle {
            amount: d(4000),
            fee: d(100),
            payout_id,
            tx_reference: Some("sig".into()),
        };
        let out = acct.apply(&settle, Utc::now()).unwrap();
        assert_eq!(out.balance.reserved, Decimal::ZERO);
        assert_eq!(out.balance.total_payouts, d(4000));
        assert_eq!(out.balance.total_fees, d(100));
        assert_eq!(out.balance.available, d(5900));

        // At most one settle per payout.
        let again = acct.apply(&settle, Utc::now()).unwrap();
        assert!(again.replayed);
        assert_eq!(acct.balance.total_payouts, d(4000));
    }

    #[test]
    fn release_more_than_reserved_fails() {
        let mut acct = funded();
        let release = BalanceMutation::Release {
            amount: d(100),
            fee: Decimal::ZERO,
            payout_id: None,
            key: IdempotencyKey::new("r"),
        };
        let err = acct.apply(&release, Utc::now()).unwrap_err();
        assert!(matches!(err, TreasuryError::InsufficientReserved { .. }));
    }

    #[test]
    fn journal_is_hash_chained() {
        let mut acct = funded();
        acct.apply(&reserve(1000, 100, "a"), Utc::now()).unwrap();
        acct.apply(&reserve(2000, 100, "b"), Utc::now()).unwrap();
        assert_eq!(verify_chain(acct.journal()), None);
        assert_eq!(acct.head_hash(), acct.journal()[2].entry_hash);
    }
}
