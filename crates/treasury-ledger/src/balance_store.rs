//! The Balance Store: the only way money moves.
//!
//! Four primitives mutate a merchant's balance, each atomically and with
//! exactly one journal row:
//!
//! 1. `credit`  → deposit lands (available ↑, deposited ↑)
//! 2. `reserve` → payout created (available → reserved)
//! 3. `release` → payout expired or batch rolled back (reserved → available)
//! 4. `settle`  → payout transferred on-chain (reserved → lifetime counters)

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use treasury_types::{
    BalanceMutation, IdempotencyKey, MerchantBalance, MerchantId, PayoutId, Result,
    TreasuryTransaction,
};

use crate::{
    fee::FeeCalculator,
    store::{TransactionQuery, TreasuryStore},
};

/// Outcome of a successful `reserve`.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub balance: MerchantBalance,
    /// The key had been used before; nothing was reserved this time.
    pub replayed: bool,
}

/// Outcome of a deposit credit.
#[derive(Debug, Clone)]
pub struct Credit {
    pub balance: MerchantBalance,
    /// The on-chain reference had already been credited.
    pub replayed: bool,
}

#[derive(Clone)]
pub struct BalanceStore {
    store: Arc<dyn TreasuryStore>,
    fees: Arc<dyn FeeCalculator>,
}

impl BalanceStore {
    pub fn new(store: Arc<dyn TreasuryStore>, fees: Arc<dyn FeeCalculator>) -> Self {
        Self { store, fees }
    }

    /// Fee for a payout of `amount`. Pure; shared by single and batch paths.
    pub fn calculate_fee(&self, amount: Decimal) -> Decimal {
        self.fees.calculate_fee(amount)
    }

    /// Current balance, or a zero snapshot for an unknown merchant.
    pub async fn balance(&self, merchant_id: MerchantId) -> Result<MerchantBalance> {
        Ok(self
            .store
            .balance(merchant_id)
            .await?
            .unwrap_or_else(|| MerchantBalance::new(merchant_id, Utc::now())))
    }

    pub async fn transactions(
        &self,
        merchant_id: MerchantId,
        query: &TransactionQuery,
    ) -> Result<Vec<TreasuryTransaction>> {
        self.store.transactions(merchant_id, query).await
    }

    /// Increase `available` and `total_deposited` by `amount`.
    ///
    /// # Errors
    /// `InvalidAmount` if `amount` is not positive.
    pub async fn credit(
        &self,
        merchant_id: MerchantId,
        amount: Decimal,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<MerchantBalance> {
        let outcome = self
            .store
            .apply_mutation(
                merchant_id,
                BalanceMutation::Credit {
                    amount,
                    note: note.to_string(),
                    tx_reference: None,
                },
                now,
            )
            .await?;
        info!(%merchant_id, %amount, available = %outcome.balance.available, "Credited");
        Ok(outcome.balance)
    }

    /// Credit a deposit identified by its on-chain reference. A reference
    /// that was already credited is a replay and changes nothing.
    pub async fn credit_deposit(
        &self,
        merchant_id: MerchantId,
        amount: Decimal,
        tx_reference: &str,
        now: DateTime<Utc>,
    ) -> Result<Credit> {
        let outcome = self
            .store
            .apply_mutation(
                merchant_id,
                BalanceMutation::Credit {
                    amount,
                    note: format!("Deposit {tx_reference}"),
                    tx_reference: Some(tx_reference.to_string()),
                },
                now,
            )
            .await?;
        if outcome.replayed {
            warn!(%merchant_id, tx_reference, "Deposit already credited, ignoring replay");
        } else {
            info!(%merchant_id, %amount, tx_reference, available = %outcome.balance.available, "Deposit credited");
        }
        Ok(Credit {
            balance: outcome.balance,
            replayed: outcome.replayed,
        })
    }

    /// Move `amount + fee` from `available` to `reserved`, once per `key`.
    ///
    /// # Errors
    /// `InsufficientBalance` if `available < amount + fee`; nothing changes.
    pub async fn reserve(
        &self,
        merchant_id: MerchantId,
        amount: Decimal,
        fee: Decimal,
        key: IdempotencyKey,
        payout_id: Option<PayoutId>,
        now: DateTime<Utc>,
    ) -> Result<Reservation> {
        let mutation = BalanceMutation::Reserve {
            amount,
            fee,
            key: key.clone(),
            payout_id,
        };
        let outcome = self
            .store
            .apply_mutation(merchant_id, mutation, now)
            .await
            .inspect_err(|e| debug!(%merchant_id, %amount, %fee, %key, error = %e, "Reservation refused"))?;
        if outcome.replayed {
            debug!(%merchant_id, %key, "Reservation replayed");
        } else {
            info!(
                %merchant_id,
                %amount,
                %fee,
                %key,
                available = %outcome.balance.available,
                reserved = %outcome.balance.reserved,
                "Funds reserved"
            );
        }
        Ok(Reservation {
            balance: outcome.balance,
            replayed: outcome.replayed,
        })
    }

    /// Move a payout's `amount + fee` from `reserved` back to `available`.
    /// At most once per payout.
    pub async fn release(
        &self,
        merchant_id: MerchantId,
        amount: Decimal,
        fee: Decimal,
        payout_id: PayoutId,
        now: DateTime<Utc>,
    ) -> Result<MerchantBalance> {
        let mutation = BalanceMutation::Release {
            amount,
            fee,
            payout_id: Some(payout_id),
            key: IdempotencyKey::release_of(payout_id),
        };
        let outcome = self.store.apply_mutation(merchant_id, mutation, now).await?;
        if !outcome.replayed {
            info!(
                %merchant_id,
                %payout_id,
                %amount,
                %fee,
                available = %outcome.balance.available,
                "Reservation released"
            );
        }
        Ok(outcome.balance)
    }

    /// Consume a payout's reservation into `total_payouts` / `total_fees`.
    /// At most once per payout.
    pub async fn settle(
        &self,
        merchant_id: MerchantId,
        amount: Decimal,
        fee: Decimal,
        payout_id: PayoutId,
        tx_reference: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<MerchantBalance> {
        let mutation = BalanceMutation::Settle {
            amount,
            fee,
            payout_id,
            tx_reference: tx_reference.map(str::to_string),
        };
        let outcome = self.store.apply_mutation(merchant_id, mutation, now).await?;
        if outcome.replayed {
            warn!(%merchant_id, %payout_id, "Settlement already applied");
        } else {
            info!(
                %merchant_id,
                %payout_id,
                %amount,
                %fee,
                reserved = %outcome.balance.reserved,
                "Payout settled"
            );
        }
        Ok(outcome.balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fee::BasisPointsFeeCalculator, memory::MemoryStore};

    fn d(units: i64) -> Decimal {
        Decimal::new(units, 2)
    }

    fn balance_store() -> BalanceStore {
        BalanceStore::new(
            Arc::new(MemoryStore::new()),
            Arc::new(BasisPointsFeeCalculator::default()),
        )
    }

    #[tokio::test]
    async fn unknown_merchant_reads_as_zero() {
        let bs = balance_store();
        let bal = bs.balance(MerchantId::new()).await.unwrap();
        assert_eq!(bal.available, Decimal::ZERO);
    }

    #[tokio::test]
    async fn scenario_reserve_then_settle() {
        let bs = balance_store();
        let mch = MerchantId::new();
        let payout = PayoutId::new();
        let now = Utc::now();
        bs.credit(mch, d(10_000), "Initial funding", now).await.unwrap();

        let fee = bs.calculate_fee(d(4000));
        assert_eq!(fee, d(100));
        let r = bs
            .reserve(mch, d(4000), fee, IdempotencyKey::new("p1"), Some(payout), now)
            .await
            .unwrap();
        assert_eq!(r.balance.available, d(5900));
        assert_eq!(r.balance.reserved, d(4100));

        let bal = bs.settle(mch, d(4000), fee, payout, Some("sig"), now).await.unwrap();
        assert_eq!(bal.reserved, Decimal::ZERO);
        assert_eq!(bal.total_payouts, d(4000));
        assert_eq!(bal.total_fees, d(100));
    }

    #[tokio::test]
    async fn idempotent_reservation() {
        let bs = balance_store();
        let mch = MerchantId::new();
        let now = Utc::now();
        bs.credit(mch, d(10_000), "Initial funding", now).await.unwrap();

        let key = IdempotencyKey::new("key-A");
        let first = bs.reserve(mch, d(1000), d(10), key.clone(), None, now).await.unwrap();
        let second = bs.reserve(mch, d(1000), d(10), key, None, now).await.unwrap();
        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(second.balance.reserved, d(1010));
        assert_eq!(second.balance.available, d(8990));
    }

    #[tokio::test]
    async fn reservation_conserves_held_funds() {
        let bs = balance_store();
        let mch = MerchantId::new();
        let now = Utc::now();
        bs.credit(mch, d(10_000), "Initial funding", now).await.unwrap();
        let before = bs.balance(mch).await.unwrap();
        let after = bs
            .reserve(mch, d(2500), d(100), IdempotencyKey::new("k"), None, now)
            .await
            .unwrap()
            .balance;
        assert_eq!(before.available + before.reserved, after.available + after.reserved);
    }

    #[tokio::test]
    async fn release_is_at_most_once() {
        let bs = balance_store();
        let mch = MerchantId::new();
        let payout = PayoutId::new();
        let now = Utc::now();
        bs.credit(mch, d(10_000), "Initial funding", now).await.unwrap();
        bs.reserve(mch, d(1000), d(100), IdempotencyKey::new("a"), Some(payout), now)
            .await
            .unwrap();
        bs.reserve(mch, d(1000), d(100), IdempotencyKey::new("b"), None, now)
            .await
            .unwrap();

        bs.release(mch, d(1000), d(100), payout, now).await.unwrap();
        let bal = bs.release(mch, d(1000), d(100), payout, now).await.unwrap();
        assert_eq!(bal.reserved, d(1100));
        assert_eq!(bal.available, d(8900));
    }

    #[tokio::test]
    async fn duplicate_deposit_reference_credits_once() {
        let bs = balance_store();
        let mch = MerchantId::new();
        let now = Utc::now();
        bs.credit_deposit(mch, d(5000), "5xYzAbCdEfGhIj", now).await.unwrap();
        let again = bs.credit_deposit(mch, d(5000), "5xYzAbCdEfGhIj", now).await.unwrap();
        assert!(again.replayed);
        assert_eq!(again.balance.available, d(5000));
    }

    #[tokio::test]
    async fn request_keys_cannot_shadow_internal_markers() {
        let bs = balance_store();
        let mch = MerchantId::new();
        let payout = PayoutId::new();
        let now = Utc::now();
        bs.credit(mch, d(10_000), "Initial funding", now).await.unwrap();

        let forged_deposit = IdempotencyKey::new("deposit:5xYzAbCdEfGhIjKk");
        bs.reserve(mch, d(100), d(100), forged_deposit, None, now).await.unwrap();
        let forged_release = IdempotencyKey::release_of(payout);
        bs.reserve(mch, d(1000), d(100), forged_release, Some(payout), now)
            .await
            .unwrap();

        let deposit = bs.credit_deposit(mch, d(50_000), "5xYzAbCdEfGhIjKk", now).await.unwrap();
        assert!(!deposit.replayed);
        assert_eq!(deposit.balance.total_deposited, d(60_000));

        let bal = bs.release(mch, d(1000), d(100), payout, now).await.unwrap();
        assert_eq!(bal.reserved, d(200));
    }

    #[tokio::test]
    async fn deposit_reference_cannot_credit_two_merchants() {
        let bs = balance_store();
        let now = Utc::now();
        let (a, b) = (MerchantId::new(), MerchantId::new());
        let first = bs.credit_deposit(a, d(50_000), "5xYzAbCdEfGhIjKk", now).await.unwrap();
        assert!(!first.replayed);
        let err = bs.credit_deposit(b, d(50_000), "5xYzAbCdEfGhIjKk", now).await.unwrap_err();
        assert!(matches!(err, treasury_types::TreasuryError::DepositReferenceUsed { .. }));
        assert_eq!(bs.balance(b).await.unwrap().available, Decimal::ZERO);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn no_overdraft_under_concurrency() {
        let bs = balance_store();
        let mch = MerchantId::new();
        bs.credit(mch, d(10_000), "Initial funding", Utc::now()).await.unwrap();

        // 20 reservations of 10.00 against 100.00: exactly 10 fit.
        let mut handles = Vec::new();
        for i in 0..20 {
            let bs = bs.clone();
            handles.push(tokio::spawn(async move {
                bs.reserve(
                    mch,
                    d(1000),
                    Decimal::ZERO,
                    IdempotencyKey::new(format!("c{i}")),
                    None,
                    Utc::now(),
                )
                .await
            }));
        }
        let mut ok = 0;
        let mut refused = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(treasury_types::TreasuryError::InsufficientBalance { .. }) => refused += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, 10);
        assert_eq!(refused, 10);

        let bal = bs.balance(mch).await.unwrap();
        assert_eq!(bal.available, Decimal::ZERO);
        assert_eq!(bal.reserved, d(10_000));
    }
}
