//! Pluggable persistence for the treasury.
//!
//! A store must offer two primitives:
//! - atomic read-modify-write of one merchant row, where the balance change
//!   and its journal row commit together ([`TreasuryStore::apply_mutation`])
//! - compare-and-swap of one payout row ([`TreasuryStore::update_payout`])
//!
//! Deposit references are unique across the whole store: a reference
//! credited to one merchant is refused for every other merchant, and the
//! reference is claimed in the same atomic unit as the credit.
//!
//! Merchants and payouts are independent, so implementations lock per row
//! and never take a store-wide lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use treasury_types::{
    BalanceMutation, BatchId, ClaimToken, MerchantBalance, MerchantId, Payout, PayoutBatch,
    PayoutChange, PayoutId, PayoutStatus, Recipient, Result, TransactionKind, TreasuryTransaction,
};

use crate::account::MutationOutcome;

/// Filter and page for journal listings (newest first).
#[derive(Debug, Clone, Default)]
pub struct TransactionQuery {
    pub kind: Option<TransactionKind>,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// Filter and page for payout listings (newest first).
#[derive(Debug, Clone, Default)]
pub struct PayoutQuery {
    pub status: Option<PayoutStatus>,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[async_trait]
pub trait TreasuryStore: Send + Sync {
    // --- Merchant rows ---

    /// Apply `mutation` to the merchant's row atomically, creating a zero row
    /// on first reference.
    ///
    /// # Errors
    /// `DepositReferenceUsed` if a deposit credit carries a reference
    /// already credited to another merchant, plus any error of
    /// [`crate::account::plan_mutation`].
    async fn apply_mutation(
        &self,
        merchant_id: MerchantId,
        mutation: BalanceMutation,
        now: DateTime<Utc>,
    ) -> Result<MutationOutcome>;

    /// Current balance, `None` if the merchant was never referenced.
    async fn balance(&self, merchant_id: MerchantId) -> Result<Option<MerchantBalance>>;

    async fn transactions(
        &self,
        merchant_id: MerchantId,
        query: &TransactionQuery,
    ) -> Result<Vec<TreasuryTransaction>>;

    // --- Payouts and batches ---

    /// Persist new payouts, and their batch if given, as one unit.
    async fn insert_payouts(&self, batch: Option<PayoutBatch>, payouts: Vec<Payout>) -> Result<()>;

    async fn payout(&self, id: PayoutId) -> Result<Option<Payout>>;

    async fn payout_by_token(&self, token: &ClaimToken) -> Result<Option<Payout>>;

    async fn payouts_by_merchant(
        &self,
        merchant_id: MerchantId,
        query: &PayoutQuery,
    ) -> Result<Vec<Payout>>;

    async fn batch(&self, id: BatchId) -> Result<Option<PayoutBatch>>;

    /// Apply `change` under the payout's row lock and return the new row.
    ///
    /// # Errors
    /// `PayoutNotFound`, or the precondition failure of
    /// [`Payout::apply_change`] with the row left untouched.
    async fn update_payout(&self, id: PayoutId, change: &PayoutChange) -> Result<Payout>;

    /// `SENT` payouts past their expiry with no live claim, oldest first.
    async fn overdue_payouts(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Payout>>;

    // --- Recipient directory ---

    async fn upsert_recipient(
        &self,
        email: &str,
        wallet: &str,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> Result<Recipient>;

    async fn recipient(&self, email: &str) -> Result<Option<Recipient>>;
}

/// Apply offset and limit to an already ordered sequence.
pub(crate) fn page<T>(items: impl Iterator<Item = T>, offset: usize, limit: Option<usize>) -> Vec<T> {
    let items = items.skip(offset);
    match limit {
        Some(limit) => items.take(limit).collect(),
        None => items.collect(),
    }
}
