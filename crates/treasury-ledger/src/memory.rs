//! In-memory [`TreasuryStore`] built on `DashMap`.
//!
//! Each row is guarded by its shard's entry lock, held only for the
//! synchronous read-modify-write. No lock is held across an `.await`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use rust_decimal::Decimal;
use treasury_types::{
    BalanceMutation, BatchId, ClaimToken, MerchantBalance, MerchantId, Payout, PayoutBatch,
    PayoutChange, PayoutId, PayoutStatus, Recipient, Result, TreasuryError, TreasuryTransaction,
};

use crate::{
    account::{LedgerAccount, MutationOutcome},
    store::{PayoutQuery, TransactionQuery, TreasuryStore, page},
};

#[derive(Debug, Default)]
pub struct MemoryStore {
    accounts: DashMap<MerchantId, LedgerAccount>,
    payouts: DashMap<PayoutId, Payout>,
    tokens: DashMap<ClaimToken, PayoutId>,
    merchant_payouts: DashMap<MerchantId, Vec<PayoutId>>,
    /// Deposit reference → merchant it was credited to.
    deposit_refs: DashMap<String, MerchantId>,
    batches: DashMap<BatchId, PayoutBatch>,
    recipients: DashMap<String, Recipient>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Full journal of a merchant, oldest first.
    pub fn journal(&self, merchant_id: MerchantId) -> Vec<TreasuryTransaction> {
        self.accounts
            .get(&merchant_id)
            .map(|acct| acct.journal().to_vec())
            .unwrap_or_default()
    }

    fn apply_to_account(
        &self,
        merchant_id: MerchantId,
        mutation: &BalanceMutation,
        now: DateTime<Utc>,
    ) -> Result<MutationOutcome> {
        let mut account = self
            .accounts
            .entry(merchant_id)
            .or_insert_with(|| LedgerAccount::new(merchant_id, now));
        account.apply(mutation, now)
    }
}

#[async_trait]
impl TreasuryStore for MemoryStore {
    async fn apply_mutation(
        &self,
        merchant_id: MerchantId,
        mutation: BalanceMutation,
        now: DateTime<Utc>,
    ) -> Result<MutationOutcome> {
        let BalanceMutation::Credit {
            tx_reference: Some(reference),
            ..
        } = &mutation
        else {
            return self.apply_to_account(merchant_id, &mutation, now);
        };

        // The reference's index entry stays locked until the credit lands.
        match self.deposit_refs.entry(reference.clone()) {
            Entry::Occupied(owner) if *owner.get() != merchant_id => {
                Err(TreasuryError::DepositReferenceUsed {
                    tx_reference: reference.clone(),
                })
            }
            Entry::Occupied(_) => self.apply_to_account(merchant_id, &mutation, now),
            Entry::Vacant(slot) => {
                let outcome = self.apply_to_account(merchant_id, &mutation, now)?;
                slot.insert(merchant_id);
                Ok(outcome)
            }
        }
    }

    async fn balance(&self, merchant_id: MerchantId) -> Result<Option<MerchantBalance>> {
        Ok(self.accounts.get(&merchant_id).map(|acct| acct.balance.clone()))
    }

    async fn transactions(
        &self,
        merchant_id: MerchantId,
        query: &TransactionQuery,
    ) -> Result<Vec<TreasuryTransaction>> {
        let Some(account) = self.accounts.get(&merchant_id) else {
            return Ok(Vec::new());
        };
        let rows = account
            .journal()
            .iter()
            .rev()
            .filter(|tx| query.kind.is_none_or(|kind| tx.kind == kind))
            .cloned();
        Ok(page(rows, query.offset, query.limit))
    }

    async fn insert_payouts(&self, batch: Option<PayoutBatch>, payouts: Vec<Payout>) -> Result<()> {
        if let Some(batch) = batch {
            self.batches.insert(batch.id, batch);
        }
        for payout in payouts {
            self.tokens.insert(payout.claim_token.clone(), payout.id);
            self.merchant_payouts
                .entry(payout.merchant_id)
                .or_default()
                .push(payout.id);
            self.payouts.insert(payout.id, payout);
        }
        Ok(())
    }

    async fn payout(&self, id: PayoutId) -> Result<Option<Payout>> {
        Ok(self.payouts.get(&id).map(|p| p.clone()))
    }

    async fn payout_by_token(&self, token: &ClaimToken) -> Result<Option<Payout>> {
        let Some(id) = self.tokens.get(token).map(|id| *id) else {
            return Ok(None);
        };
        self.payout(id).await
    }

    async fn payouts_by_merchant(
        &self,
        merchant_id: MerchantId,
        query: &PayoutQuery,
    ) -> Result<Vec<Payout>> {
        let ids = self
            .merchant_payouts
            .get(&merchant_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        let mut payouts: Vec<Payout> = ids
            .iter()
            .filter_map(|id| self.payouts.get(id).map(|p| p.clone()))
            .filter(|p| query.status.is_none_or(|status| p.status == status))
            .collect();
        payouts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(page(payouts.into_iter(), query.offset, query.limit))
    }

    async fn batch(&self, id: BatchId) -> Result<Option<PayoutBatch>> {
        Ok(self.batches.get(&id).map(|b| b.clone()))
    }

    async fn update_payout(&self, id: PayoutId, change: &PayoutChange) -> Result<Payout> {
        let mut row = self.payouts.get_mut(&id).ok_or(TreasuryError::PayoutNotFound)?;
        let mut next = row.clone();
        next.apply_change(change)?;
        *row = next.clone();
        Ok(next)
    }

    async fn overdue_payouts(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Payout>> {
        let mut overdue: Vec<Payout> = self
            .payouts
            .iter()
            .filter(|p| {
                p.status == PayoutStatus::Sent && p.is_overdue(now) && !p.has_live_lease(now)
            })
            .map(|p| p.clone())
            .collect();
        overdue.sort_by_key(|p| p.expires_at);
        overdue.truncate(limit);
        Ok(overdue)
    }

    async fn upsert_recipient(
        &self,
        email: &str,
        wallet: &str,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> Result<Recipient> {
        let entry = self
            .recipients
            .entry(email.to_string())
            .and_modify(|r| r.record_claim(wallet, amount, at))
            .or_insert_with(|| Recipient::first_claim(email, wallet, amount, at));
        Ok(entry.clone())
    }

    async fn recipient(&self, email: &str) -> Result<Option<Recipient>> {
        Ok(self.recipients.get(email).map(|r| r.clone()))
    }
}
