//! RocksDB-backed [`TreasuryStore`].
//!
//! Uses a pessimistic `TransactionDB`: every mutation reads its row with
//! `get_for_update`, which locks that key until commit, then writes the new
//! row, its journal entry and its idempotency marker in one transaction.
//!
//! Key layout (all values JSON unless noted):
//!
//! | Prefix | Value |
//! |---|---|
//! | `bal/{merchant}` | `MerchantBalance` |
//! | `head/{merchant}` | newest journal hash (UTF-8) |
//! | `idem/{merchant}/{key}` | marker |
//! | `dref/{reference}` | `MerchantId` the deposit was credited to |
//! | `jrnl/{merchant}/{tx}` | `TreasuryTransaction` |
//! | `po/{payout}` | `Payout` |
//! | `tok/{token}` | `PayoutId` |
//! | `mpo/{merchant}/{payout}` | `PayoutId` |
//! | `batch/{batch}` | `PayoutBatch` |
//! | `rcp/{email}` | `Recipient` |

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{Direction, IteratorMode, Options, TransactionDB, TransactionDBOptions};
use rust_decimal::Decimal;
use serde::{Serialize, de::DeserializeOwned};
use treasury_types::{
    BalanceMutation, BatchId, ClaimToken, GENESIS_HASH, MerchantBalance, MerchantId, Payout,
    PayoutBatch, PayoutChange, PayoutId, PayoutStatus, Recipient, Result, TreasuryError,
    TreasuryTransaction,
};

use crate::{
    account::{MutationOutcome, plan_mutation},
    store::{PayoutQuery, TransactionQuery, TreasuryStore, page},
};

mod keys {
    use treasury_types::{BatchId, ClaimToken, IdempotencyKey, MerchantId, PayoutId, TransactionId};

    pub fn balance(m: MerchantId) -> String {
        format!("bal/{m}")
    }
    pub fn head(m: MerchantId) -> String {
        format!("head/{m}")
    }
    pub fn idempotency(m: MerchantId, key: &IdempotencyKey) -> String {
        format!("idem/{m}/{key}")
    }
    pub fn deposit_reference(reference: &str) -> String {
        format!("dref/{reference}")
    }
    pub fn journal_prefix(m: MerchantId) -> String {
        format!("jrnl/{m}/")
    }
    pub fn journal(m: MerchantId, tx: TransactionId) -> String {
        format!("jrnl/{m}/{tx}")
    }
    pub fn payout(p: PayoutId) -> String {
        format!("po/{p}")
    }
    pub const PAYOUT_PREFIX: &str = "po/";
    pub fn token(t: &ClaimToken) -> String {
        format!("tok/{}", t.as_str())
    }
    pub fn merchant_payout_prefix(m: MerchantId) -> String {
        format!("mpo/{m}/")
    }
    pub fn merchant_payout(m: MerchantId, p: PayoutId) -> String {
        format!("mpo/{m}/{p}")
    }
    pub fn batch(b: BatchId) -> String {
        format!("batch/{b}")
    }
    pub fn recipient(email: &str) -> String {
        format!("rcp/{email}")
    }
}

fn storage(err: rocksdb::Error) -> TreasuryError {
    TreasuryError::Storage(err.to_string())
}

pub struct RocksStore {
    db: TransactionDB,
}

impl RocksStore {
    /// Open or create a database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = TransactionDB::open(&opts, &TransactionDBOptions::default(), path)
            .map_err(storage)?;
        Ok(Self { db })
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.db.get(key).map_err(storage)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Values of every key starting with `prefix`, in key order.
    fn scan_json<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        let mut values = Vec::new();
        let mode = IteratorMode::From(prefix.as_bytes(), Direction::Forward);
        for item in self.db.iterator(mode) {
            let (key, value) = item.map_err(storage)?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            values.push(serde_json::from_slice(&value)?);
        }
        Ok(values)
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

#[async_trait]
impl TreasuryStore for RocksStore {
    async fn apply_mutation(
        &self,
        merchant_id: MerchantId,
        mutation: BalanceMutation,
        now: DateTime<Utc>,
    ) -> Result<MutationOutcome> {
        let txn = self.db.transaction();
        let balance_key = keys::balance(merchant_id);
        let current = match txn.get_for_update(&balance_key, true).map_err(storage)? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => MerchantBalance::new(merchant_id, now),
        };

        let key = mutation.idempotency_key();
        if let Some(key) = &key {
            let marker = keys::idempotency(merchant_id, key);
            if txn.get_for_update(&marker, true).map_err(storage)?.is_some() {
                return Ok(MutationOutcome::replay(current));
            }
        }

        let deposit_reference = match &mutation {
            BalanceMutation::Credit {
                tx_reference: Some(reference),
                ..
            } => Some(reference.as_str()),
            _ => None,
        };
        if let Some(reference) = deposit_reference {
            let owner_key = keys::deposit_reference(reference);
            if let Some(bytes) = txn.get_for_update(&owner_key, true).map_err(storage)? {
                let owner: MerchantId = serde_json::from_slice(&bytes)?;
                if owner != merchant_id {
                    return Err(TreasuryError::DepositReferenceUsed {
                        tx_reference: reference.to_string(),
                    });
                }
            }
        }

        let head_key = keys::head(merchant_id);
        let prev_hash = match txn.get(&head_key).map_err(storage)? {
            Some(bytes) => String::from_utf8(bytes)
                .map_err(|e| TreasuryError::Storage(format!("corrupt journal head: {e}")))?,
            None => GENESIS_HASH.to_string(),
        };

        let (next, transaction) = plan_mutation(&current, &mutation, &prev_hash, now)?;

        txn.put(&balance_key, to_json(&next)?).map_err(storage)?;
        txn.put(keys::journal(merchant_id, transaction.id), to_json(&transaction)?)
            .map_err(storage)?;
        txn.put(&head_key, transaction.entry_hash.as_bytes())
            .map_err(storage)?;
        if let Some(key) = &key {
            txn.put(keys::idempotency(merchant_id, key), b"1")
                .map_err(storage)?;
        }
        if let Some(reference) = deposit_reference {
            txn.put(keys::deposit_reference(reference), to_json(&merchant_id)?)
                .map_err(storage)?;
        }
        txn.commit().map_err(storage)?;

        Ok(MutationOutcome {
            balance: next,
            transaction: Some(transaction),
            replayed: false,
        })
    }

    async fn balance(&self, merchant_id: MerchantId) -> Result<Option<MerchantBalance>> {
        self.get_json(&keys::balance(merchant_id))
    }

    async fn transactions(
        &self,
        merchant_id: MerchantId,
        query: &TransactionQuery,
    ) -> Result<Vec<TreasuryTransaction>> {
        let journal: Vec<TreasuryTransaction> = self.scan_json(&keys::journal_prefix(merchant_id))?;
        let rows = journal
            .into_iter()
            .rev()
            .filter(|tx| query.kind.is_none_or(|kind| tx.kind == kind));
        Ok(page(rows, query.offset, query.limit))
    }

    async fn insert_payouts(&self, batch: Option<PayoutBatch>, payouts: Vec<Payout>) -> Result<()> {
        let txn = self.db.transaction();
        if let Some(batch) = &batch {
            txn.put(keys::batch(batch.id), to_json(batch)?)
                .map_err(storage)?;
        }
        for payout in &payouts {
            txn.put(keys::payout(payout.id), to_json(payout)?)
                .map_err(storage)?;
            txn.put(keys::token(&payout.claim_token), to_json(&payout.id)?)
                .map_err(storage)?;
            txn.put(
                keys::merchant_payout(payout.merchant_id, payout.id),
                to_json(&payout.id)?,
            )
            .map_err(storage)?;
        }
        txn.commit().map_err(storage)
    }

    async fn payout(&self, id: PayoutId) -> Result<Option<Payout>> {
        self.get_json(&keys::payout(id))
    }

    async fn payout_by_token(&self, token: &ClaimToken) -> Result<Option<Payout>> {
        match self.get_json::<PayoutId>(&keys::token(token))? {
            Some(id) => self.payout(id).await,
            None => Ok(None),
        }
    }

    async fn payouts_by_merchant(
        &self,
        merchant_id: MerchantId,
        query: &PayoutQuery,
    ) -> Result<Vec<Payout>> {
        let ids: Vec<PayoutId> = self.scan_json(&keys::merchant_payout_prefix(merchant_id))?;
        let mut payouts = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(payout) = self.get_json::<Payout>(&keys::payout(id))? {
                if query.status.is_none_or(|status| payout.status == status) {
                    payouts.push(payout);
                }
            }
        }
        payouts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(page(payouts.into_iter(), query.offset, query.limit))
    }

    async fn batch(&self, id: BatchId) -> Result<Option<PayoutBatch>> {
        self.get_json(&keys::batch(id))
    }

    async fn update_payout(&self, id: PayoutId, change: &PayoutChange) -> Result<Payout> {
        let txn = self.db.transaction();
        let key = keys::payout(id);
        let bytes = txn
            .get_for_update(&key, true)
            .map_err(storage)?
            .ok_or(TreasuryError::PayoutNotFound)?;
        let mut payout: Payout = serde_json::from_slice(&bytes)?;
        payout.apply_change(change)?;
        txn.put(&key, to_json(&payout)?).map_err(storage)?;
        txn.commit().map_err(storage)?;
        Ok(payout)
    }

    async fn overdue_payouts(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Payout>> {
        let mut overdue: Vec<Payout> = self
            .scan_json::<Payout>(keys::PAYOUT_PREFIX)?
            .into_iter()
            .filter(|p| {
                p.status == PayoutStatus::Sent && p.is_overdue(now) && !p.has_live_lease(now)
            })
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
        let txn = self.db.transaction();
        let key = keys::recipient(email);
        let recipient = match txn.get_for_update(&key, true).map_err(storage)? {
            Some(bytes) => {
                let mut existing: Recipient = serde_json::from_slice(&bytes)?;
                existing.record_claim(wallet, amount, at);
                existing
            }
            None => Recipient::first_claim(email, wallet, amount, at),
        };
        txn.put(&key, to_json(&recipient)?).map_err(storage)?;
        txn.commit().map_err(storage)?;
        Ok(recipient)
    }

    async fn recipient(&self, email: &str) -> Result<Option<Recipient>> {
        self.get_json(&keys::recipient(email))
    }
}
