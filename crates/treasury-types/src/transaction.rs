//! Treasury journal rows.
//!
//! Every balance mutation appends exactly one [`TreasuryTransaction`] in the
//! same atomic unit as the balance change. Rows of one merchant are chained:
//! each row stores the hash of its predecessor, so a rewritten history is
//! detectable with [`verify_chain`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{IdempotencyKey, MerchantId, PayoutId, TransactionId};

/// Hash used as `prev_hash` of a merchant's first journal row.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// What a journal row records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit,
    FeeDeducted,
    PayoutReserved,
    PayoutReleased,
    PayoutDebited,
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deposit => write!(f, "deposit"),
            Self::FeeDeducted => write!(f, "fee_deducted"),
            Self::PayoutReserved => write!(f, "payout_reserved"),
            Self::PayoutReleased => write!(f, "payout_released"),
            Self::PayoutDebited => write!(f, "payout_debited"),
        }
    }
}

/// Append-only audit row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TreasuryTransaction {
    pub id: TransactionId,
    pub merchant_id: MerchantId,
    pub kind: TransactionKind,
    /// Amount moved, fee included.
    pub amount: Decimal,
    pub payout_id: Option<PayoutId>,
    /// Replay key the mutation was applied under, if any.
    pub idempotency_key: Option<IdempotencyKey>,
    /// On-chain reference (deposit hash or settlement signature).
    pub tx_reference: Option<String>,
    pub description: String,
    /// `available` after this mutation.
    pub balance_after: Decimal,
    pub prev_hash: String,
    pub entry_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Journal row fields before hashing.
#[derive(Debug, Clone)]
pub struct TransactionDraft {
    pub merchant_id: MerchantId,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub payout_id: Option<PayoutId>,
    pub idempotency_key: Option<IdempotencyKey>,
    pub tx_reference: Option<String>,
    pub description: String,
    pub balance_after: Decimal,
}

impl TreasuryTransaction {
    /// Seal `draft` onto the chain whose last hash is `prev_hash`.
    #[must_use]
    pub fn seal(draft: TransactionDraft, prev_hash: &str, created_at: DateTime<Utc>) -> Self {
        let mut tx = Self {
            id: TransactionId::new(),
            merchant_id: draft.merchant_id,
            kind: draft.kind,
            amount: draft.amount,
            payout_id: draft.payout_id,
            idempotency_key: draft.idempotency_key,
            tx_reference: draft.tx_reference,
            description: draft.description,
            balance_after: draft.balance_after,
            prev_hash: prev_hash.to_string(),
            entry_hash: String::new(),
            created_at,
        };
        tx.entry_hash = tx.compute_hash();
        tx
    }

    /// SHA-256 over the row's content and its predecessor's hash.
    #[must_use]
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.0.as_bytes());
        hasher.update(self.merchant_id.0.as_bytes());
        hasher.update(self.kind.to_string().as_bytes());
        hasher.update(self.amount.to_string().as_bytes());
        if let Some(payout_id) = self.payout_id {
            hasher.update(payout_id.0.as_bytes());
        }
        if let Some(reference) = &self.tx_reference {
            hasher.update(reference.as_bytes());
        }
        hasher.update(self.balance_after.to_string().as_bytes());
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(self.created_at.timestamp_micros().to_le_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Check that `journal` (oldest first) is an unbroken hash chain.
///
/// Returns the index of the first bad row, if any.
#[must_use]
pub fn verify_chain(journal: &[TreasuryTransaction]) -> Option<usize> {
    let mut prev = GENESIS_HASH;
    for (i, tx) in journal.iter().enumerate() {
        if tx.prev_hash != prev || tx.entry_hash != tx.compute_hash() {
            return Some(i);
        }
        prev = &tx.entry_hash;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(kind: TransactionKind, amount: i64) -> TransactionDraft {
        TransactionDraft {
            merchant_id: MerchantId::new(),
            kind,
            amount: Decimal::new(amount, 2),
            payout_id: None,
            idempotency_key: None,
            tx_reference: None,
            description: "test".into(),
            balance_after: Decimal::ZERO,
        }
    }

    #[test]
    fn chain_verifies() {
        let now = Utc::now();
        let a = TreasuryTransaction::seal(draft(TransactionKind::Deposit, 10_000), GENESIS_HASH, now);
        let b = TreasuryTransaction::seal(
            draft(TransactionKind::PayoutReserved, 4_100),
            &a.entry_hash,
            now,
        );
        assert_eq!(verify_chain(&[a, b]), None);
    }

    #[test]
    fn tampered_row_is_detected() {
        let now = Utc::now();
        let a = TreasuryTransaction::seal(draft(TransactionKind::Deposit, 10_000), GENESIS_HASH, now);
        let mut b = TreasuryTransaction::seal(
            draft(TransactionKind::PayoutReserved, 4_100),
            &a.entry_hash,
            now,
        );
        b.amount = Decimal::new(1, 2);
        assert_eq!(verify_chain(&[a, b]), Some(1));
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&TransactionKind::PayoutDebited).unwrap();
        assert_eq!(json, "\"payout_debited\"");
        assert_eq!(TransactionKind::FeeDeducted.to_string(), "fee_deducted");
    }
}
