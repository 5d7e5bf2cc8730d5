//! Response shapes of the engine's boundary operations.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use treasury_escrow::{BatchOutcome, ClaimOutcome, DepositOutcome};
use treasury_types::{BatchId, MerchantBalance, Payout, PayoutId, PayoutStatus};

pub use treasury_escrow::{DepositInstructions, PublicPayout};

/// Returned to the merchant for each created payout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PayoutReceipt {
    pub payout_id: PayoutId,
    pub email: String,
    pub amount: Decimal,
    pub fee: Decimal,
    pub currency: String,
    pub status: PayoutStatus,
    pub claim_url: String,
    pub expires_at: DateTime<Utc>,
}

impl From<&Payout> for PayoutReceipt {
    fn from(payout: &Payout) -> Self {
        Self {
            payout_id: payout.id,
            email: payout.email.clone(),
            amount: payout.amount,
            fee: payout.fee,
            currency: payout.currency.clone(),
            status: payout.status,
            claim_url: payout.claim_url.clone(),
            expires_at: payout.expires_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchReceipt {
    pub batch_id: BatchId,
    pub count: usize,
    pub total_amount: Decimal,
    pub total_fees: Decimal,
    pub payouts: Vec<PayoutReceipt>,
}

impl From<&BatchOutcome> for BatchReceipt {
    fn from(outcome: &BatchOutcome) -> Self {
        Self {
            batch_id: outcome.batch.id,
            count: outcome.batch.count,
            total_amount: outcome.batch.total_amount,
            total_fees: outcome.batch.total_fees,
            payouts: outcome.payouts.iter().map(PayoutReceipt::from).collect(),
        }
    }
}

/// Returned to the recipient after a claim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimReceipt {
    pub payout_id: PayoutId,
    pub status: PayoutStatus,
    pub amount: Decimal,
    pub currency: String,
    pub tx_signature: String,
    /// No funds moved; the reference is synthetic.
    pub simulated: bool,
}

impl From<&ClaimOutcome> for ClaimReceipt {
    fn from(outcome: &ClaimOutcome) -> Self {
        Self {
            payout_id: outcome.payout.id,
            status: outcome.payout.status,
            amount: outcome.payout.amount,
            currency: outcome.payout.currency.clone(),
            tx_signature: outcome.tx_signature.clone(),
            simulated: outcome.simulated,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DepositReceipt {
    pub balance: MerchantBalance,
    pub credited: Decimal,
    pub replayed: bool,
}

impl From<DepositOutcome> for DepositReceipt {
    fn from(outcome: DepositOutcome) -> Self {
        Self {
            balance: outcome.balance,
            credited: outcome.credited,
            replayed: outcome.replayed,
        }
    }
}
