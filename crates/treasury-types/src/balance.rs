//! Merchant balance model.
//!
//! A merchant's money lives in two buckets: `available` (free to reserve)
//! and `reserved` (earmarked for payouts not yet settled or released).
//! Settled money leaves the buckets and is counted in the lifetime
//! `total_payouts` / `total_fees` counters, so at every point:
//!
//! ```text
//! available + reserved + total_payouts + total_fees == total_deposited
//! ```

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{IdempotencyKey, MerchantId, PayoutId, constants::SETTLEMENT_CURRENCY};

/// Per-merchant treasury balance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MerchantBalance {
    pub merchant_id: MerchantId,
    pub currency: String,
    /// Funds free to reserve or withdraw.
    pub available: Decimal,
    /// Funds earmarked for payouts that have not been settled or released.
    pub reserved: Decimal,
    /// Funds credited but not yet available. Nothing in the engine moves
    /// money here today; it stays zero unless an operator sets it.
    pub pending: Decimal,
    /// Lifetime deposits. Never decreases.
    pub total_deposited: Decimal,
    /// Lifetime fees charged on settled payouts. Never decreases.
    pub total_fees: Decimal,
    /// Lifetime payout principal settled. Never decreases.
    pub total_payouts: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MerchantBalance {
    /// A zero balance, as created lazily on first reference to a merchant.
    #[must_use]
    pub fn new(merchant_id: MerchantId, now: DateTime<Utc>) -> Self {
        Self {
            merchant_id,
            currency: SETTLEMENT_CURRENCY.to_string(),
            available: Decimal::ZERO,
            reserved: Decimal::ZERO,
            pending: Decimal::ZERO,
            total_deposited: Decimal::ZERO,
            total_fees: Decimal::ZERO,
            total_payouts: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    /// Money still held by the treasury for this merchant.
    #[must_use]
    pub fn held(&self) -> Decimal {
        self.available + self.reserved
    }

    /// Money that has left the treasury (principal plus fees).
    #[must_use]
    pub fn disbursed(&self) -> Decimal {
        self.total_payouts + self.total_fees
    }
}

/// One of the four balance primitives, expressed as data so a store can
/// apply it atomically to a single merchant row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalanceMutation {
    /// Increase `available` and `total_deposited`.
    Credit {
        amount: Decimal,
        note: String,
        /// On-chain reference of the deposit, used for replay protection.
        tx_reference: Option<String>,
    },
    /// Move `amount + fee` from `available` to `reserved`.
    Reserve {
        amount: Decimal,
        fee: Decimal,
        key: IdempotencyKey,
        payout_id: Option<PayoutId>,
    },
    /// Move `amount + fee` from `reserved` back to `available`.
    Release {
        amount: Decimal,
        fee: Decimal,
        payout_id: Option<PayoutId>,
        key: IdempotencyKey,
    },
    /// Consume `amount + fee` from `reserved` into the lifetime counters.
    Settle {
        amount: Decimal,
        fee: Decimal,
        payout_id: PayoutId,
        tx_reference: Option<String>,
    },
}

impl BalanceMutation {
    /// The replay marker of this mutation, if it has one.
    #[must_use]
    pub fn idempotency_key(&self) -> Option<IdempotencyKey> {
        match self {
            Self::Credit { tx_reference, .. } => {
                tx_reference.as_deref().map(IdempotencyKey::deposit_of)
            }
            Self::Reserve { key, .. } => Some(key.reservation()),
            Self::Release { key, .. } => Some(key.clone()),
            Self::Settle { payout_id, .. } => Some(IdempotencyKey::settlement_of(*payout_id)),
        }
    }

    /// Whether the replay marker must be kept for the life of the row.
    /// Only request-supplied reservation keys may age out.
    #[must_use]
    pub fn has_permanent_key(&self) -> bool {
        !matches!(self, Self::Reserve { .. })
    }

    /// Short operation name for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Credit { .. } => "credit",
            Self::Reserve { .. } => "reserve",
            Self::Release { .. } => "release",
            Self::Settle { .. } => "settle",
        }
    }
}
