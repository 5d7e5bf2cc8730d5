//! Payout batches.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{BatchId, MerchantId, Metadata};

/// Batch status. A batch is `Created` once all its payouts exist; it has no
/// state machine beyond that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Created,
}

/// A group of payouts created as one unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PayoutBatch {
    pub id: BatchId,
    pub merchant_id: MerchantId,
    /// Sum of member payout amounts, fees excluded.
    pub total_amount: Decimal,
    /// Sum of member payout fees.
    pub total_fees: Decimal,
    pub count: usize,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
}

/// One item of a batch request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchItem {
    pub email: String,
    pub amount: Decimal,
    pub memo: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl BatchItem {
    #[must_use]
    pub fn new(email: impl Into<String>, amount: Decimal) -> Self {
        Self {
            email: email.into(),
            amount,
            ..Self::default()
        }
    }
}
