//! Recipient directory entries.
//!
//! The directory is a pre-fill cache: it remembers the last wallet an email
//! claimed to, so the claim page can suggest it. It is never authoritative.
//! Every claim still supplies an explicit wallet.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recipient {
    /// Normalized email, the directory key.
    pub email: String,
    /// Wallet used by the most recent claim.
    pub wallet_address: String,
    pub payouts_claimed: u64,
    pub total_claimed: Decimal,
    pub first_seen: DateTime<Utc>,
    pub last_claimed_at: DateTime<Utc>,
}

impl Recipient {
    /// First sighting of `email`, claiming `amount` to `wallet`.
    #[must_use]
    pub fn first_claim(
        email: impl Into<String>,
        wallet: impl Into<String>,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            email: email.into(),
            wallet_address: wallet.into(),
            payouts_claimed: 1,
            total_claimed: amount,
            first_seen: at,
            last_claimed_at: at,
        }
    }

    /// Fold another claim into the running stats.
    pub fn record_claim(&mut self, wallet: impl Into<String>, amount: Decimal, at: DateTime<Utc>) {
        self.wallet_address = wallet.into();
        self.payouts_claimed += 1;
        self.total_claimed += amount;
        self.last_claimed_at = at;
    }
}
