//! # Payout - one escrowed payment to an email recipient
//!
//! ## State Machine
//!
//! ```text
//!   PENDING ──▶ FUNDED ──▶ SENT ──claim──▶ CLAIMED
//!      │           │         │
//!      │           │         ├──timeout──▶ EXPIRED
//!      ▼           ▼         ▼
//!   ─────────── FAILED ◀──────  (unrecoverable settlement error)
//! ```
//!
//! `CLAIMED`, `EXPIRED` and `FAILED` are terminal. Payouts created by the
//! engine start in `SENT`: their funds are already reserved, so the claim
//! link is usable immediately.
//!
//! While a claim is talking to the settlement executor the payout carries a
//! claim attempt (`claim_attempt`) and a lease (`claim_lease_until`). The
//! attempt is taken by a compare-and-swap on the `SENT` row, which is what
//! makes concurrent claims and expiry mutually exclusive. Nothing but the
//! attempt itself clears it: a lapsed lease only marks the attempt as
//! stale, and a stale attempt is resolved by asking the settlement executor
//! whether its transfer landed (`MarkClaimed`) or not (`AbortClaim`).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{BatchId, ClaimToken, IdempotencyKey, MerchantId, PayoutId, TreasuryError};

/// Open string-to-string bag for merchant-supplied fields.
pub type Metadata = BTreeMap<String, String>;

/// Lifecycle state of a payout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayoutStatus {
    Pending,
    Funded,
    /// Funds reserved, claim link live. The escrow state.
    Sent,
    Claimed,
    Expired,
    Failed,
}

impl PayoutStatus {
    /// Can a payout move from this state to `target`?
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Pending, Self::Funded)
                | (Self::Funded, Self::Sent)
                | (Self::Sent, Self::Claimed | Self::Expired)
                | (Self::Pending | Self::Funded | Self::Sent, Self::Failed)
        )
    }

    /// `CLAIMED`, `EXPIRED` and `FAILED` never change again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Claimed | Self::Expired | Self::Failed)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Funded => "funded",
            Self::Sent => "sent",
            Self::Claimed => "claimed",
            Self::Expired => "expired",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a merchant asks for when creating a payout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PayoutRequest {
    pub email: String,
    pub amount: Decimal,
    /// Defaults to the settlement currency; any other value is rejected.
    pub currency: Option<String>,
    pub memo: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    /// Replay token for the reservation. Defaults to the new payout's id.
    pub idempotency_key: Option<IdempotencyKey>,
}

impl PayoutRequest {
    #[must_use]
    pub fn new(email: impl Into<String>, amount: Decimal) -> Self {
        Self {
            email: email.into(),
            amount,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    #[must_use]
    pub fn with_idempotency_key(mut self, key: IdempotencyKey) -> Self {
        self.idempotency_key = Some(key);
        self
    }
}

/// A payout held in escrow for a recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payout {
    pub id: PayoutId,
    pub merchant_id: MerchantId,
    /// Normalized (trimmed, lower-case) recipient email.
    pub email: String,
    /// Principal delivered to the recipient.
    pub amount: Decimal,
    /// Platform fee reserved alongside the principal.
    pub fee: Decimal,
    pub currency: String,
    pub memo: Option<String>,
    pub metadata: Metadata,
    pub status: PayoutStatus,
    pub claim_token: ClaimToken,
    pub claim_url: String,
    /// Destination wallet, set when a claim begins.
    pub recipient_wallet: Option<String>,
    /// Settlement transaction reference, set on claim.
    pub tx_signature: Option<String>,
    /// Batch this payout belongs to, if it was created as part of one.
    pub batch_id: Option<BatchId>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    /// Set when the payout moved to `FAILED`.
    pub failure_reason: Option<String>,
    /// Deadline of the running claim attempt. Once it passes, the attempt
    /// is stale and gets reconciled against the executor.
    pub claim_lease_until: Option<DateTime<Utc>>,
    /// The claim attempt that owns this payout. While set, neither expiry
    /// nor another claim can take the payout over.
    pub claim_attempt: Option<Uuid>,
}

/// A status change applied to a single payout row under compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayoutChange {
    /// `SENT` → in flight. Fails while any attempt owns the payout.
    BeginClaim {
        attempt: Uuid,
        wallet: String,
        at: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    },
    /// In flight → `SENT`, after a retryable settlement failure.
    AbortClaim { attempt: Uuid },
    /// In flight → `CLAIMED`.
    MarkClaimed {
        attempt: Uuid,
        wallet: String,
        tx_signature: String,
        at: DateTime<Utc>,
    },
    /// `SENT` → `EXPIRED`. Only once overdue and with no claim attempt.
    MarkExpired { at: DateTime<Utc> },
    /// Any non-terminal state → `FAILED`.
    MarkFailed { reason: String },
}

impl Payout {
    /// Total held in the merchant's `reserved` bucket for this payout.
    #[must_use]
    pub fn hold(&self) -> Decimal {
        self.amount + self.fee
    }

    /// Past the expiry horizon (regardless of status).
    #[must_use]
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// A claim attempt owns the payout, live or stale.
    #[must_use]
    pub fn has_claim_attempt(&self) -> bool {
        self.claim_attempt.is_some()
    }

    /// A claim attempt owns the payout and its lease has not run out.
    #[must_use]
    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        self.claim_lease_until.is_some_and(|until| until > now)
    }

    /// A claim attempt owns the payout but its lease ran out: the claim
    /// crashed or the executor is slow. Must be reconciled before anything
    /// else can happen to the payout.
    #[must_use]
    pub fn has_stale_claim(&self, now: DateTime<Utc>) -> bool {
        self.status == PayoutStatus::Sent && self.has_claim_attempt() && !self.has_live_lease(now)
    }

    /// Claimable right now.
    #[must_use]
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == PayoutStatus::Sent && !self.is_overdue(now) && !self.has_claim_attempt()
    }

    /// The state-conflict error a claim on this payout should see.
    #[must_use]
    pub fn claim_conflict(&self, now: DateTime<Utc>) -> TreasuryError {
        match self.status {
            PayoutStatus::Claimed => TreasuryError::AlreadyClaimed(self.id),
            PayoutStatus::Expired => TreasuryError::PayoutExpired(self.id),
            PayoutStatus::Sent if self.has_claim_attempt() => TreasuryError::ClaimInProgress(self.id),
            PayoutStatus::Sent if self.is_overdue(now) => TreasuryError::PayoutExpired(self.id),
            status => TreasuryError::PayoutNotClaimable {
                id: self.id,
                status,
            },
        }
    }

    /// Apply `change` if its precondition holds; otherwise leave the payout
    /// untouched and return the conflict.
    ///
    /// # Errors
    /// - `AlreadyClaimed` / `PayoutExpired` / `ClaimInProgress` /
    ///   `PayoutNotClaimable` when a claim cannot begin
    /// - `InvalidTransition` for any other illegal change
    pub fn apply_change(&mut self, change: &PayoutChange) -> crate::Result<()> {
        match change {
            PayoutChange::BeginClaim {
                attempt,
                wallet,
                at,
                lease_until,
            } => {
                if !self.is_claimable(*at) {
                    return Err(self.claim_conflict(*at));
                }
                self.claim_lease_until = Some(*lease_until);
                self.claim_attempt = Some(*attempt);
                self.recipient_wallet = Some(wallet.clone());
            }
            PayoutChange::AbortClaim { attempt } => {
                self.require_in_flight(*attempt, "abort claim")?;
                self.claim_lease_until = None;
                self.claim_attempt = None;
                self.recipient_wallet = None;
            }
            PayoutChange::MarkClaimed {
                attempt,
                wallet,
                tx_signature,
                at,
            } => {
                self.require_in_flight(*attempt, "mark claimed")?;
                self.status = PayoutStatus::Claimed;
                self.recipient_wallet = Some(wallet.clone());
                self.tx_signature = Some(tx_signature.clone());
                self.claimed_at = Some(*at);
                self.claim_lease_until = None;
                self.claim_attempt = None;
            }
            PayoutChange::MarkExpired { at } => {
                if !self.status.can_transition_to(PayoutStatus::Expired) {
                    return Err(self.invalid("EXPIRED"));
                }
                if !self.is_overdue(*at) {
                    return Err(TreasuryError::InvalidTransition {
                        id: self.id,
                        reason: format!("not overdue until {}", self.expires_at),
                    });
                }
                if self.has_claim_attempt() {
                    return Err(TreasuryError::ClaimInProgress(self.id));
                }
                self.status = PayoutStatus::Expired;
                self.expired_at = Some(*at);
            }
            PayoutChange::MarkFailed { reason } => {
                if !self.status.can_transition_to(PayoutStatus::Failed) {
                    return Err(self.invalid("FAILED"));
                }
                self.status = PayoutStatus::Failed;
                self.failure_reason = Some(reason.clone());
                self.claim_lease_until = None;
                self.claim_attempt = None;
            }
        }
        Ok(())
    }

    fn require_in_flight(&self, attempt: Uuid, what: &str) -> crate::Result<()> {
        if self.status != PayoutStatus::Sent || self.claim_attempt != Some(attempt) {
            return Err(TreasuryError::InvalidTransition {
                id: self.id,
                reason: format!(
                    "cannot {what}: status {} and claim lease held by another attempt",
                    self.status
                ),
            });
        }
        Ok(())
    }

    fn invalid(&self, target: &str) -> TreasuryError {
        TreasuryError::InvalidTransition {
            id: self.id,
            reason: format!("{} → {target}", self.status),
        }
    }
}

/// Dummy payout for testing. **Never use in production.**
#[cfg(any(test, feature = "test-helpers"))]
impl Payout {
    /// A `SENT` payout of `amount` with zero fee, expiring in a day.
    pub fn dummy(merchant_id: MerchantId, amount: Decimal) -> Self {
        let now = Utc::now();
        let claim_token = ClaimToken::generate();
        Self {
            id: PayoutId::new(),
            merchant_id,
            email: "recipient@example.com".to_string(),
            amount,
            fee: Decimal::ZERO,
            currency: crate::constants::SETTLEMENT_CURRENCY.to_string(),
            memo: None,
            metadata: Metadata::new(),
            status: PayoutStatus::Sent,
            claim_url: format!("https://example.com/claim/{}", claim_token.as_str()),
            claim_token,
            recipient_wallet: None,
            tx_signature: None,
            batch_id: None,
            created_at: now,
            expires_at: now + chrono::Duration::days(1),
            claimed_at: None,
            expired_at: None,
            failure_reason: None,
            claim_lease_until: None,
            claim_attempt: None,
        }
    }
}
