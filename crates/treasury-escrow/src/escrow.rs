//! # Payout Escrow
//!
//! Owns the lifecycle of single payouts: claim-token issuance, passive
//! expiry, and the claim itself.
//!
//! ## Claim protocol
//!
//! ```text
//! validate wallet ──▶ fetch by token (passive expiry)
//!        │
//!        ▼
//! BeginClaim CAS on the SENT row ── lost ──▶ AlreadyClaimed / Expired / ClaimInProgress
//!        │ won (lease held)
//!        ▼
//! executor: ensure_destination + transfer
//!        ├── ok ─────────────▶ MarkClaimed ──▶ settle ──▶ recipient upsert, payout.claimed
//!        ├── retryable ──────▶ AbortClaim (payout stays SENT, reservation untouched)
//!        └── unrecoverable ──▶ MarkFailed ──▶ release, payout.failed
//! ```
//!
//! Expiry, passive or swept, is a `MarkExpired` CAS on the same row. It
//! refuses while any claim attempt owns the payout, so whichever of claim
//! and expiry wins the CAS is authoritative and the reservation is released
//! or settled exactly once.
//!
//! ## Stale claims
//!
//! A claim whose lease ran out (crashed process, slow rail) still owns the
//! payout. The next reader asks the executor about the payout's transfer:
//!
//! ```text
//! Landed   ──▶ finish the claim on behalf of the stale attempt
//! NotSent  ──▶ AbortClaim, payout is SENT again (and may now expire)
//! InFlight ──▶ leave it alone
//! ```

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use treasury_ledger::{BalanceStore, PayoutQuery, TransactionQuery, TreasuryStore};
use treasury_types::{
    BatchId, ClaimToken, EngineConfig, EventSink, IdempotencyKey, Metadata, MerchantId, Payout,
    PayoutBatch, PayoutChange, PayoutClaimed, PayoutCreated, PayoutExpired, PayoutFailed,
    PayoutId, PayoutRequest, PayoutStatus, Result, TransactionKind, TreasuryError, TreasuryEvent,
};
use uuid::Uuid;

use crate::{
    clock::Clock,
    executor::{
        ExecutorError, SettlementExecutor, TransferRequest, TransferStatus, synthetic_reference,
    },
    validation,
};

/// A validated, fee-quoted payout that has not been persisted yet.
#[derive(Debug, Clone)]
pub struct PayoutDraft {
    pub id: PayoutId,
    pub email: String,
    pub amount: Decimal,
    pub fee: Decimal,
    pub currency: String,
    pub memo: Option<String>,
    pub metadata: Metadata,
}

impl PayoutDraft {
    #[must_use]
    pub fn hold(&self) -> Decimal {
        self.amount + self.fee
    }
}

/// What the claim page may show. Carries neither the merchant nor the token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicPayout {
    pub email: String,
    pub amount: Decimal,
    pub currency: String,
    pub memo: Option<String>,
    pub status: PayoutStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    /// Wallet this email claimed to last time, for pre-filling.
    pub suggested_wallet: Option<String>,
}

/// Result of a successful claim.
#[derive(Debug, Clone)]
pub struct ClaimOutcome {
    pub payout: Payout,
    pub tx_signature: String,
    /// The reference is synthetic; no funds moved.
    pub simulated: bool,
}

#[derive(Clone)]
pub struct PayoutEscrow {
    pub(crate) store: Arc<dyn TreasuryStore>,
    pub(crate) balances: BalanceStore,
    executor: Arc<dyn SettlementExecutor>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: Arc<EngineConfig>,
}

impl PayoutEscrow {
    pub fn new(
        store: Arc<dyn TreasuryStore>,
        balances: BalanceStore,
        executor: Arc<dyn SettlementExecutor>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            balances,
            executor,
            events,
            clock,
            config,
        }
    }

    // =================================================================
    // Creation
    // =================================================================

    /// Validate and fee-quote one payout. No side effects.
    pub fn draft(
        &self,
        email: &str,
        amount: Decimal,
        currency: Option<&str>,
        memo: Option<String>,
        metadata: Metadata,
    ) -> Result<PayoutDraft> {
        let email = validation::normalize_email(email)?;
        validation::validate_payout_amount(amount, &self.config.limits)?;
        let currency = validation::validate_currency(currency)?;
        Ok(PayoutDraft {
            id: PayoutId::new(),
            email,
            amount,
            fee: self.balances.calculate_fee(amount),
            currency,
            memo,
            metadata,
        })
    }

    /// Reserve funds and issue one payout in `SENT`.
    ///
    /// With an idempotency key, a repeated request returns the payout the
    /// first request created instead of reserving again.
    ///
    /// # Errors
    /// Validation errors, or `InsufficientBalance` with nothing persisted.
    pub async fn create_payout(&self, merchant_id: MerchantId, request: PayoutRequest) -> Result<Payout> {
        let draft = self.draft(
            &request.email,
            request.amount,
            request.currency.as_deref(),
            request.memo,
            request.metadata,
        )?;
        let now = self.clock.now();
        let key = request
            .idempotency_key
            .unwrap_or_else(|| IdempotencyKey::new(format!("payout:{}", draft.id)));

        let reservation = self
            .balances
            .reserve(merchant_id, draft.amount, draft.fee, key.clone(), Some(draft.id), now)
            .await?;
        if reservation.replayed {
            return self.payout_reserved_under(merchant_id, &key).await;
        }

        let mut created = match self.issue(merchant_id, None, vec![draft.clone()], now).await {
            Ok(created) => created,
            Err(e) => {
                error!(%merchant_id, payout_id = %draft.id, error = %e, "Payout persist failed, releasing reservation");
                self.release_quietly(merchant_id, draft.amount, draft.fee, draft.id, now)
                    .await;
                return Err(e);
            }
        };
        created.pop().ok_or_else(|| TreasuryError::Internal("payout not issued".into()))
    }

    /// Persist already-reserved drafts as `SENT` payouts (and their batch),
    /// then announce each one. Funds must already be reserved.
    pub(crate) async fn issue(
        &self,
        merchant_id: MerchantId,
        batch: Option<PayoutBatch>,
        drafts: Vec<PayoutDraft>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Payout>> {
        let batch_id = batch.as_ref().map(|b| b.id);
        let payouts: Vec<Payout> = drafts
            .into_iter()
            .map(|d| self.build_payout(merchant_id, d, batch_id, now))
            .collect();
        self.store.insert_payouts(batch, payouts.clone()).await?;

        for payout in &payouts {
            info!(
                %merchant_id,
                payout_id = %payout.id,
                amount = %payout.amount,
                fee = %payout.fee,
                expires_at = %payout.expires_at,
                "Payout created"
            );
            self.events.publish(
                merchant_id,
                TreasuryEvent::PayoutCreated(PayoutCreated {
                    payout_id: payout.id,
                    email: payout.email.clone(),
                    amount: payout.amount,
                    fee: payout.fee,
                    currency: payout.currency.clone(),
                    claim_url: payout.claim_url.clone(),
                    expires_at: payout.expires_at,
                    batch_id: payout.batch_id,
                }),
            );
        }
        Ok(payouts)
    }

    fn build_payout(
        &self,
        merchant_id: MerchantId,
        draft: PayoutDraft,
        batch_id: Option<BatchId>,
        now: DateTime<Utc>,
    ) -> Payout {
        let claim_token = ClaimToken::generate();
        let claim_url = format!(
            "{}/claim/{}",
            self.config.escrow.claim_base_url.trim_end_matches('/'),
            claim_token.as_str()
        );
        Payout {
            id: draft.id,
            merchant_id,
            email: draft.email,
            amount: draft.amount,
            fee: draft.fee,
            currency: draft.currency,
            memo: draft.memo,
            metadata: draft.metadata,
            status: PayoutStatus::Sent,
            claim_token,
            claim_url,
            recipient_wallet: None,
            tx_signature: None,
            batch_id,
            created_at: now,
            expires_at: now + Duration::hours(self.config.escrow.expiry_hours),
            claimed_at: None,
            expired_at: None,
            failure_reason: None,
            claim_lease_until: None,
            claim_attempt: None,
        }
    }

    async fn payout_reserved_under(&self, merchant_id: MerchantId, key: &IdempotencyKey) -> Result<Payout> {
        let query = TransactionQuery {
            kind: Some(TransactionKind::PayoutReserved),
            ..TransactionQuery::default()
        };
        let original = self
            .balances
            .transactions(merchant_id, &query)
            .await?
            .into_iter()
            .find(|tx| tx.idempotency_key.as_ref() == Some(key))
            .and_then(|tx| tx.payout_id);
        let payout = match original {
            Some(id) => self.store.payout(id).await?,
            None => None,
        };
        debug!(%merchant_id, %key, found = payout.is_some(), "Payout request replayed");
        payout.ok_or_else(|| TreasuryError::InvalidRequest {
            reason: format!("idempotency key '{key}' was already used"),
        })
    }

    // =================================================================
    // Reads and expiry
    // =================================================================

    pub async fn payout(&self, id: PayoutId) -> Result<Payout> {
        let payout = self.store.payout(id).await?.ok_or(TreasuryError::PayoutNotFound)?;
        self.observe(payout).await
    }

    pub async fn payouts(&self, merchant_id: MerchantId, query: &PayoutQuery) -> Result<Vec<Payout>> {
        self.store.payouts_by_merchant(merchant_id, query).await
    }

    pub async fn batch(&self, id: BatchId) -> Result<Option<PayoutBatch>> {
        self.store.batch(id).await
    }

    /// Look up a payout by claim token, promoting it to `EXPIRED` first if
    /// it is overdue.
    pub async fn fetch_by_token(&self, token: &ClaimToken) -> Result<Payout> {
        let payout = self
            .store
            .payout_by_token(token)
            .await?
            .ok_or(TreasuryError::PayoutNotFound)?;
        self.observe(payout).await
    }

    /// Public claim-page view of the payout behind `token`.
    pub async fn public_view(&self, token: &ClaimToken) -> Result<PublicPayout> {
        let payout = self.fetch_by_token(token).await?;
        let suggested_wallet = match self.store.recipient(&payout.email).await {
            Ok(recipient) => recipient.map(|r| r.wallet_address),
            Err(e) => {
                warn!(error = %e, "Recipient lookup failed");
                None
            }
        };
        Ok(PublicPayout {
            email: payout.email,
            amount: payout.amount,
            currency: payout.currency,
            memo: payout.memo,
            status: payout.status,
            created_at: payout.created_at,
            expires_at: payout.expires_at,
            claimed_at: payout.claimed_at,
            suggested_wallet,
        })
    }

    /// Return `payout` as it should be observed now: stale claims
    /// reconciled, then expired if overdue.
    async fn observe(&self, payout: Payout) -> Result<Payout> {
        let now = self.clock.now();
        let payout = if payout.has_stale_claim(now) {
            self.reconcile_stale_claim(payout).await?
        } else {
            payout
        };
        if payout.status != PayoutStatus::Sent
            || payout.has_claim_attempt()
            || !payout.is_overdue(now)
        {
            return Ok(payout);
        }
        match self.try_expire(&payout, now).await? {
            Some(expired) => Ok(expired),
            None => self.store.payout(payout.id).await?.ok_or(TreasuryError::PayoutNotFound),
        }
    }

    /// Attempt the `SENT → EXPIRED` CAS. Only the winner releases the
    /// reservation. Returns the expired payout if this call won.
    async fn try_expire(&self, payout: &Payout, now: DateTime<Utc>) -> Result<Option<Payout>> {
        let expired = match self
            .store
            .update_payout(payout.id, &PayoutChange::MarkExpired { at: now })
            .await
        {
            Ok(expired) => expired,
            Err(TreasuryError::ClaimInProgress(_) | TreasuryError::InvalidTransition { .. }) => {
                debug!(payout_id = %payout.id, "Expiry lost to a concurrent transition");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        self.release_quietly(expired.merchant_id, expired.amount, expired.fee, expired.id, now)
            .await;
        info!(
            merchant_id = %expired.merchant_id,
            payout_id = %expired.id,
            amount = %expired.amount,
            "Payout expired, reservation released"
        );
        self.events.publish(
            expired.merchant_id,
            TreasuryEvent::PayoutExpired(PayoutExpired {
                payout_id: expired.id,
                amount: expired.amount,
                fee: expired.fee,
                expired_at: now,
            }),
        );
        Ok(Some(expired))
    }

    /// Expire up to `limit` overdue payouts. Returns how many this call
    /// expired. Overdue payouts held by a stale claim are reconciled first.
    pub async fn sweep_expired(&self, limit: usize) -> Result<usize> {
        let now = self.clock.now();
        let mut expired = 0;
        for payout in self.store.overdue_payouts(now, limit).await? {
            let payout = if payout.has_stale_claim(now) {
                self.reconcile_stale_claim(payout).await?
            } else {
                payout
            };
            if payout.status != PayoutStatus::Sent || payout.has_claim_attempt() {
                continue;
            }
            if self.try_expire(&payout, now).await?.is_some() {
                expired += 1;
            }
        }
        if expired > 0 {
            info!(expired, "Expiry sweep complete");
        }
        Ok(expired)
    }

    /// Settle the fate of a claim attempt whose lease ran out, using what
    /// the executor knows about the payout's transfer. Returns the payout
    /// as it stands afterwards.
    async fn reconcile_stale_claim(&self, payout: Payout) -> Result<Payout> {
        let Some(attempt) = payout.claim_attempt else {
            return Ok(payout);
        };
        let status = match self.executor.transfer_status(payout.id).await {
            Ok(status) => status,
            Err(e) => {
                warn!(payout_id = %payout.id, error = %e, "Stale claim lookup failed, leaving claim in place");
                return Ok(payout);
            }
        };
        match status {
            TransferStatus::InFlight => {
                debug!(payout_id = %payout.id, "Stale claim still in flight");
                Ok(payout)
            }
            TransferStatus::Landed(receipt) => {
                let Some(wallet) = payout.recipient_wallet.clone() else {
                    error!(
                        payout_id = %payout.id,
                        tx_signature = %receipt.signature,
                        "CRITICAL: transfer landed for a claim with no recorded wallet"
                    );
                    return Ok(payout);
                };
                warn!(payout_id = %payout.id, tx_signature = %receipt.signature, "Completing stale claim whose transfer landed");
                let outcome = self
                    .complete_claim(payout, attempt, wallet, receipt.signature, false)
                    .await?;
                Ok(outcome.payout)
            }
            TransferStatus::NotSent => {
                match self
                    .store
                    .update_payout(payout.id, &PayoutChange::AbortClaim { attempt })
                    .await
                {
                    Ok(reopened) => {
                        warn!(payout_id = %payout.id, "Stale claim never transferred, payout reopened");
                        Ok(reopened)
                    }
                    Err(TreasuryError::InvalidTransition { .. }) => self.reload(payout.id).await,
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn reload(&self, id: PayoutId) -> Result<Payout> {
        self.store.payout(id).await?.ok_or(TreasuryError::PayoutNotFound)
    }

    // =================================================================
    // Claim
    // =================================================================

    /// Claim the payout behind `token` into `wallet`.
    ///
    /// # Errors
    /// - `InvalidWallet` for a malformed address
    /// - `PayoutNotFound`, `AlreadyClaimed`, `PayoutExpired`,
    ///   `ClaimInProgress`, `PayoutNotClaimable` for state conflicts
    /// - `SettlementFailed` when the executor failed but may succeed later;
    ///   the payout stays claimable
    /// - `SettlementAborted` when the payout can never settle; it is now
    ///   `FAILED` and its funds are back in `available`
    pub async fn claim(&self, token: &ClaimToken, wallet: &str) -> Result<ClaimOutcome> {
        let wallet = validation::validate_wallet(wallet)?;
        let payout = self.fetch_by_token(token).await?;

        let now = self.clock.now();
        let attempt = Uuid::now_v7();
        let lease_until = now + Duration::seconds(self.config.escrow.claim_lease_secs);
        let payout = self
            .store
            .update_payout(
                payout.id,
                &PayoutChange::BeginClaim {
                    attempt,
                    wallet: wallet.clone(),
                    at: now,
                    lease_until,
                },
            )
            .await
            .inspect_err(|e| debug!(payout_id = %payout.id, error = %e, "Claim refused"))?;
        info!(payout_id = %payout.id, %wallet, "Claim started");

        let (tx_signature, simulated) = match self.transfer(&payout, &wallet).await {
            Ok(signature) => (signature, false),
            Err(e) if e.is_retryable() && self.config.allows_simulated_settlement() => {
                warn!(
                    payout_id = %payout.id,
                    error = %e,
                    "Settlement failed, substituting a synthetic reference (non-production)"
                );
                (synthetic_reference(), true)
            }
            Err(e) if e.is_retryable() => return Err(self.abort_claim(&payout, attempt, &e).await),
            Err(e) => return Err(self.fail_payout(&payout, &e).await),
        };

        self.complete_claim(payout, attempt, wallet, tx_signature, simulated)
            .await
    }

    async fn transfer(&self, payout: &Payout, wallet: &str) -> std::result::Result<String, ExecutorError> {
        if self.executor.ensure_destination(wallet).await? {
            debug!(payout_id = %payout.id, %wallet, "Created destination account");
        }
        let receipt = self
            .executor
            .transfer(&TransferRequest {
                payout_id: payout.id,
                destination: wallet.to_string(),
                amount: payout.amount,
                currency: payout.currency.clone(),
            })
            .await?;
        Ok(receipt.signature)
    }

    async fn complete_claim(
        &self,
        payout: Payout,
        attempt: Uuid,
        wallet: String,
        tx_signature: String,
        simulated: bool,
    ) -> Result<ClaimOutcome> {
        let now = self.clock.now();

        // The transfer has happened. The attempt still owns the payout, so
        // nothing else can have released the reservation.
        let claimed = match self
            .store
            .update_payout(
                payout.id,
                &PayoutChange::MarkClaimed {
                    attempt,
                    wallet: wallet.clone(),
                    tx_signature: tx_signature.clone(),
                    at: now,
                },
            )
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                // A reader may have finished this claim for us after the
                // lease ran out.
                let current = self.reload(payout.id).await?;
                if current.status == PayoutStatus::Claimed {
                    debug!(payout_id = %payout.id, "Claim was completed by stale-claim recovery");
                    let tx_signature = current.tx_signature.clone().unwrap_or(tx_signature);
                    return Ok(ClaimOutcome {
                        payout: current,
                        tx_signature,
                        simulated,
                    });
                }
                error!(
                    payout_id = %payout.id,
                    %tx_signature,
                    status = %current.status,
                    error = %e,
                    "CRITICAL: transfer executed but payout could not be marked claimed"
                );
                return Err(e);
            }
        };

        if let Err(e) = self
            .balances
            .settle(claimed.merchant_id, claimed.amount, claimed.fee, claimed.id, Some(&tx_signature), now)
            .await
        {
            error!(
                merchant_id = %claimed.merchant_id,
                payout_id = %claimed.id,
                %tx_signature,
                error = %e,
                "CRITICAL: transfer executed but ledger settle failed"
            );
        }

        if let Err(e) = self
            .store
            .upsert_recipient(&claimed.email, &wallet, claimed.amount, now)
            .await
        {
            warn!(payout_id = %claimed.id, error = %e, "Recipient directory update failed");
        }

        info!(
            merchant_id = %claimed.merchant_id,
            payout_id = %claimed.id,
            amount = %claimed.amount,
            %tx_signature,
            simulated,
            "Payout claimed"
        );
        self.events.publish(
            claimed.merchant_id,
            TreasuryEvent::PayoutClaimed(PayoutClaimed {
                payout_id: claimed.id,
                amount: claimed.amount,
                fee: claimed.fee,
                currency: claimed.currency.clone(),
                recipient_wallet: wallet,
                tx_signature: tx_signature.clone(),
                claimed_at: now,
            }),
        );

        Ok(ClaimOutcome {
            payout: claimed,
            tx_signature,
            simulated,
        })
    }

    /// Give the lease back after a retryable failure.
    async fn abort_claim(&self, payout: &Payout, attempt: Uuid, cause: &ExecutorError) -> TreasuryError {
        warn!(payout_id = %payout.id, error = %cause, "Settlement failed, payout stays claimable");
        if let Err(e) = self
            .store
            .update_payout(payout.id, &PayoutChange::AbortClaim { attempt })
            .await
        {
            warn!(payout_id = %payout.id, error = %e, "Could not drop claim lease, it will time out");
        }
        TreasuryError::SettlementFailed {
            reason: cause.to_string(),
        }
    }

    /// Move the payout to `FAILED` and return its funds to the merchant.
    async fn fail_payout(&self, payout: &Payout, cause: &ExecutorError) -> TreasuryError {
        let reason = cause.to_string();
        error!(payout_id = %payout.id, %reason, "Settlement failed permanently");
        match self
            .store
            .update_payout(payout.id, &PayoutChange::MarkFailed { reason: reason.clone() })
            .await
        {
            Ok(_) => {
                let now = self.clock.now();
                self.release_quietly(payout.merchant_id, payout.amount, payout.fee, payout.id, now)
                    .await;
                self.events.publish(
                    payout.merchant_id,
                    TreasuryEvent::PayoutFailed(PayoutFailed {
                        payout_id: payout.id,
                        amount: payout.amount,
                        reason: reason.clone(),
                    }),
                );
            }
            Err(e) => error!(payout_id = %payout.id, error = %e, "Could not mark payout failed"),
        }
        TreasuryError::SettlementAborted { reason }
    }

    /// Release a payout's reservation, logging instead of failing. Release
    /// is keyed by payout id, so repeating it is harmless.
    pub(crate) async fn release_quietly(
        &self,
        merchant_id: MerchantId,
        amount: Decimal,
        fee: Decimal,
        payout_id: PayoutId,
        now: DateTime<Utc>,
    ) {
        if let Err(e) = self.balances.release(merchant_id, amount, fee, payout_id, now).await {
            error!(
                %merchant_id,
                %payout_id,
                %amount,
                %fee,
                error = %e,
                "CRITICAL: reservation release failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use treasury_ledger::{BasisPointsFeeCalculator, MemoryStore};
    use treasury_types::{EventType, RecordingSink};

    use super::*;
    use crate::{clock::ManualClock, executor::MockExecutor};

    struct Fixture {
        escrow: PayoutEscrow,
        clock: Arc<ManualClock>,
        executor: Arc<MockExecutor>,
        events: Arc<RecordingSink>,
        merchant: MerchantId,
    }

    fn d(units: i64) -> Decimal {
        Decimal::new(units, 2)
    }

    fn wallet(n: u8) -> String {
        bs58::encode([n; 32]).into_string()
    }

    async fn fixture(config: EngineConfig) -> Fixture {
        let store: Arc<dyn TreasuryStore> = Arc::new(MemoryStore::new());
        let balances = BalanceStore::new(store.clone(), Arc::new(BasisPointsFeeCalculator::from(&config.fee)));
        let clock = Arc::new(ManualClock::default());
        let executor = Arc::new(MockExecutor::new());
        let events = Arc::new(RecordingSink::new());
        let merchant = MerchantId::new();
        balances.credit(merchant, d(10_000), "Initial funding", clock.now()).await.unwrap();
        let escrow = PayoutEscrow::new(
            store,
            balances,
            executor.clone(),
            events.clone(),
            clock.clone(),
            Arc::new(config),
        );
        Fixture {
            escrow,
            clock,
            executor,
            events,
            merchant,
        }
    }

    fn production() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.webhook.default_secret = "whsec".into();
        config
    }

    #[tokio::test]
    async fn create_reserves_and_announces() {
        let f = fixture(production()).await;
        let payout = f
            .escrow
            .create_payout(f.merchant, PayoutRequest::new("A@X.com", d(4000)))
            .await
            .unwrap();
        assert_eq!(payout.status, PayoutStatus::Sent);
        assert_eq!(payout.email, "a@x.com");
        assert_eq!(payout.fee, d(100));
        assert!(payout.claim_url.ends_with(payout.claim_token.as_str()));
        assert_eq!(payout.expires_at - payout.created_at, Duration::days(7));

        let bal = f.escrow.balances.balance(f.merchant).await.unwrap();
        assert_eq!(bal.available, d(5900));
        assert_eq!(bal.reserved, d(4100));
        assert_eq!(f.events.count(EventType::PayoutCreated), 1);
    }

    #[tokio::test]
    async fn insufficient_balance_persists_nothing() {
        let f = fixture(production()).await;
        let err = f
            .escrow
            .create_payout(f.merchant, PayoutRequest::new("a@x.com", d(10_000)))
            .await
            .unwrap_err();
        assert!(matches!(err, TreasuryError::InsufficientBalance { .. }));
        assert_eq!(err.http_status(), 402);
        let listed = f.escrow.payouts(f.merchant, &PayoutQuery::default()).await.unwrap();
        assert!(listed.is_empty());
        assert_eq!(f.events.count(EventType::PayoutCreated), 0);
    }

    #[tokio::test]
    async fn idempotent_create_returns_original() {
        let f = fixture(production()).await;
        let key = IdempotencyKey::new("order-17");
        let request = PayoutRequest::new("a@x.com", d(1000)).with_idempotency_key(key);
        let first = f.escrow.create_payout(f.merchant, request.clone()).await.unwrap();
        let second = f.escrow.create_payout(f.merchant, request).await.unwrap();
        assert_eq!(first.id, second.id);
        let bal = f.escrow.balances.balance(f.merchant).await.unwrap();
        assert_eq!(bal.reserved, d(1100));
    }

    #[tokio::test]
    async fn claim_settles_and_records_recipient() {
        let f = fixture(production()).await;
        let payout = f
            .escrow
            .create_payout(f.merchant, PayoutRequest::new("a@x.com", d(4000)))
            .await
            .unwrap();
        let out = f.escrow.claim(&payout.claim_token, &wallet(1)).await.unwrap();
        assert_eq!(out.payout.status, PayoutStatus::Claimed);
        assert!(!out.simulated);
        assert_eq!(f.executor.transfer_count(), 1);
        assert_eq!(f.executor.destination_count(), 1);

        let bal = f.escrow.balances.balance(f.merchant).await.unwrap();
        assert_eq!(bal.reserved, Decimal::ZERO);
        assert_eq!(bal.total_payouts, d(4000));
        assert_eq!(bal.total_fees, d(100));

        let view = f.escrow.public_view(&payout.claim_token).await.unwrap();
        assert_eq!(view.status, PayoutStatus::Claimed);
        assert_eq!(view.suggested_wallet, Some(wallet(1)));
        assert_eq!(f.events.count(EventType::PayoutClaimed), 1);

        let again = f.escrow.claim(&payout.claim_token, &wallet(1)).await.unwrap_err();
        assert!(matches!(again, TreasuryError::AlreadyClaimed(_)));
    }

    #[tokio::test]
    async fn malformed_wallet_rejected_before_lookup() {
        let f = fixture(production()).await;
        let err = f
            .escrow
            .claim(&ClaimToken::from_string("unknown"), "not-a-wallet")
            .await
            .unwrap_err();
        assert!(matches!(err, TreasuryError::InvalidWallet { .. }));

        let err = f
            .escrow
            .claim(&ClaimToken::from_string("unknown"), &wallet(2))
            .await
            .unwrap_err();
        assert!(matches!(err, TreasuryError::PayoutNotFound));
    }

    #[tokio::test]
    async fn passive_expiry_releases_once() {
        let f = fixture(production()).await;
        let payout = f
            .escrow
            .create_payout(f.merchant, PayoutRequest::new("a@x.com", d(4000)))
            .await
            .unwrap();
        f.clock.advance(Duration::days(8));

        let seen = f.escrow.fetch_by_token(&payout.claim_token).await.unwrap();
        assert_eq!(seen.status, PayoutStatus::Expired);
        let seen = f.escrow.fetch_by_token(&payout.claim_token).await.unwrap();
        assert_eq!(seen.status, PayoutStatus::Expired);

        let bal = f.escrow.balances.balance(f.merchant).await.unwrap();
        assert_eq!(bal.available, d(10_000));
        assert_eq!(bal.reserved, Decimal::ZERO);
        assert_eq!(f.events.count(EventType::PayoutExpired), 1);

        let err = f.escrow.claim(&payout.claim_token, &wallet(1)).await.unwrap_err();
        assert!(matches!(err, TreasuryError::PayoutExpired(_)));
        assert_eq!(err.http_status(), 410);
        assert_eq!(f.executor.transfer_count(), 0);
    }

    #[tokio::test]
    async fn retryable_failure_keeps_payout_claimable() {
        let f = fixture(production()).await;
        let payout = f
            .escrow
            .create_payout(f.merchant, PayoutRequest::new("a@x.com", d(4000)))
            .await
            .unwrap();
        f.executor.fail_with(Some(ExecutorError::Unavailable("rpc down".into())));

        let err = f.escrow.claim(&payout.claim_token, &wallet(1)).await.unwrap_err();
        assert!(matches!(err, TreasuryError::SettlementFailed { .. }));
        let bal = f.escrow.balances.balance(f.merchant).await.unwrap();
        assert_eq!(bal.reserved, d(4100));
        let row = f.escrow.payout(payout.id).await.unwrap();
        assert_eq!(row.status, PayoutStatus::Sent);
        assert!(row.claim_lease_until.is_none());

        f.executor.fail_with(None);
        let out = f.escrow.claim(&payout.claim_token, &wallet(1)).await.unwrap();
        assert_eq!(out.payout.status, PayoutStatus::Claimed);
    }

    #[tokio::test]
    async fn development_substitutes_synthetic_reference() {
        let f = fixture(EngineConfig::development()).await;
        let payout = f
            .escrow
            .create_payout(f.merchant, PayoutRequest::new("a@x.com", d(4000)))
            .await
            .unwrap();
        f.executor.fail_with(Some(ExecutorError::Rejected("blockhash".into())));
        let out = f.escrow.claim(&payout.claim_token, &wallet(1)).await.unwrap();
        assert!(out.simulated);
        assert!(out.tx_signature.starts_with("sim_"));
    }

    #[tokio::test]
    async fn unrecoverable_failure_fails_and_releases() {
        let f = fixture(production()).await;
        let payout = f
            .escrow
            .create_payout(f.merchant, PayoutRequest::new("a@x.com", d(4000)))
            .await
            .unwrap();
        f.executor.fail_with(Some(ExecutorError::Unrecoverable("account frozen".into())));

        let err = f.escrow.claim(&payout.claim_token, &wallet(1)).await.unwrap_err();
        assert!(matches!(err, TreasuryError::SettlementAborted { .. }));
        let row = f.escrow.payout(payout.id).await.unwrap();
        assert_eq!(row.status, PayoutStatus::Failed);
        let bal = f.escrow.balances.balance(f.merchant).await.unwrap();
        assert_eq!(bal.available, d(10_000));
        assert_eq!(f.events.count(EventType::PayoutFailed), 1);
    }

    #[tokio::test]
    async fn sweep_expires_only_overdue() {
        let f = fixture(production()).await;
        let old = f
            .escrow
            .create_payout(f.merchant, PayoutRequest::new("a@x.com", d(1000)))
            .await
            .unwrap();
        f.clock.advance(Duration::days(5));
        let young = f
            .escrow
            .create_payout(f.merchant, PayoutRequest::new("b@x.com", d(1000)))
            .await
            .unwrap();
        f.clock.advance(Duration::days(3));

        assert_eq!(f.escrow.sweep_expired(100).await.unwrap(), 1);
        assert_eq!(f.escrow.sweep_expired(100).await.unwrap(), 0);
        assert_eq!(f.escrow.payout(old.id).await.unwrap().status, PayoutStatus::Expired);
        assert_eq!(f.escrow.payout(young.id).await.unwrap().status, PayoutStatus::Sent);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_settle_once() {
        let store: Arc<dyn TreasuryStore> = Arc::new(MemoryStore::new());
        let config = production();
        let balances = BalanceStore::new(store.clone(), Arc::new(BasisPointsFeeCalculator::from(&config.fee)));
        let executor = Arc::new(MockExecutor::new().with_delay(std::time::Duration::from_millis(50)));
        let merchant = MerchantId::new();
        balances.credit(merchant, d(10_000), "Initial funding", chrono::Utc::now()).await.unwrap();
        let escrow = PayoutEscrow::new(
            store,
            balances,
            executor.clone(),
            Arc::new(RecordingSink::new()),
            Arc::new(crate::clock::SystemClock),
            Arc::new(config),
        );
        let payout = escrow
            .create_payout(merchant, PayoutRequest::new("a@x.com", d(4000)))
            .await
            .unwrap();

        let claims: Vec<_> = (0..2u8)
            .map(|n| {
                let escrow = escrow.clone();
                let token = payout.claim_token.clone();
                tokio::spawn(async move { escrow.claim(&token, &wallet(n + 1)).await })
            })
            .collect();
        let mut won = 0;
        let mut conflicts = 0;
        for claim in claims {
            match claim.await.unwrap() {
                Ok(_) => won += 1,
                Err(e) => {
                    assert_eq!(e.kind(), treasury_types::ErrorKind::StateConflict, "{e}");
                    conflicts += 1;
                }
            }
        }
        assert_eq!((won, conflicts), (1, 1));
        assert_eq!(executor.transfer_count(), 1);
        let bal = escrow.balances.balance(merchant).await.unwrap();
        assert_eq!(bal.total_payouts, d(4000));
        assert_eq!(bal.reserved, Decimal::ZERO);
    }

    #[tokio::test]
    async fn expiry_waits_for_live_claim() {
        let f = fixture(production()).await;
        let payout = f
            .escrow
            .create_payout(f.merchant, PayoutRequest::new("a@x.com", d(4000)))
            .await
            .unwrap();
        let now = f.clock.now();
        f.escrow
            .store
            .update_payout(
                payout.id,
                &PayoutChange::BeginClaim {
                    attempt: Uuid::now_v7(),
                    wallet: wallet(1),
                    at: now,
                    lease_until: payout.expires_at + Duration::minutes(5),
                },
            )
            .await
            .unwrap();
        f.clock.set(payout.expires_at + Duration::seconds(1));

        assert_eq!(f.escrow.sweep_expired(10).await.unwrap(), 0);
        let seen = f.escrow.fetch_by_token(&payout.claim_token).await.unwrap();
        assert_eq!(seen.status, PayoutStatus::Sent);
        let bal = f.escrow.balances.balance(f.merchant).await.unwrap();
        assert_eq!(bal.reserved, d(4100));
    }

    #[tokio::test]
    async fn slow_transfer_outlasting_lease_still_claims() {
        let f = fixture(production()).await;
        let executor = Arc::new(MockExecutor::new().with_delay(std::time::Duration::from_millis(300)));
        let escrow = PayoutEscrow {
            executor: executor.clone(),
            ..f.escrow.clone()
        };
        let payout = escrow
            .create_payout(f.merchant, PayoutRequest::new("a@x.com", d(4000)))
            .await
            .unwrap();

        let claim = {
            let escrow = escrow.clone();
            let token = payout.claim_token.clone();
            tokio::spawn(async move { escrow.claim(&token, &wallet(1)).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        f.clock.advance(Duration::days(8));

        assert_eq!(escrow.sweep_expired(10).await.unwrap(), 0);
        let seen = escrow.fetch_by_token(&payout.claim_token).await.unwrap();
        assert_eq!(seen.status, PayoutStatus::Sent);

        let out = claim.await.unwrap().unwrap();
        assert_eq!(out.payout.status, PayoutStatus::Claimed);
        assert_eq!(executor.transfer_count(), 1);
        let bal = escrow.balances.balance(f.merchant).await.unwrap();
        assert_eq!(bal.available, d(5900));
        assert_eq!(bal.reserved, Decimal::ZERO);
        assert_eq!(bal.total_payouts, d(4000));
        assert_eq!(f.events.count(EventType::PayoutExpired), 0);
        assert_eq!(f.events.count(EventType::PayoutClaimed), 1);
    }

    #[tokio::test]
    async fn stale_claim_with_landed_transfer_is_completed() {
        let f = fixture(production()).await;
        let payout = f
            .escrow
            .create_payout(f.merchant, PayoutRequest::new("a@x.com", d(4000)))
            .await
            .unwrap();
        let now = f.clock.now();
        f.escrow
            .store
            .update_payout(
                payout.id,
                &PayoutChange::BeginClaim {
                    attempt: Uuid::now_v7(),
                    wallet: wallet(1),
                    at: now,
                    lease_until: now + Duration::minutes(5),
                },
            )
            .await
            .unwrap();
        // The claiming process died right after the rail accepted the transfer.
        let receipt = f
            .executor
            .transfer(&TransferRequest {
                payout_id: payout.id,
                destination: wallet(1),
                amount: payout.amount,
                currency: payout.currency.clone(),
            })
            .await
            .unwrap();
        f.clock.advance(Duration::days(8));

        assert_eq!(f.escrow.sweep_expired(10).await.unwrap(), 0);
        let row = f.escrow.payout(payout.id).await.unwrap();
        assert_eq!(row.status, PayoutStatus::Claimed);
        assert_eq!(row.tx_signature, Some(receipt.signature));
        assert_eq!(row.recipient_wallet, Some(wallet(1)));
        let bal = f.escrow.balances.balance(f.merchant).await.unwrap();
        assert_eq!(bal.reserved, Decimal::ZERO);
        assert_eq!(bal.total_payouts, d(4000));
        assert_eq!(f.events.count(EventType::PayoutClaimed), 1);
        assert_eq!(f.events.count(EventType::PayoutExpired), 0);
    }

    #[tokio::test]
    async fn stale_claim_without_transfer_reopens_then_expires() {
        let f = fixture(production()).await;
        let payout = f
            .escrow
            .create_payout(f.merchant, PayoutRequest::new("a@x.com", d(4000)))
            .await
            .unwrap();
        let now = f.clock.now();
        f.escrow
            .store
            .update_payout(
                payout.id,
                &PayoutChange::BeginClaim {
                    attempt: Uuid::now_v7(),
                    wallet: wallet(1),
                    at: now,
                    lease_until: now + Duration::minutes(5),
                },
            )
            .await
            .unwrap();

        f.clock.advance(Duration::minutes(10));
        let reopened = f.escrow.fetch_by_token(&payout.claim_token).await.unwrap();
        assert_eq!(reopened.status, PayoutStatus::Sent);
        assert!(!reopened.has_claim_attempt());
        assert!(reopened.recipient_wallet.is_none());

        let now = f.clock.now();
        f.escrow
            .store
            .update_payout(
                payout.id,
                &PayoutChange::BeginClaim {
                    attempt: Uuid::now_v7(),
                    wallet: wallet(2),
                    at: now,
                    lease_until: now + Duration::minutes(5),
                },
            )
            .await
            .unwrap();
        f.clock.advance(Duration::days(8));
        assert_eq!(f.escrow.sweep_expired(10).await.unwrap(), 1);
        let bal = f.escrow.balances.balance(f.merchant).await.unwrap();
        assert_eq!(bal.available, d(10_000));
        assert_eq!(f.executor.transfer_count(), 0);
    }

    #[tokio::test]
    async fn unsupported_currency_rejected() {
        let f = fixture(production()).await;
        let mut request = PayoutRequest::new("a@x.com", d(1000));
        request.currency = Some("EUR".into());
        let err = f.escrow.create_payout(f.merchant, request).await.unwrap_err();
        assert_eq!(err.kind(), treasury_types::ErrorKind::Validation);
    }
}
