//! Settlement Executor seam.
//!
//! The engine never builds on-chain instructions itself. It asks a
//! [`SettlementExecutor`] to make sure the destination can receive the
//! settlement currency and then to transfer, and awaits the result.
//!
//! Transfers carry the payout id as their reference. An executor must be
//! able to say, for a payout id, whether a transfer landed, is still in
//! flight, or was never sent: that answer is what resolves a claim whose
//! lease ran out before the executor returned.

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;
use treasury_types::{Environment, PayoutId, Result, TreasuryError};
use uuid::Uuid;

/// One outbound transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub payout_id: PayoutId,
    pub destination: String,
    pub amount: Decimal,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    /// On-chain transaction reference.
    pub signature: String,
}

/// What the rail knows about the transfer for one payout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    /// Funds reached the destination.
    Landed(TransferReceipt),
    /// Submitted, outcome not known yet.
    InFlight,
    /// No transfer for this payout exists and none can land any more.
    NotSent,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutorError {
    /// The rail could not be reached. Nothing was sent.
    #[error("settlement rail unavailable: {0}")]
    Unavailable(String),
    /// The rail refused this attempt. Nothing was sent; a retry may pass.
    #[error("transfer rejected: {0}")]
    Rejected(String),
    /// The payout can never settle (e.g. the destination cannot hold the
    /// settlement currency).
    #[error("unrecoverable settlement failure: {0}")]
    Unrecoverable(String),
}

impl ExecutorError {
    /// Whether the payout should stay claimable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Unrecoverable(_))
    }
}

#[async_trait]
pub trait SettlementExecutor: Send + Sync {
    /// Create the destination's token account if it does not exist yet.
    /// Returns `true` if an account was created.
    async fn ensure_destination(&self, wallet: &str) -> std::result::Result<bool, ExecutorError>;

    /// Move `request.amount` to `request.destination`.
    async fn transfer(
        &self,
        request: &TransferRequest,
    ) -> std::result::Result<TransferReceipt, ExecutorError>;

    /// Look up the transfer made for `payout_id`, if any.
    async fn transfer_status(
        &self,
        payout_id: PayoutId,
    ) -> std::result::Result<TransferStatus, ExecutorError>;
}

/// Executor that settles nothing and returns synthetic `sim_` references.
/// It refuses to exist in production.
#[derive(Debug)]
pub struct SimulatedExecutor {
    _private: (),
}

impl SimulatedExecutor {
    /// # Errors
    /// `Configuration` when `environment` is production.
    pub fn new(environment: Environment) -> Result<Self> {
        if environment.is_production() {
            return Err(TreasuryError::Configuration(
                "simulated settlement is not available in production".into(),
            ));
        }
        Ok(Self { _private: () })
    }
}

/// A synthetic settlement reference. Never produced in production.
#[must_use]
pub fn synthetic_reference() -> String {
    format!("sim_{}", Uuid::now_v7().simple())
}

#[async_trait]
impl SettlementExecutor for SimulatedExecutor {
    async fn ensure_destination(&self, _wallet: &str) -> std::result::Result<bool, ExecutorError> {
        Ok(false)
    }

    async fn transfer(
        &self,
        request: &TransferRequest,
    ) -> std::result::Result<TransferReceipt, ExecutorError> {
        tracing::warn!(
            payout_id = %request.payout_id,
            amount = %request.amount,
            "Simulated settlement, no funds moved"
        );
        Ok(TransferReceipt {
            signature: synthetic_reference(),
        })
    }

    async fn transfer_status(
        &self,
        _payout_id: PayoutId,
    ) -> std::result::Result<TransferStatus, ExecutorError> {
        Ok(TransferStatus::NotSent)
    }
}

/// Scriptable executor for tests: counts calls, can fail on demand and can
/// hold each transfer open for a while to widen race windows.
#[cfg(any(test, feature = "test-helpers"))]
#[derive(Debug, Default)]
pub struct MockExecutor {
    transfers: std::sync::atomic::AtomicUsize,
    destinations: std::sync::atomic::AtomicUsize,
    failure: std::sync::Mutex<Option<ExecutorError>>,
    delay: Option<std::time::Duration>,
    ledger: std::sync::Mutex<std::collections::HashMap<PayoutId, TransferStatus>>,
}

#[cfg(any(test, feature = "test-helpers"))]
impl MockExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make every following transfer fail with `error`, or succeed with `None`.
    pub fn fail_with(&self, error: Option<ExecutorError>) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = error;
        }
    }

    /// Number of `transfer` calls so far.
    pub fn transfer_count(&self) -> usize {
        self.transfers.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn destination_count(&self) -> usize {
        self.destinations.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn record(&self, payout_id: PayoutId, status: Option<TransferStatus>) {
        if let Ok(mut ledger) = self.ledger.lock() {
            match status {
                Some(status) => ledger.insert(payout_id, status),
                None => ledger.remove(&payout_id),
            };
        }
    }
}

#[cfg(any(test, feature = "test-helpers"))]
#[async_trait]
impl SettlementExecutor for MockExecutor {
    async fn ensure_destination(&self, _wallet: &str) -> std::result::Result<bool, ExecutorError> {
        self.destinations
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(true)
    }

    async fn transfer(
        &self,
        request: &TransferRequest,
    ) -> std::result::Result<TransferReceipt, ExecutorError> {
        let n = self
            .transfers
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.record(request.payout_id, Some(TransferStatus::InFlight));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.failure.lock().ok().and_then(|f| f.clone());
        match failure {
            Some(err) => {
                self.record(request.payout_id, None);
                Err(err)
            }
            None => {
                let receipt = TransferReceipt {
                    signature: format!("mock_{}_{n}", request.payout_id),
                };
                self.record(request.payout_id, Some(TransferStatus::Landed(receipt.clone())));
                Ok(receipt)
            }
        }
    }

    async fn transfer_status(
        &self,
        payout_id: PayoutId,
    ) -> std::result::Result<TransferStatus, ExecutorError> {
        let status = self
            .ledger
            .lock()
            .ok()
            .and_then(|ledger| ledger.get(&payout_id).cloned());
        Ok(status.unwrap_or(TransferStatus::NotSent))
    }
}
