//! Error types for the treasury engine.
//!
//! All errors use the `TR_ERR_` prefix convention for easy grepping in logs.
//! Error codes are grouped by subsystem:
//! - 1xx: Validation errors
//! - 2xx: Balance / affordability errors
//! - 3xx: Payout state conflicts
//! - 4xx: Settlement errors
//! - 5xx: Deposit errors
//! - 6xx: Notification errors
//! - 9xx: General / internal errors
//!
//! Every variant maps onto one [`ErrorKind`] so calling surfaces can render
//! "insufficient funds", "link expired" and "already claimed" distinctly.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::{PayoutId, PayoutStatus};

/// Machine-distinguishable reason bucket for a rejected operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input, rejected before any side effect.
    Validation,
    /// Not enough available balance, rejected before any side effect.
    Affordability,
    /// The payout is not in a state that allows the operation.
    StateConflict,
    /// The settlement executor failed; the payout stays retryable.
    Settlement,
    /// Webhook delivery failure. Never surfaced to a financial caller.
    Notification,
    /// Storage, configuration or invariant failure.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Affordability => write!(f, "affordability"),
            Self::StateConflict => write!(f, "state_conflict"),
            Self::Settlement => write!(f, "settlement"),
            Self::Notification => write!(f, "notification"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Central error enum for all treasury operations.
#[derive(Debug, Error)]
pub enum TreasuryError {
    // =================================================================
    // Validation Errors (1xx)
    // =================================================================
    /// Recipient email is missing or malformed.
    #[error("TR_ERR_100: Invalid email: {0}")]
    InvalidEmail(String),

    /// Amount is non-positive, too precise, or outside the allowed range.
    #[error("TR_ERR_101: Invalid amount: {reason}")]
    InvalidAmount { reason: String },

    /// Wallet address does not look like a base58 public key.
    #[error("TR_ERR_102: Invalid wallet address: {reason}")]
    InvalidWallet { reason: String },

    /// A batch must contain at least one item.
    #[error("TR_ERR_103: Batch is empty")]
    EmptyBatch,

    /// A batch exceeded the item ceiling.
    #[error("TR_ERR_104: Batch has {count} items, maximum is {max}")]
    BatchTooLarge { count: usize, max: usize },

    /// One item of a batch failed validation.
    #[error("TR_ERR_105: Invalid batch item at index {index}: {reason}")]
    InvalidBatchItem { index: usize, reason: String },

    /// Generic request validation failure.
    #[error("TR_ERR_106: Invalid request: {reason}")]
    InvalidRequest { reason: String },

    // =================================================================
    // Balance Errors (2xx)
    // =================================================================
    /// Not enough available balance to reserve.
    #[error("TR_ERR_200: Insufficient balance: need {needed}, have {available}")]
    InsufficientBalance { needed: Decimal, available: Decimal },

    /// Batch pre-flight found the merchant short.
    #[error(
        "TR_ERR_201: Insufficient balance for batch: need {needed}, have {available}, short {shortfall}"
    )]
    BatchShortfall {
        needed: Decimal,
        available: Decimal,
        shortfall: Decimal,
    },

    /// A batch item failed its reservation during commit.
    #[error("TR_ERR_202: Batch reservation failed at index {index}: need {needed}, have {available}")]
    BatchReservationFailed {
        index: usize,
        needed: Decimal,
        available: Decimal,
    },

    /// Release or settle asked for more than is reserved.
    #[error("TR_ERR_203: Insufficient reserved balance: need {needed}, reserved {reserved}")]
    InsufficientReserved { needed: Decimal, reserved: Decimal },

    /// Ledger conservation check failed. Critical.
    #[error("TR_ERR_204: Ledger invariant violation: {reason}")]
    LedgerInvariantViolation { reason: String },

    // =================================================================
    // Payout State Errors (3xx)
    // =================================================================
    /// No payout exists for the id or claim token.
    #[error("TR_ERR_300: Payout not found")]
    PayoutNotFound,

    /// The payout was already claimed.
    #[error("TR_ERR_301: Payout {0} has already been claimed")]
    AlreadyClaimed(PayoutId),

    /// The payout expired before it was claimed.
    #[error("TR_ERR_302: Payout {0} has expired")]
    PayoutExpired(PayoutId),

    /// The payout is in a state that does not allow claiming.
    #[error("TR_ERR_303: Payout {id} is not available for claiming (status {status})")]
    PayoutNotClaimable { id: PayoutId, status: PayoutStatus },

    /// Another claim for the same payout is in flight.
    #[error("TR_ERR_304: A claim for payout {0} is already in progress")]
    ClaimInProgress(PayoutId),

    /// The requested status change is not a legal transition.
    #[error("TR_ERR_305: Invalid payout transition for {id}: {reason}")]
    InvalidTransition { id: PayoutId, reason: String },

    // =================================================================
    // Settlement Errors (4xx)
    // =================================================================
    /// The settlement executor failed; the claim can be retried.
    #[error("TR_ERR_400: Settlement failed, please retry: {reason}")]
    SettlementFailed { reason: String },

    /// The settlement executor failed permanently; the payout is FAILED.
    #[error("TR_ERR_401: Settlement failed permanently: {reason}")]
    SettlementAborted { reason: String },

    // =================================================================
    // Deposit Errors (5xx)
    // =================================================================
    /// The deposit transaction could not be verified on-chain.
    #[error("TR_ERR_500: Deposit could not be verified: {reason}")]
    DepositUnverified { reason: String },

    /// The deposit is above the single-deposit ceiling.
    #[error("TR_ERR_501: Deposit of {amount} exceeds ceiling {ceiling}")]
    DepositAboveCeiling { amount: Decimal, ceiling: Decimal },

    /// The on-chain reference was already credited to another merchant.
    #[error("TR_ERR_502: Deposit reference {tx_reference} was already credited")]
    DepositReferenceUsed { tx_reference: String },

    // =================================================================
    // Notification Errors (6xx)
    // =================================================================
    /// Webhook delivery failed after all retries.
    #[error("TR_ERR_600: Webhook delivery failed after {attempts} attempts: {reason}")]
    DeliveryFailed { attempts: u32, reason: String },

    // =================================================================
    // General / Internal (9xx)
    // =================================================================
    /// Persistence layer failure.
    #[error("TR_ERR_900: Storage error: {0}")]
    Storage(String),

    /// Serialization / deserialization error.
    #[error("TR_ERR_901: Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (invalid values, missing fields, etc.).
    #[error("TR_ERR_902: Configuration error: {0}")]
    Configuration(String),

    /// Unrecoverable internal error.
    #[error("TR_ERR_903: Internal error: {0}")]
    Internal(String),
}

impl TreasuryError {
    /// Taxonomy bucket of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidEmail(_)
            | Self::InvalidAmount { .. }
            | Self::InvalidWallet { .. }
            | Self::EmptyBatch
            | Self::BatchTooLarge { .. }
            | Self::InvalidBatchItem { .. }
            | Self::InvalidRequest { .. }
            | Self::DepositAboveCeiling { .. }
            | Self::DepositUnverified { .. }
            | Self::DepositReferenceUsed { .. } => ErrorKind::Validation,
            Self::InsufficientBalance { .. }
            | Self::BatchShortfall { .. }
            | Self::BatchReservationFailed { .. } => ErrorKind::Affordability,
            Self::PayoutNotFound
            | Self::AlreadyClaimed(_)
            | Self::PayoutExpired(_)
            | Self::PayoutNotClaimable { .. }
            | Self::ClaimInProgress(_)
            | Self::InvalidTransition { .. } => ErrorKind::StateConflict,
            Self::SettlementFailed { .. } | Self::SettlementAborted { .. } => {
                ErrorKind::Settlement
            }
            Self::DeliveryFailed { .. } => ErrorKind::Notification,
            Self::InsufficientReserved { .. }
            | Self::LedgerInvariantViolation { .. }
            | Self::Storage(_)
            | Self::Serialization(_)
            | Self::Configuration(_)
            | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// HTTP-equivalent status code for transport layers.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InsufficientBalance { .. }
            | Self::BatchShortfall { .. }
            | Self::BatchReservationFailed { .. } => 402,
            Self::PayoutNotFound => 404,
            Self::PayoutExpired(_) => 410,
            Self::AlreadyClaimed(_)
            | Self::PayoutNotClaimable { .. }
            | Self::ClaimInProgress(_)
            | Self::InvalidTransition { .. }
            | Self::DepositReferenceUsed { .. } => 409,
            Self::SettlementFailed { .. } | Self::SettlementAborted { .. } => 502,
            other if other.kind() == ErrorKind::Validation => 400,
            _ => 500,
        }
    }
}

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, TreasuryError>;

impl From<serde_json::Error> for TreasuryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
