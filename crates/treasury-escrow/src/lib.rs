//! # treasury-escrow
//!
//! Payout escrow on top of the ledger:
//!
//! - [`PayoutEscrow`]: single payouts, claim tokens, passive expiry, claims
//! - [`BatchCoordinator`]: all-or-nothing multi-payout creation
//! - [`DepositHandler`]: verified, replay-safe deposit credits
//! - [`ExpirySweeper`]: background release of overdue payouts
//!
//! Settlement and deposit verification are reached through the
//! [`SettlementExecutor`] and [`DepositVerifier`] seams.

pub mod batch;
pub mod clock;
pub mod deposit;
pub mod escrow;
pub mod executor;
pub mod sweeper;
pub mod validation;

pub use batch::{BatchCoordinator, BatchOutcome};
#[cfg(any(test, feature = "test-helpers"))]
pub use clock::ManualClock;
pub use clock::{Clock, SystemClock};
pub use deposit::{
    DepositHandler, DepositInstructions, DepositOutcome, DepositRequest, DepositVerifier,
    TrustReportedVerifier, Verification,
};
pub use escrow::{ClaimOutcome, PayoutDraft, PayoutEscrow, PublicPayout};
#[cfg(any(test, feature = "test-helpers"))]
pub use executor::MockExecutor;
pub use executor::{
    ExecutorError, SettlementExecutor, SimulatedExecutor, TransferReceipt, TransferRequest,
    TransferStatus,
    synthetic_reference,
};
pub use sweeper::{ExpirySweeper, SweeperHandle};
