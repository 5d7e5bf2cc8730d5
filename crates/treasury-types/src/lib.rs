//! # treasury-types
//!
//! Shared types, errors, and configuration for the **Treasury** engine.
//!
//! This crate is the leaf dependency of the workspace. Every other crate
//! depends on it. It defines:
//!
//! - **Identifiers**: [`MerchantId`], [`PayoutId`], [`BatchId`], [`TransactionId`], [`EventId`], [`ClaimToken`], [`IdempotencyKey`]
//! - **Balance model**: [`MerchantBalance`], [`BalanceMutation`]
//! - **Payout model**: [`Payout`], [`PayoutStatus`], [`PayoutChange`], [`PayoutRequest`]
//! - **Batch model**: [`PayoutBatch`], [`BatchItem`]
//! - **Journal**: [`TreasuryTransaction`], [`TransactionKind`]
//! - **Recipient directory**: [`Recipient`]
//! - **Events**: [`TreasuryEvent`], [`EventType`], [`EventSink`]
//! - **Configuration**: [`EngineConfig`] and its sections
//! - **Errors**: [`TreasuryError`] with `TR_ERR_` prefix codes
//! - **Constants**: system-wide limits and defaults

pub mod balance;
pub mod batch;
pub mod config;
pub mod constants;
pub mod error;
pub mod event;
pub mod ids;
pub mod payout;
pub mod recipient;
pub mod transaction;

// Re-export all primary types at crate root for ergonomic imports:
//   use treasury_types::{Payout, PayoutStatus, MerchantBalance, ...};

pub use balance::*;
pub use batch::*;
pub use config::*;
pub use error::*;
pub use event::*;
pub use ids::*;
pub use payout::*;
pub use recipient::*;
pub use transaction::*;

// Constants are accessed via `treasury_types::constants::FOO`
// (not re-exported to avoid name collisions).
