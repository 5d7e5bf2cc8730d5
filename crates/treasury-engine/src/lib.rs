//! # treasury-engine
//!
//! One facade over the treasury subsystems:
//!
//! ```text
//!                      TreasuryEngine
//!      ┌──────────────┬──────┴───────┬───────────────┐
//!      ▼              ▼              ▼               ▼
//! DepositHandler  PayoutEscrow  BatchCoordinator  EndpointRegistry
//!      │              │   │          │               │
//!      └──────┬───────┘   │          │               ▼
//!             ▼           ▼          │        WebhookDispatcher
//!        BalanceStore  Settlement    │               ▲
//!             │        Executor      │               │ events
//!             ▼                      └───────────────┘
//!        TreasuryStore
//! ```
//!
//! Build one with [`TreasuryEngine::builder`] inside a tokio runtime.

pub mod api;
pub mod builder;
pub mod engine;
pub mod telemetry;

pub use api::{
    BatchReceipt, ClaimReceipt, DepositInstructions, DepositReceipt, PayoutReceipt, PublicPayout,
};
pub use builder::TreasuryEngineBuilder;
pub use engine::TreasuryEngine;
pub use telemetry::init_tracing;

pub use treasury_escrow::{DepositRequest, DepositVerifier, SettlementExecutor, Verification};
pub use treasury_ledger::{PayoutQuery, TransactionQuery, TreasuryStore};
pub use treasury_types::{EngineConfig, ErrorKind, Result, TreasuryError};
pub use treasury_webhook::EventFilter;
