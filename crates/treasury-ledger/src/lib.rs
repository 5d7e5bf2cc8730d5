//! # treasury-ledger
//!
//! The **Balance Store**: per-merchant balances mutated only through the
//! `credit` / `reserve` / `release` / `settle` primitives, each applied
//! atomically together with one hash-chained journal row.
//!
//! ## Architecture
//!
//! ```text
//! BalanceStore ──▶ TreasuryStore (trait)
//!                    ├── MemoryStore   (DashMap, per-row entry locks)
//!                    └── RocksStore    (TransactionDB, get_for_update)
//!                          │
//!                          ▼
//!                  plan_mutation ──▶ conservation::verify_transition
//! ```

pub mod account;
pub mod balance_store;
pub mod conservation;
pub mod fee;
pub mod idempotency;
pub mod memory;
#[cfg(feature = "rocksdb")]
pub mod rocks;
pub mod store;

pub use account::{LedgerAccount, MutationOutcome, plan_mutation};
pub use balance_store::{BalanceStore, Credit, Reservation};
pub use fee::{BasisPointsFeeCalculator, FeeCalculator};
pub use idempotency::IdempotencyGuard;
pub use memory::MemoryStore;
#[cfg(feature = "rocksdb")]
pub use rocks::RocksStore;
pub use store::{PayoutQuery, TransactionQuery, TreasuryStore};
