//! System-wide constants for the treasury engine.

/// The single settlement currency (a stablecoin-equivalent unit).
pub const SETTLEMENT_CURRENCY: &str = "USDC";

/// Decimal places of the settlement currency on-chain (USDC has 6).
pub const CURRENCY_SCALE: u32 = 6;

/// Decimal places fees are rounded to.
pub const FEE_SCALE: u32 = 2;

/// Length of a generated claim token.
pub const CLAIM_TOKEN_LEN: usize = 48;

/// Hours between payout creation and expiry (7 days).
pub const DEFAULT_PAYOUT_EXPIRY_HOURS: i64 = 7 * 24;

/// Seconds after which an unfinished claim lease is treated as abandoned.
pub const DEFAULT_CLAIM_LEASE_SECS: i64 = 300;

/// Default fee: 100 basis points (1%).
pub const DEFAULT_FEE_BASIS_POINTS: u32 = 100;

/// Default fee floor in whole currency units.
pub const DEFAULT_MINIMUM_FEE_UNITS: i64 = 1;

/// Smallest payout amount, in hundredths (0.01).
pub const DEFAULT_MIN_PAYOUT_CENTS: i64 = 1;

/// Largest single payout amount in whole units.
pub const DEFAULT_MAX_PAYOUT_UNITS: i64 = 100_000;

/// Maximum number of items in one payout batch.
pub const MAX_BATCH_SIZE: usize = 500;

/// Largest single deposit accepted, in whole units.
pub const DEFAULT_MAX_DEPOSIT_UNITS: i64 = 1_000_000;

/// Minimum length of an on-chain transaction reference.
pub const MIN_TX_REFERENCE_LEN: usize = 10;

/// Wallet addresses are base58-encoded 32-byte public keys.
pub const WALLET_MIN_LEN: usize = 32;
pub const WALLET_MAX_LEN: usize = 44;
pub const WALLET_KEY_BYTES: usize = 32;

/// Number of idempotency keys remembered per merchant row.
pub const IDEMPOTENCY_KEYS_PER_MERCHANT: usize = 100_000;

/// Webhook delivery attempts before a delivery is dead-lettered.
pub const DEFAULT_WEBHOOK_MAX_ATTEMPTS: u32 = 3;

/// Base of the exponential retry delay (`base * 2^attempt`), milliseconds.
pub const DEFAULT_WEBHOOK_BACKOFF_BASE_MS: u64 = 1_000;

/// Per-attempt webhook request timeout, milliseconds.
pub const DEFAULT_WEBHOOK_TIMEOUT_MS: u64 = 10_000;

/// Capacity of the webhook job queue.
pub const DEFAULT_WEBHOOK_QUEUE_CAPACITY: usize = 1_024;

/// Number of delivery records and dead letters kept for inspection.
pub const WEBHOOK_LOG_CAPACITY: usize = 1_000;

/// Header names for outbound webhooks.
pub const SIGNATURE_HEADER: &str = "X-Treasury-Signature";
pub const EVENT_HEADER: &str = "X-Treasury-Event";
pub const DELIVERY_HEADER: &str = "X-Treasury-Delivery";
pub const TIMESTAMP_HEADER: &str = "X-Treasury-Timestamp";

/// Version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// User agent sent with webhook deliveries.
pub const WEBHOOK_USER_AGENT: &str = concat!("Treasury-Webhooks/", env!("CARGO_PKG_VERSION"));
