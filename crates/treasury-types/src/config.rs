//! Engine configuration.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{TreasuryError, constants};

/// Deployment environment. Controls whether non-production fallbacks
/// (simulated settlement, unverified deposits) may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Development,
}

impl Environment {
    #[must_use]
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

impl std::str::FromStr for Environment {
    type Err = TreasuryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "development" | "dev" | "local" | "test" => Ok(Self::Development),
            other => Err(TreasuryError::Configuration(format!(
                "unknown environment '{other}'"
            ))),
        }
    }
}

/// Fee schedule: `max(amount * basis_points / 10000, minimum_fee)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeConfig {
    pub basis_points: u32,
    pub minimum_fee: Decimal,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            basis_points: constants::DEFAULT_FEE_BASIS_POINTS,
            minimum_fee: Decimal::new(constants::DEFAULT_MINIMUM_FEE_UNITS, 0),
        }
    }
}

/// Bounds on payout amounts and batch sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutLimits {
    pub min_amount: Decimal,
    pub max_amount: Decimal,
    pub max_batch_size: usize,
}

impl Default for PayoutLimits {
    fn default() -> Self {
        Self {
            min_amount: Decimal::new(constants::DEFAULT_MIN_PAYOUT_CENTS, 2),
            max_amount: Decimal::new(constants::DEFAULT_MAX_PAYOUT_UNITS, 0),
            max_batch_size: constants::MAX_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowConfig {
    /// Hours from creation until a payout expires.
    pub expiry_hours: i64,
    /// Seconds before an unfinished claim is treated as abandoned.
    pub claim_lease_secs: i64,
    /// Claim links are `{claim_base_url}/claim/{token}`.
    pub claim_base_url: String,
    /// Sweeper period in seconds. `0` disables the background sweeper.
    pub sweep_interval_secs: u64,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            expiry_hours: constants::DEFAULT_PAYOUT_EXPIRY_HOURS,
            claim_lease_secs: constants::DEFAULT_CLAIM_LEASE_SECS,
            claim_base_url: "https://settlr.io".to_string(),
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositConfig {
    /// Ceiling on a single deposit.
    pub max_single_deposit: Decimal,
    /// Treasury address merchants send deposits to.
    pub deposit_address: String,
    /// Network label shown in deposit instructions.
    pub network: String,
}

impl Default for DepositConfig {
    fn default() -> Self {
        Self {
            max_single_deposit: Decimal::new(constants::DEFAULT_MAX_DEPOSIT_UNITS, 0),
            deposit_address: String::new(),
            network: "solana".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub timeout_ms: u64,
    pub queue_capacity: usize,
    /// Signing secret for endpoints registered without their own.
    pub default_secret: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_attempts: constants::DEFAULT_WEBHOOK_MAX_ATTEMPTS,
            backoff_base_ms: constants::DEFAULT_WEBHOOK_BACKOFF_BASE_MS,
            timeout_ms: constants::DEFAULT_WEBHOOK_TIMEOUT_MS,
            queue_capacity: constants::DEFAULT_WEBHOOK_QUEUE_CAPACITY,
            default_secret: String::new(),
        }
    }
}

/// Top-level configuration of a treasury engine instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub environment: Environment,
    pub fee: FeeConfig,
    pub limits: PayoutLimits,
    pub escrow: EscrowConfig,
    pub deposit: DepositConfig,
    pub webhook: WebhookConfig,
}

impl EngineConfig {
    /// Defaults suitable for local development and tests.
    #[must_use]
    pub fn development() -> Self {
        Self {
            environment: Environment::Development,
            ..Self::default()
        }
    }

    /// Defaults overlaid with `TREASURY_ENV`, `TREASURY_CLAIM_BASE_URL`,
    /// `TREASURY_WEBHOOK_SECRET` and `TREASURY_DEPOSIT_ADDRESS`.
    pub fn from_env() -> crate::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`Self::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> crate::Result<Self> {
        let mut config = Self::default();
        if let Some(env) = lookup("TREASURY_ENV") {
            config.environment = env.parse()?;
        }
        if let Some(url) = lookup("TREASURY_CLAIM_BASE_URL") {
            config.escrow.claim_base_url = url;
        }
        if let Some(secret) = lookup("TREASURY_WEBHOOK_SECRET") {
            config.webhook.default_secret = secret;
        }
        if let Some(address) = lookup("TREASURY_DEPOSIT_ADDRESS") {
            config.deposit.deposit_address = address;
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent values.
    pub fn validate(&self) -> crate::Result<()> {
        let bad = |msg: &str| Err(TreasuryError::Configuration(msg.to_string()));

        if self.fee.minimum_fee < Decimal::ZERO {
            return bad("fee.minimum_fee must not be negative");
        }
        if self.fee.basis_points > 10_000 {
            return bad("fee.basis_points must be at most 10000");
        }
        if self.limits.min_amount <= Decimal::ZERO {
            return bad("limits.min_amount must be positive");
        }
        if self.limits.max_amount < self.limits.min_amount {
            return bad("limits.max_amount must be at least limits.min_amount");
        }
        if self.limits.max_batch_size == 0 {
            return bad("limits.max_batch_size must be positive");
        }
        if self.escrow.expiry_hours <= 0 {
            return bad("escrow.expiry_hours must be positive");
        }
        if self.escrow.claim_lease_secs <= 0 {
            return bad("escrow.claim_lease_secs must be positive");
        }
        if self.escrow.claim_base_url.is_empty() {
            return bad("escrow.claim_base_url must be set");
        }
        if self.deposit.max_single_deposit <= Decimal::ZERO {
            return bad("deposit.max_single_deposit must be positive");
        }
        if self.webhook.max_attempts == 0 {
            return bad("webhook.max_attempts must be at least 1");
        }
        if self.webhook.queue_capacity == 0 {
            return bad("webhook.queue_capacity must be positive");
        }
        if self.environment.is_production() && self.webhook.default_secret.is_empty() {
            return bad("webhook.default_secret must be set in production");
        }
        Ok(())
    }

    /// Whether a synthetic settlement reference may stand in for a failed
    /// transfer. Never true in production.
    #[must_use]
    pub fn allows_simulated_settlement(&self) -> bool {
        !self.environment.is_production()
    }
}
