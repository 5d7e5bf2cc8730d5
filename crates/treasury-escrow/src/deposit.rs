//! Deposit Handler: turns a reported on-chain deposit into a `credit`.
//!
//! The merchant reports the amount and transaction reference. A
//! [`DepositVerifier`] looks the transaction up; only a confirmed
//! transaction is credited in production. Each reference credits once,
//! to one merchant: the store refuses a reference another merchant already
//! used.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use treasury_ledger::BalanceStore;
use treasury_types::{
    DepositConfirmed, EngineConfig, EventSink, MerchantBalance, MerchantId, Result, TreasuryError,
    TreasuryEvent, constants::MIN_TX_REFERENCE_LEN,
};

use crate::{clock::Clock, validation};

/// What the chain says about a reported deposit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// The transaction landed and moved `amount` to the treasury.
    Confirmed { amount: Decimal },
    /// No such transaction.
    NotFound,
    /// The lookup itself failed.
    Failed(String),
}

#[async_trait]
pub trait DepositVerifier: Send + Sync {
    async fn verify(&self, tx_reference: &str, reported: Decimal) -> Verification;
}

/// Accepts every reported deposit at face value. Non-production only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrustReportedVerifier;

#[async_trait]
impl DepositVerifier for TrustReportedVerifier {
    async fn verify(&self, _tx_reference: &str, reported: Decimal) -> Verification {
        Verification::Confirmed { amount: reported }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositRequest {
    pub amount: Decimal,
    pub tx_reference: String,
}

#[derive(Debug, Clone)]
pub struct DepositOutcome {
    pub balance: MerchantBalance,
    /// Amount actually credited (the verified amount when they differ).
    pub credited: Decimal,
    /// The reference was credited before; nothing changed.
    pub replayed: bool,
}

/// Where and how a merchant should send funds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DepositInstructions {
    pub merchant_id: MerchantId,
    pub deposit_address: String,
    pub currency: String,
    pub network: String,
    pub max_single_deposit: Decimal,
    pub balance: MerchantBalance,
}

#[derive(Clone)]
pub struct DepositHandler {
    balances: BalanceStore,
    verifier: Arc<dyn DepositVerifier>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    config: Arc<EngineConfig>,
}

impl DepositHandler {
    pub fn new(
        balances: BalanceStore,
        verifier: Arc<dyn DepositVerifier>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            balances,
            verifier,
            events,
            clock,
            config,
        }
    }

    /// Verify and credit a reported deposit.
    ///
    /// # Errors
    /// - `InvalidAmount` / `InvalidRequest` for malformed input
    /// - `DepositAboveCeiling` over the single-deposit limit
    /// - `DepositUnverified` when the transaction cannot be confirmed
    pub async fn record_deposit(&self, merchant_id: MerchantId, request: DepositRequest) -> Result<DepositOutcome> {
        let DepositRequest { amount, tx_reference } = request;
        let tx_reference = tx_reference.trim().to_string();
        self.validate(amount, &tx_reference)?;

        let credited = match self.verifier.verify(&tx_reference, amount).await {
            Verification::Confirmed { amount: verified } => {
                if verified != amount {
                    warn!(
                        %merchant_id,
                        %tx_reference,
                        reported = %amount,
                        %verified,
                        "Deposit amount mismatch, crediting verified amount"
                    );
                }
                verified
            }
            Verification::NotFound => {
                return Err(TreasuryError::DepositUnverified {
                    reason: format!("transaction {tx_reference} not found"),
                });
            }
            Verification::Failed(reason) if self.config.environment.is_production() => {
                return Err(TreasuryError::DepositUnverified { reason });
            }
            Verification::Failed(reason) => {
                warn!(%merchant_id, %tx_reference, %reason, "Deposit verification failed, accepting reported amount (non-production)");
                amount
            }
        };
        self.validate(credited, &tx_reference)?;

        let credit = self
            .balances
            .credit_deposit(merchant_id, credited, &tx_reference, self.clock.now())
            .await?;
        if !credit.replayed {
            info!(%merchant_id, %credited, %tx_reference, "Deposit recorded");
            self.events.publish(
                merchant_id,
                TreasuryEvent::DepositConfirmed(DepositConfirmed {
                    amount: credited,
                    tx_reference,
                    balance_after: credit.balance.available,
                }),
            );
        }
        Ok(DepositOutcome {
            balance: credit.balance,
            credited,
            replayed: credit.replayed,
        })
    }

    /// Where to send funds, with the merchant's current balance.
    pub async fn deposit_instructions(&self, merchant_id: MerchantId) -> Result<DepositInstructions> {
        Ok(DepositInstructions {
            merchant_id,
            deposit_address: self.config.deposit.deposit_address.clone(),
            currency: treasury_types::constants::SETTLEMENT_CURRENCY.to_string(),
            network: self.config.deposit.network.clone(),
            max_single_deposit: self.config.deposit.max_single_deposit,
            balance: self.balances.balance(merchant_id).await?,
        })
    }

    fn validate(&self, amount: Decimal, tx_reference: &str) -> Result<()> {
        validation::validate_precision(amount)?;
        let ceiling = self.config.deposit.max_single_deposit;
        if amount > ceiling {
            return Err(TreasuryError::DepositAboveCeiling { amount, ceiling });
        }
        if tx_reference.len() < MIN_TX_REFERENCE_LEN {
            return Err(TreasuryError::InvalidRequest {
                reason: format!("transaction reference must be at least {MIN_TX_REFERENCE_LEN} characters"),
            });
        }
        Ok(())
    }
}
