//! The [`TreasuryEngine`] facade: every boundary operation in one place.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::error;
use treasury_escrow::{
    BatchCoordinator, Clock, DepositHandler, DepositRequest, PayoutEscrow, SweeperHandle,
    sweeper::SWEEP_BATCH_LIMIT,
};
use treasury_ledger::{BalanceStore, PayoutQuery, TransactionQuery};
use treasury_types::{
    BatchId, BatchItem, ClaimToken, EndpointId, EngineConfig, EventId, EventRecord, EventType,
    MerchantBalance, MerchantId, Payout, PayoutBatch, PayoutId, PayoutRequest, Result,
    TreasuryError, TreasuryTransaction, verify_chain,
};
use treasury_webhook::{
    DeadLetter, DeliveryLog, DeliveryRecord, EndpointRegistry, EventFilter, EventQuery,
    WebhookEndpoint, WebhookHandle,
};

use crate::{
    api::{
        BatchReceipt, ClaimReceipt, DepositInstructions, DepositReceipt, PayoutReceipt,
        PublicPayout,
    },
    builder::TreasuryEngineBuilder,
};

pub struct TreasuryEngine {
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) balances: BalanceStore,
    pub(crate) escrow: PayoutEscrow,
    pub(crate) batches: BatchCoordinator,
    pub(crate) deposits: DepositHandler,
    pub(crate) registry: Arc<EndpointRegistry>,
    pub(crate) webhooks: Option<WebhookHandle>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) sweeper: Option<SweeperHandle>,
}

impl TreasuryEngine {
    #[must_use]
    pub fn builder(config: EngineConfig) -> TreasuryEngineBuilder {
        TreasuryEngineBuilder::new(config)
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // =================================================================
    // Balances
    // =================================================================

    pub async fn balance(&self, merchant_id: MerchantId) -> Result<MerchantBalance> {
        self.balances.balance(merchant_id).await
    }

    /// Journal rows, newest first.
    pub async fn transactions(
        &self,
        merchant_id: MerchantId,
        query: &TransactionQuery,
    ) -> Result<Vec<TreasuryTransaction>> {
        self.balances.transactions(merchant_id, query).await
    }

    /// Check that the merchant's journal hash chain is intact.
    ///
    /// # Errors
    /// `LedgerInvariantViolation` naming the first row that does not chain.
    pub async fn verify_journal(&self, merchant_id: MerchantId) -> Result<usize> {
        let mut journal = self
            .balances
            .transactions(merchant_id, &TransactionQuery::default())
            .await?;
        journal.reverse();
        if let Some(index) = verify_chain(&journal) {
            error!(%merchant_id, index, "CRITICAL: journal hash chain broken");
            return Err(TreasuryError::LedgerInvariantViolation {
                reason: format!("journal row {index} does not chain to its predecessor"),
            });
        }
        Ok(journal.len())
    }

    /// Credit a merchant without an on-chain reference (operator top-up).
    pub async fn credit(&self, merchant_id: MerchantId, amount: Decimal, note: &str) -> Result<MerchantBalance> {
        self.balances
            .credit(merchant_id, amount, note, self.clock.now())
            .await
    }

    #[must_use]
    pub fn calculate_fee(&self, amount: Decimal) -> Decimal {
        self.balances.calculate_fee(amount)
    }

    // =================================================================
    // Deposits
    // =================================================================

    pub async fn record_deposit(&self, merchant_id: MerchantId, request: DepositRequest) -> Result<DepositReceipt> {
        self.deposits
            .record_deposit(merchant_id, request)
            .await
            .map(DepositReceipt::from)
    }

    pub async fn deposit_instructions(&self, merchant_id: MerchantId) -> Result<DepositInstructions> {
        self.deposits.deposit_instructions(merchant_id).await
    }

    // =================================================================
    // Payouts
    // =================================================================

    pub async fn create_payout(&self, merchant_id: MerchantId, request: PayoutRequest) -> Result<PayoutReceipt> {
        let payout = self.escrow.create_payout(merchant_id, request).await?;
        Ok(PayoutReceipt::from(&payout))
    }

    pub async fn create_batch(&self, merchant_id: MerchantId, items: Vec<BatchItem>) -> Result<BatchReceipt> {
        let outcome = self.batches.create_batch(merchant_id, items).await?;
        Ok(BatchReceipt::from(&outcome))
    }

    /// Merchant view of one payout. Fails with `PayoutNotFound` for another
    /// merchant's payout.
    pub async fn payout(&self, merchant_id: MerchantId, id: PayoutId) -> Result<Payout> {
        let payout = self.escrow.payout(id).await?;
        if payout.merchant_id != merchant_id {
            return Err(TreasuryError::PayoutNotFound);
        }
        Ok(payout)
    }

    pub async fn payouts(&self, merchant_id: MerchantId, query: &PayoutQuery) -> Result<Vec<Payout>> {
        self.escrow.payouts(merchant_id, query).await
    }

    pub async fn batch(&self, merchant_id: MerchantId, id: BatchId) -> Result<PayoutBatch> {
        self.escrow
            .batch(id)
            .await?
            .filter(|batch| batch.merchant_id == merchant_id)
            .ok_or_else(|| TreasuryError::InvalidRequest {
                reason: format!("unknown batch {id}"),
            })
    }

    /// Public claim-page view. Reveals neither the merchant nor the token.
    pub async fn public_payout(&self, token: &str) -> Result<PublicPayout> {
        self.escrow.public_view(&ClaimToken::from_string(token)).await
    }

    pub async fn claim(&self, token: &str, wallet: &str) -> Result<ClaimReceipt> {
        let outcome = self
            .escrow
            .claim(&ClaimToken::from_string(token), wallet)
            .await?;
        Ok(ClaimReceipt::from(&outcome))
    }

    /// Expire overdue payouts now, without waiting for the sweeper.
    pub async fn sweep_expired(&self) -> Result<usize> {
        self.escrow.sweep_expired(SWEEP_BATCH_LIMIT).await
    }

    // =================================================================
    // Webhooks
    // =================================================================

    pub fn register_webhook(
        &self,
        merchant_id: MerchantId,
        url: &str,
        events: EventFilter,
        secret: Option<String>,
    ) -> Result<WebhookEndpoint> {
        self.registry.register(merchant_id, url, events, secret)
    }

    #[must_use]
    pub fn webhooks(&self, merchant_id: MerchantId) -> Vec<WebhookEndpoint> {
        self.registry.list(merchant_id)
    }

    /// Enable or disable one of the merchant's endpoints.
    pub fn set_webhook_active(&self, merchant_id: MerchantId, id: EndpointId, active: bool) -> Result<()> {
        self.owned_endpoint(merchant_id, id)?;
        self.registry.set_active(id, active);
        Ok(())
    }

    pub fn remove_webhook(&self, merchant_id: MerchantId, id: EndpointId) -> Result<()> {
        self.owned_endpoint(merchant_id, id)?;
        self.registry.remove(id);
        Ok(())
    }

    fn owned_endpoint(&self, merchant_id: MerchantId, id: EndpointId) -> Result<()> {
        if self.registry.list(merchant_id).iter().any(|e| e.id == id) {
            Ok(())
        } else {
            Err(TreasuryError::InvalidRequest {
                reason: format!("unknown webhook endpoint {id}"),
            })
        }
    }

    fn webhook_log(&self) -> Option<&DeliveryLog> {
        self.webhooks.as_ref().map(WebhookHandle::log)
    }

    /// Events published for the merchant, newest first. Empty when events
    /// go to a custom sink.
    #[must_use]
    pub fn webhook_events(
        &self,
        merchant_id: MerchantId,
        kind: Option<EventType>,
        limit: Option<usize>,
        offset: usize,
    ) -> Vec<EventRecord> {
        let query = EventQuery { kind, limit, offset };
        self.webhook_log()
            .map(|log| log.events(merchant_id, &query))
            .unwrap_or_default()
    }

    /// The merchant's most recent delivery outcomes, newest first.
    #[must_use]
    pub fn webhook_deliveries(&self, merchant_id: MerchantId, limit: usize) -> Vec<DeliveryRecord> {
        self.webhook_log()
            .map(|log| log.recent_deliveries(merchant_id, limit))
            .unwrap_or_default()
    }

    /// Delivery outcomes of one of the merchant's events.
    #[must_use]
    pub fn webhook_event_deliveries(&self, merchant_id: MerchantId, event_id: EventId) -> Vec<DeliveryRecord> {
        self.webhook_log()
            .map(|log| log.event_deliveries(merchant_id, event_id))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn webhook_dead_letters(&self, merchant_id: MerchantId) -> Vec<DeadLetter> {
        self.webhook_log()
            .map(|log| log.dead_letters(merchant_id))
            .unwrap_or_default()
    }

    /// Stop background tasks, waiting for an in-flight sweep.
    pub async fn shutdown(mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.shutdown().await;
        }
    }
}
