//! Batch Coordinator: many payouts, all or nothing.
//!
//! ```text
//! validate every item ──▶ pre-flight: Σ(amount + fee) ≤ available?
//!        │                          │ no ─▶ BatchShortfall (nothing changed)
//!        ▼                          ▼ yes
//! reserve item 0, 1, … n-1 ── any fails ─▶ release 0..i-1, BatchReservationFailed
//!        │ all ok
//!        ▼
//! persist batch + payouts ── fails ─▶ release all
//!        │
//!        ▼
//! payout.created × n, batch.created
//! ```
//!
//! The pre-flight check is advisory: a concurrent debit can still land
//! between it and the reservations. The per-item reserve and rollback is
//! what keeps the batch atomic.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use treasury_types::{
    BatchCreated, BatchId, BatchItem, BatchStatus, IdempotencyKey, MerchantId, Payout, PayoutBatch,
    Result, TreasuryError, TreasuryEvent,
};

use crate::escrow::{PayoutDraft, PayoutEscrow};

/// A created batch and its payouts, in request order.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub batch: PayoutBatch,
    pub payouts: Vec<Payout>,
}

#[derive(Clone)]
pub struct BatchCoordinator {
    escrow: PayoutEscrow,
}

impl BatchCoordinator {
    pub fn new(escrow: PayoutEscrow) -> Self {
        Self { escrow }
    }

    /// Create every payout in `items` or none of them.
    ///
    /// # Errors
    /// - `EmptyBatch`, `BatchTooLarge`, `InvalidBatchItem { index }` before
    ///   any side effect
    /// - `BatchShortfall` when the pre-flight total exceeds `available`
    /// - `BatchReservationFailed { index }` when a concurrent debit made
    ///   item `index` unaffordable; earlier reservations are rolled back
    pub async fn create_batch(&self, merchant_id: MerchantId, items: Vec<BatchItem>) -> Result<BatchOutcome> {
        let max = self.escrow.config.limits.max_batch_size;
        if items.is_empty() {
            return Err(TreasuryError::EmptyBatch);
        }
        if items.len() > max {
            return Err(TreasuryError::BatchTooLarge {
                count: items.len(),
                max,
            });
        }

        let drafts = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                self.escrow
                    .draft(&item.email, item.amount, None, item.memo, item.metadata)
                    .map_err(|e| TreasuryError::InvalidBatchItem {
                        index,
                        reason: e.to_string(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let total_amount: Decimal = drafts.iter().map(|d| d.amount).sum();
        let total_fees: Decimal = drafts.iter().map(|d| d.fee).sum();
        let needed = total_amount + total_fees;

        let available = self.escrow.balances.balance(merchant_id).await?.available;
        if needed > available {
            info!(%merchant_id, %needed, %available, "Batch refused by pre-flight");
            return Err(TreasuryError::BatchShortfall {
                needed,
                available,
                shortfall: needed - available,
            });
        }

        let now = self.escrow.clock.now();
        let batch = PayoutBatch {
            id: BatchId::new(),
            merchant_id,
            total_amount,
            total_fees,
            count: drafts.len(),
            status: BatchStatus::Created,
            created_at: now,
        };

        self.reserve_all(&batch, &drafts, now).await?;

        let payouts = match self
            .escrow
            .issue(merchant_id, Some(batch.clone()), drafts.clone(), now)
            .await
        {
            Ok(payouts) => payouts,
            Err(e) => {
                error!(%merchant_id, batch_id = %batch.id, error = %e, "Batch persist failed, rolling back");
                self.roll_back(merchant_id, &drafts, now).await;
                return Err(e);
            }
        };

        info!(
            %merchant_id,
            batch_id = %batch.id,
            count = batch.count,
            total_amount = %batch.total_amount,
            total_fees = %batch.total_fees,
            "Batch created"
        );
        self.escrow.events.publish(
            merchant_id,
            TreasuryEvent::BatchCreated(BatchCreated {
                batch_id: batch.id,
                count: batch.count,
                total_amount: batch.total_amount,
                total_fees: batch.total_fees,
            }),
        );
        Ok(BatchOutcome { batch, payouts })
    }

    /// Reserve each draft in order. On the first failure, release what was
    /// reserved and report the failing index.
    async fn reserve_all(&self, batch: &PayoutBatch, drafts: &[PayoutDraft], now: DateTime<Utc>) -> Result<()> {
        let merchant_id = batch.merchant_id;
        for (index, draft) in drafts.iter().enumerate() {
            let reserved = self
                .escrow
                .balances
                .reserve(
                    merchant_id,
                    draft.amount,
                    draft.fee,
                    IdempotencyKey::for_batch_item(batch.id, index),
                    Some(draft.id),
                    now,
                )
                .await;
            if let Err(e) = reserved {
                warn!(%merchant_id, batch_id = %batch.id, index, error = %e, "Batch reservation failed, rolling back");
                self.roll_back(merchant_id, &drafts[..index], now).await;
                return Err(match e {
                    TreasuryError::InsufficientBalance { needed, available } => {
                        TreasuryError::BatchReservationFailed {
                            index,
                            needed,
                            available,
                        }
                    }
                    other => other,
                });
            }
        }
        Ok(())
    }

    async fn roll_back(&self, merchant_id: MerchantId, reserved: &[PayoutDraft], now: DateTime<Utc>) {
        for draft in reserved.iter().rev() {
            self.escrow
                .release_quietly(merchant_id, draft.amount, draft.fee, draft.id, now)
                .await;
        }
    }
}
