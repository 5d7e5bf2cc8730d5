//! Background expiry sweeper.
//!
//! Expiry is already enforced lazily on every read, so the sweeper only
//! makes sure funds of payouts nobody looks at again are released and
//! `payout.expired` goes out without a visit to the claim page.

use std::time::Duration;

use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, error, info};
use treasury_types::Result;

use crate::escrow::PayoutEscrow;

/// Overdue payouts processed per tick.
pub const SWEEP_BATCH_LIMIT: usize = 500;

pub struct ExpirySweeper {
    escrow: PayoutEscrow,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(escrow: PayoutEscrow, interval: Duration) -> Self {
        Self { escrow, interval }
    }

    /// Run one sweep. Returns how many payouts expired.
    pub async fn run_once(&self) -> Result<usize> {
        self.escrow.sweep_expired(SWEEP_BATCH_LIMIT).await
    }

    /// Start sweeping on the current tokio runtime. The task runs once
    /// immediately, then every `interval`, until the handle is shut down or
    /// dropped.
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown, mut stop) = watch::channel(false);
        let task = tokio::spawn(async move {
            info!(interval_secs = self.interval.as_secs(), "Expiry sweeper started");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = ticker.tick() => match self.run_once().await {
                        Ok(0) => debug!("Expiry sweep found nothing"),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Expiry sweep failed"),
                    },
                }
            }
            info!("Expiry sweeper stopped");
        });
        SweeperHandle {
            shutdown,
            task: Some(task),
        }
    }
}

/// Owns a running sweeper. Dropping it stops the task.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for the in-flight sweep to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use rust_decimal::Decimal;
    use treasury_ledger::{BalanceStore, BasisPointsFeeCalculator, MemoryStore, TreasuryStore};
    use treasury_types::{EngineConfig, EventType, MerchantId, PayoutRequest, PayoutStatus, RecordingSink};

    use super::*;
    use crate::{clock::ManualClock, executor::MockExecutor};

    #[tokio::test]
    async fn spawned_sweeper_expires_overdue_payouts() {
        let config = EngineConfig::development();
        let store: Arc<dyn TreasuryStore> = Arc::new(MemoryStore::new());
        let balances = BalanceStore::new(store.clone(), Arc::new(BasisPointsFeeCalculator::from(&config.fee)));
        let clock = Arc::new(ManualClock::default());
        let events = Arc::new(RecordingSink::new());
        let merchant = MerchantId::new();
        balances.credit(merchant, Decimal::new(100, 0), "Initial funding", Utc::now()).await.unwrap();
        let escrow = PayoutEscrow::new(
            store,
            balances,
            Arc::new(MockExecutor::new()),
            events.clone(),
            clock.clone(),
            Arc::new(config),
        );
        let payout = escrow
            .create_payout(merchant, PayoutRequest::new("a@x.com", Decimal::new(10, 0)))
            .await
            .unwrap();
        clock.advance(chrono::Duration::days(8));

        let handle = ExpirySweeper::new(escrow.clone(), Duration::from_millis(10)).spawn();
        for _ in 0..100 {
            if events.count(EventType::PayoutExpired) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;

        assert_eq!(events.count(EventType::PayoutExpired), 1);
        assert_eq!(escrow.payout(payout.id).await.unwrap().status, PayoutStatus::Expired);
    }
}
