//! Assembles a [`TreasuryEngine`] from configuration and collaborators.

use std::{sync::Arc, time::Duration};

use tracing::info;
use treasury_escrow::{
    BatchCoordinator, Clock, DepositHandler, DepositVerifier, ExpirySweeper, PayoutEscrow,
    SettlementExecutor, SimulatedExecutor, SystemClock, TrustReportedVerifier,
};
use treasury_ledger::{BalanceStore, BasisPointsFeeCalculator, MemoryStore, TreasuryStore};
use treasury_types::{EngineConfig, EventSink, Result, TreasuryError};
use treasury_webhook::{
    DispatcherSettings, EndpointRegistry, ReqwestTransport, WebhookDispatcher, WebhookTransport,
};

use crate::engine::TreasuryEngine;

/// Builder for [`TreasuryEngine`].
///
/// Anything not supplied falls back to a default that is only acceptable
/// outside production: an in-memory store, simulated settlement, and
/// deposits trusted at face value. In production the store, settlement
/// executor and deposit verifier are mandatory.
pub struct TreasuryEngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn TreasuryStore>>,
    executor: Option<Arc<dyn SettlementExecutor>>,
    verifier: Option<Arc<dyn DepositVerifier>>,
    transport: Option<Arc<dyn WebhookTransport>>,
    events: Option<Arc<dyn EventSink>>,
    clock: Option<Arc<dyn Clock>>,
    sweeper: bool,
}

impl TreasuryEngineBuilder {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            executor: None,
            verifier: None,
            transport: None,
            events: None,
            clock: None,
            sweeper: true,
        }
    }

    #[must_use]
    pub fn store(mut self, store: Arc<dyn TreasuryStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn executor(mut self, executor: Arc<dyn SettlementExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    #[must_use]
    pub fn deposit_verifier(mut self, verifier: Arc<dyn DepositVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// HTTP transport for webhooks. Defaults to `reqwest`.
    #[must_use]
    pub fn webhook_transport(mut self, transport: Arc<dyn WebhookTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Send events to `sink` instead of the webhook dispatcher.
    #[must_use]
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Do not start the background expiry sweeper. Expiry is still applied
    /// whenever a payout is read.
    #[must_use]
    pub fn without_sweeper(mut self) -> Self {
        self.sweeper = false;
        self
    }

    /// Validate the configuration, wire the components and start the
    /// background tasks.
    ///
    /// # Errors
    /// `Configuration` for an invalid config, a missing production
    /// collaborator, or when called outside a tokio runtime.
    pub fn build(self) -> Result<TreasuryEngine> {
        self.config.validate()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(TreasuryError::Configuration(
                "the treasury engine must be built inside a tokio runtime".into(),
            ));
        }
        let environment = self.config.environment;
        let config = Arc::new(self.config);

        let store: Arc<dyn TreasuryStore> = match self.store {
            Some(store) => store,
            None if environment.is_production() => {
                return Err(TreasuryError::Configuration(
                    "a durable store is required in production".into(),
                ));
            }
            None => Arc::new(MemoryStore::new()),
        };
        let executor: Arc<dyn SettlementExecutor> = match self.executor {
            Some(executor) => executor,
            None => Arc::new(SimulatedExecutor::new(environment)?),
        };
        let verifier: Arc<dyn DepositVerifier> = match self.verifier {
            Some(verifier) => verifier,
            None if environment.is_production() => {
                return Err(TreasuryError::Configuration(
                    "a deposit verifier is required in production".into(),
                ));
            }
            None => Arc::new(TrustReportedVerifier),
        };
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };

        let registry = Arc::new(EndpointRegistry::new());
        let (events, webhooks) = match self.events {
            Some(sink) => (sink, None),
            None => {
                let transport: Arc<dyn WebhookTransport> = match self.transport {
                    Some(transport) => transport,
                    None => Arc::new(ReqwestTransport::new()),
                };
                let dispatcher = WebhookDispatcher::new(
                    registry.clone(),
                    transport,
                    DispatcherSettings::from(&config.webhook),
                );
                let (handle, _worker) = dispatcher.spawn();
                let sink: Arc<dyn EventSink> = Arc::new(handle.clone());
                (sink, Some(handle))
            }
        };

        let balances = BalanceStore::new(
            store.clone(),
            Arc::new(BasisPointsFeeCalculator::from(&config.fee)),
        );
        let escrow = PayoutEscrow::new(
            store,
            balances.clone(),
            executor,
            events.clone(),
            clock.clone(),
            config.clone(),
        );
        let batches = BatchCoordinator::new(escrow.clone());
        let deposits = DepositHandler::new(
            balances.clone(),
            verifier,
            events,
            clock.clone(),
            config.clone(),
        );

        let sweeper = (self.sweeper && config.escrow.sweep_interval_secs > 0).then(|| {
            ExpirySweeper::new(
                escrow.clone(),
                Duration::from_secs(config.escrow.sweep_interval_secs),
            )
            .spawn()
        });

        info!(
            environment = ?environment,
            fee_bps = config.fee.basis_points,
            expiry_hours = config.escrow.expiry_hours,
            sweeper = sweeper.is_some(),
            "Treasury engine ready"
        );
        Ok(TreasuryEngine {
            config,
            balances,
            escrow,
            batches,
            deposits,
            registry,
            webhooks,
            clock,
            sweeper,
        })
    }
}
