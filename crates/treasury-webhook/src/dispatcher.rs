//! # Webhook Dispatcher
//!
//! ```text
//! engine ──publish──▶ WebhookHandle ──try_send──▶ bounded queue ──▶ worker
//!                          │ full                                    │
//!                          ▼                                         ▼
//!                      dead letter                  one task per subscribed endpoint
//!                                                   attempt 1 ─ wait base·2¹ ─ attempt 2 ─ …
//!                                                            │ all failed
//!                                                            ▼
//!                                                        dead letter
//! ```
//!
//! `publish` never blocks and never fails: the financial operation that
//! produced the event has already committed, and a slow or broken
//! receiver must not affect it.
//!
//! Every published event, delivery outcome and dead letter is kept in a
//! per-merchant [`DeliveryLog`], so one merchant's history is never visible
//! to another.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};
use treasury_types::{
    DeliveryId, EndpointId, EventId, EventRecord, EventSink, EventType, MerchantId,
    TreasuryEvent, WebhookConfig,
    constants::{
        DELIVERY_HEADER, EVENT_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER, WEBHOOK_LOG_CAPACITY,
        WEBHOOK_USER_AGENT,
    },
};

use crate::{
    endpoint::{EndpointRegistry, WebhookEndpoint},
    signing,
    transport::{OutboundRequest, WebhookTransport},
};

/// Delivery tuning, derived from [`WebhookConfig`].
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub timeout: Duration,
    pub queue_capacity: usize,
    pub default_secret: String,
}

impl DispatcherSettings {
    /// Delay before retry `retry` (1-based): `base * 2^retry`.
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        self.backoff_base.saturating_mul(1u32 << retry.min(16))
    }
}

impl From<&WebhookConfig> for DispatcherSettings {
    fn from(config: &WebhookConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            timeout: Duration::from_millis(config.timeout_ms),
            queue_capacity: config.queue_capacity.max(1),
            default_secret: config.default_secret.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Delivered,
    Failed,
}

/// Final outcome of delivering one event to one endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryRecord {
    pub id: DeliveryId,
    pub merchant_id: MerchantId,
    pub event_id: EventId,
    pub event_type: EventType,
    pub endpoint_id: EndpointId,
    pub url: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub http_status: Option<u16>,
    pub last_error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// An event that will not be delivered.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub event_id: EventId,
    pub event_type: EventType,
    pub merchant_id: MerchantId,
    /// `None` when the event never reached an endpoint (queue full).
    pub endpoint_id: Option<EndpointId>,
    pub url: Option<String>,
    pub attempts: u32,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Filter and page for event history (newest first).
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub kind: Option<EventType>,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[derive(Debug, Default)]
struct MerchantHistory {
    events: VecDeque<EventRecord>,
    deliveries: VecDeque<DeliveryRecord>,
    dead_letters: VecDeque<DeadLetter>,
}

fn push_bounded<T>(entries: &mut VecDeque<T>, entry: T, capacity: usize) {
    if entries.len() == capacity {
        entries.pop_front();
    }
    entries.push_back(entry);
}

/// Per-merchant webhook history: published events, delivery outcomes and
/// dead letters. Each list keeps the newest `capacity` entries and is
/// returned newest first.
#[derive(Debug)]
pub struct DeliveryLog {
    merchants: DashMap<MerchantId, MerchantHistory>,
    capacity: usize,
}

impl DeliveryLog {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            merchants: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn record_event(&self, record: &EventRecord) {
        let mut history = self.merchants.entry(record.merchant_id).or_default();
        push_bounded(&mut history.events, record.clone(), self.capacity);
    }

    fn record_delivery(&self, record: DeliveryRecord) {
        let mut history = self.merchants.entry(record.merchant_id).or_default();
        push_bounded(&mut history.deliveries, record, self.capacity);
    }

    fn record_dead_letter(&self, letter: DeadLetter) {
        let mut history = self.merchants.entry(letter.merchant_id).or_default();
        push_bounded(&mut history.dead_letters, letter, self.capacity);
    }

    /// Events published for `merchant_id`, optionally of one kind.
    #[must_use]
    pub fn events(&self, merchant_id: MerchantId, query: &EventQuery) -> Vec<EventRecord> {
        let Some(history) = self.merchants.get(&merchant_id) else {
            return Vec::new();
        };
        let events = history
            .events
            .iter()
            .rev()
            .filter(|e| query.kind.is_none_or(|kind| e.event.event_type() == kind))
            .skip(query.offset)
            .cloned();
        match query.limit {
            Some(limit) => events.take(limit).collect(),
            None => events.collect(),
        }
    }

    /// Most recent delivery outcomes across all of the merchant's events.
    #[must_use]
    pub fn recent_deliveries(&self, merchant_id: MerchantId, limit: usize) -> Vec<DeliveryRecord> {
        self.merchants
            .get(&merchant_id)
            .map(|h| h.deliveries.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Delivery outcomes of one of the merchant's events.
    #[must_use]
    pub fn event_deliveries(&self, merchant_id: MerchantId, event_id: EventId) -> Vec<DeliveryRecord> {
        self.merchants
            .get(&merchant_id)
            .map(|h| {
                h.deliveries
                    .iter()
                    .rev()
                    .filter(|d| d.event_id == event_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn dead_letters(&self, merchant_id: MerchantId) -> Vec<DeadLetter> {
        self.merchants
            .get(&merchant_id)
            .map(|h| h.dead_letters.iter().rev().cloned().collect())
            .unwrap_or_default()
    }
}

/// Cheap, cloneable front of the dispatcher. This is the engine's event sink.
#[derive(Clone)]
pub struct WebhookHandle {
    queue: mpsc::Sender<EventRecord>,
    log: Arc<DeliveryLog>,
}

impl WebhookHandle {
    #[must_use]
    pub fn log(&self) -> &DeliveryLog {
        &self.log
    }
}

impl EventSink for WebhookHandle {
    fn publish(&self, merchant_id: MerchantId, event: TreasuryEvent) {
        let record = EventRecord::new(merchant_id, event, Utc::now());
        self.log.record_event(&record);
        if let Err(e) = self.queue.try_send(record) {
            let (reason, record) = match e {
                mpsc::error::TrySendError::Full(record) => ("webhook queue full", record),
                mpsc::error::TrySendError::Closed(record) => ("webhook dispatcher stopped", record),
            };
            error!(
                %merchant_id,
                event_id = %record.id,
                event = %record.event.event_type(),
                reason,
                "Webhook event dropped"
            );
            self.log.record_dead_letter(DeadLetter {
                event_id: record.id,
                event_type: record.event.event_type(),
                merchant_id,
                endpoint_id: None,
                url: None,
                attempts: 0,
                reason: reason.to_string(),
                at: Utc::now(),
            });
        }
    }
}

pub struct WebhookDispatcher {
    registry: Arc<EndpointRegistry>,
    transport: Arc<dyn WebhookTransport>,
    settings: Arc<DispatcherSettings>,
    log: Arc<DeliveryLog>,
}

impl WebhookDispatcher {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        transport: Arc<dyn WebhookTransport>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            registry,
            transport,
            settings: Arc::new(settings),
            log: Arc::new(DeliveryLog::new(WEBHOOK_LOG_CAPACITY)),
        }
    }

    /// Start the worker on the current tokio runtime. It runs until every
    /// handle has been dropped.
    pub fn spawn(self) -> (WebhookHandle, JoinHandle<()>) {
        let (queue, mut jobs) = mpsc::channel(self.settings.queue_capacity);
        let handle = WebhookHandle {
            queue,
            log: self.log.clone(),
        };
        let worker = tokio::spawn(async move {
            debug!(capacity = self.settings.queue_capacity, "Webhook dispatcher started");
            while let Some(record) = jobs.recv().await {
                self.fan_out(record);
            }
            debug!("Webhook dispatcher stopped");
        });
        (handle, worker)
    }

    fn fan_out(&self, record: EventRecord) {
        let kind = record.event.event_type();
        let endpoints = self.registry.subscribers(record.merchant_id, kind);
        if endpoints.is_empty() {
            debug!(merchant_id = %record.merchant_id, event = %kind, "No webhook subscribers");
            return;
        }
        let body = match record.body() {
            Ok(body) => Arc::new(body),
            Err(e) => {
                error!(event_id = %record.id, error = %e, "Webhook body could not be serialized");
                return;
            }
        };
        let record = Arc::new(record);
        for endpoint in endpoints {
            let delivery = Delivery {
                endpoint,
                record: record.clone(),
                body: body.clone(),
                transport: self.transport.clone(),
                settings: self.settings.clone(),
                log: self.log.clone(),
            };
            tokio::spawn(delivery.run());
        }
    }
}

/// One event on its way to one endpoint.
struct Delivery {
    endpoint: WebhookEndpoint,
    record: Arc<EventRecord>,
    body: Arc<String>,
    transport: Arc<dyn WebhookTransport>,
    settings: Arc<DispatcherSettings>,
    log: Arc<DeliveryLog>,
}

impl Delivery {
    async fn run(self) {
        let id = DeliveryId::new();
        let kind = self.record.event.event_type();
        let secret = self
            .endpoint
            .secret
            .as_deref()
            .unwrap_or(&self.settings.default_secret);

        let mut http_status = None;
        let mut last_error = None;
        for attempt in 1..=self.settings.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.settings.backoff(attempt - 1)).await;
            }
            let timestamp = Utc::now().timestamp();
            let request = OutboundRequest {
                url: self.endpoint.url.clone(),
                headers: vec![
                    ("Content-Type", "application/json".to_string()),
                    ("User-Agent", WEBHOOK_USER_AGENT.to_string()),
                    (SIGNATURE_HEADER, signing::sign(secret, timestamp, &self.body)),
                    (EVENT_HEADER, kind.as_str().to_string()),
                    (DELIVERY_HEADER, id.to_string()),
                    (TIMESTAMP_HEADER, timestamp.to_string()),
                ],
                body: self.body.to_string(),
            };
            match self.transport.post(&request, self.settings.timeout).await {
                Ok(status) if (200..300).contains(&status) => {
                    info!(
                        delivery_id = %id,
                        event = %kind,
                        url = %self.endpoint.url,
                        attempt,
                        status,
                        "Webhook delivered"
                    );
                    self.finish(id, DeliveryStatus::Delivered, attempt, Some(status), None);
                    return;
                }
                Ok(status) => {
                    http_status = Some(status);
                    last_error = Some(format!("HTTP {status}"));
                }
                Err(e) => last_error = Some(e.to_string()),
            }
            warn!(
                delivery_id = %id,
                event = %kind,
                url = %self.endpoint.url,
                attempt,
                max_attempts = self.settings.max_attempts,
                error = last_error.as_deref().unwrap_or_default(),
                "Webhook attempt failed"
            );
        }

        let attempts = self.settings.max_attempts;
        let reason = last_error.unwrap_or_default();
        error!(
            delivery_id = %id,
            merchant_id = %self.record.merchant_id,
            event = %kind,
            url = %self.endpoint.url,
            attempts,
            error = %reason,
            "Webhook delivery failed"
        );
        self.log.record_dead_letter(DeadLetter {
            event_id: self.record.id,
            event_type: kind,
            merchant_id: self.record.merchant_id,
            endpoint_id: Some(self.endpoint.id),
            url: Some(self.endpoint.url.clone()),
            attempts,
            reason: reason.clone(),
            at: Utc::now(),
        });
        self.finish(id, DeliveryStatus::Failed, attempts, http_status, Some(reason));
    }

    fn finish(
        &self,
        id: DeliveryId,
        status: DeliveryStatus,
        attempts: u32,
        http_status: Option<u16>,
        last_error: Option<String>,
    ) {
        self.log.record_delivery(DeliveryRecord {
            id,
            merchant_id: self.record.merchant_id,
            event_id: self.record.id,
            event_type: self.record.event.event_type(),
            endpoint_id: self.endpoint.id,
            url: self.endpoint.url.clone(),
            status,
            attempts,
            http_status,
            last_error,
            completed_at: Utc::now(),
        });
    }
}
