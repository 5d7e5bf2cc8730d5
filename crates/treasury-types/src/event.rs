//! Outbound events.
//!
//! Every balance- or payout-affecting operation produces a [`TreasuryEvent`].
//! The engine hands events to an [`EventSink`]; publishing never blocks and
//! never fails the operation that produced the event.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{BatchId, EventId, MerchantId, PayoutId};

/// Event kind, as it appears in the `event` field and the event header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "payout.created")]
    PayoutCreated,
    #[serde(rename = "payout.claimed")]
    PayoutClaimed,
    #[serde(rename = "payout.expired")]
    PayoutExpired,
    #[serde(rename = "payout.failed")]
    PayoutFailed,
    #[serde(rename = "deposit.confirmed")]
    DepositConfirmed,
    #[serde(rename = "batch.created")]
    BatchCreated,
}

impl EventType {
    pub const ALL: [Self; 6] = [
        Self::PayoutCreated,
        Self::PayoutClaimed,
        Self::PayoutExpired,
        Self::PayoutFailed,
        Self::DepositConfirmed,
        Self::BatchCreated,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PayoutCreated => "payout.created",
            Self::PayoutClaimed => "payout.claimed",
            Self::PayoutExpired => "payout.expired",
            Self::PayoutFailed => "payout.failed",
            Self::DepositConfirmed => "deposit.confirmed",
            Self::BatchCreated => "batch.created",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutCreated {
    pub payout_id: PayoutId,
    pub email: String,
    pub amount: Decimal,
    pub fee: Decimal,
    pub currency: String,
    pub claim_url: String,
    pub expires_at: DateTime<Utc>,
    pub batch_id: Option<BatchId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutClaimed {
    pub payout_id: PayoutId,
    pub amount: Decimal,
    pub fee: Decimal,
    pub currency: String,
    pub recipient_wallet: String,
    pub tx_signature: String,
    pub claimed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutExpired {
    pub payout_id: PayoutId,
    pub amount: Decimal,
    pub fee: Decimal,
    pub expired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutFailed {
    pub payout_id: PayoutId,
    pub amount: Decimal,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositConfirmed {
    pub amount: Decimal,
    pub tx_reference: String,
    /// `available` after the credit.
    pub balance_after: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCreated {
    pub batch_id: BatchId,
    pub count: usize,
    pub total_amount: Decimal,
    pub total_fees: Decimal,
}

/// One event with its fixed per-kind schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum TreasuryEvent {
    #[serde(rename = "payout.created")]
    PayoutCreated(PayoutCreated),
    #[serde(rename = "payout.claimed")]
    PayoutClaimed(PayoutClaimed),
    #[serde(rename = "payout.expired")]
    PayoutExpired(PayoutExpired),
    #[serde(rename = "payout.failed")]
    PayoutFailed(PayoutFailed),
    #[serde(rename = "deposit.confirmed")]
    DepositConfirmed(DepositConfirmed),
    #[serde(rename = "batch.created")]
    BatchCreated(BatchCreated),
}

impl TreasuryEvent {
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            Self::PayoutCreated(_) => EventType::PayoutCreated,
            Self::PayoutClaimed(_) => EventType::PayoutClaimed,
            Self::PayoutExpired(_) => EventType::PayoutExpired,
            Self::PayoutFailed(_) => EventType::PayoutFailed,
            Self::DepositConfirmed(_) => EventType::DepositConfirmed,
            Self::BatchCreated(_) => EventType::BatchCreated,
        }
    }

    /// The payout this event concerns, if any.
    #[must_use]
    pub fn payout_id(&self) -> Option<PayoutId> {
        match self {
            Self::PayoutCreated(e) => Some(e.payout_id),
            Self::PayoutClaimed(e) => Some(e.payout_id),
            Self::PayoutExpired(e) => Some(e.payout_id),
            Self::PayoutFailed(e) => Some(e.payout_id),
            Self::DepositConfirmed(_) | Self::BatchCreated(_) => None,
        }
    }
}

/// An event addressed to one merchant, as queued for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: EventId,
    pub merchant_id: MerchantId,
    pub event: TreasuryEvent,
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    #[must_use]
    pub fn new(merchant_id: MerchantId, event: TreasuryEvent, created_at: DateTime<Utc>) -> Self {
        Self {
            id: EventId::new(),
            merchant_id,
            event,
            created_at,
        }
    }

    /// The canonical delivery body: `{"event": .., "data": .., "timestamp": ..}`
    /// with `timestamp` in Unix seconds.
    pub fn body(&self) -> crate::Result<String> {
        #[derive(Serialize)]
        struct Body<'a> {
            #[serde(flatten)]
            event: &'a TreasuryEvent,
            timestamp: i64,
        }
        Ok(serde_json::to_string(&Body {
            event: &self.event,
            timestamp: self.created_at.timestamp(),
        })?)
    }
}

/// Where engine components hand their events.
///
/// `publish` must return quickly and must not fail: delivery problems are the
/// sink's to handle and log.
pub trait EventSink: Send + Sync {
    fn publish(&self, merchant_id: MerchantId, event: TreasuryEvent);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _merchant_id: MerchantId, _event: TreasuryEvent) {}
}

/// Sink that keeps every event in memory for assertions.
#[cfg(any(test, feature = "test-helpers"))]
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: std::sync::Mutex<Vec<(MerchantId, TreasuryEvent)>>,
}

#[cfg(any(test, feature = "test-helpers"))]
impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything published so far.
    pub fn events(&self) -> Vec<(MerchantId, TreasuryEvent)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Number of published events of `kind`.
    pub fn count(&self, kind: EventType) -> usize {
        self.events()
            .iter()
            .filter(|(_, e)| e.event_type() == kind)
            .count()
    }
}

#[cfg(any(test, feature = "test-helpers"))]
impl EventSink for RecordingSink {
    fn publish(&self, merchant_id: MerchantId, event: TreasuryEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push((merchant_id, event));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deposit() -> TreasuryEvent {
        TreasuryEvent::DepositConfirmed(DepositConfirmed {
            amount: Decimal::new(10_000, 2),
            tx_reference: "5xYzAbCdEfGh".into(),
            balance_after: Decimal::new(10_000, 2),
        })
    }

    #[test]
    fn body_has_event_data_timestamp() {
        let record = EventRecord::new(MerchantId::new(), deposit(), Utc::now());
        let body: serde_json::Value = serde_json::from_str(&record.body().unwrap()).unwrap();
        assert_eq!(body["event"], "deposit.confirmed");
        assert_eq!(body["data"]["amount"], "100.00");
        assert_eq!(body["timestamp"], record.created_at.timestamp());
    }

    #[test]
    fn event_type_names() {
        assert_eq!(deposit().event_type(), EventType::DepositConfirmed);
        assert_eq!(EventType::PayoutCreated.to_string(), "payout.created");
        let json = serde_json::to_string(&EventType::BatchCreated).unwrap();
        assert_eq!(json, "\"batch.created\"");
    }

    #[test]
    fn recording_sink_counts_by_kind() {
        let sink = RecordingSink::new();
        sink.publish(MerchantId::new(), deposit());
        sink.publish(MerchantId::new(), deposit());
        assert_eq!(sink.count(EventType::DepositConfirmed), 2);
        assert_eq!(sink.count(EventType::PayoutClaimed), 0);
    }
}
