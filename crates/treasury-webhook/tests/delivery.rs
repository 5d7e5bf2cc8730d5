//! Dispatcher behaviour against a scripted transport.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use rust_decimal::Decimal;
use treasury_types::{
    DepositConfirmed, EventSink, EventType, MerchantId, PayoutId, PayoutFailed, TreasuryEvent,
    constants::{EVENT_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER},
};
use treasury_webhook::{
    DeliveryStatus, DispatcherSettings, EndpointRegistry, EventFilter, EventQuery, OutboundRequest,
    TransportError, WebhookDispatcher, WebhookHandle, WebhookTransport, verify_signature,
};

/// Transport answering from a script, then 200 forever. Records requests.
#[derive(Default)]
struct ScriptedTransport {
    script: Mutex<Vec<Result<u16, TransportError>>>,
    seen: Mutex<Vec<OutboundRequest>>,
}

impl ScriptedTransport {
    fn answering(script: Vec<Result<u16, TransportError>>) -> Arc<Self> {
        let mut script = script;
        script.reverse();
        Arc::new(Self {
            script: Mutex::new(script),
            seen: Mutex::default(),
        })
    }

    fn requests(&self) -> Vec<OutboundRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl WebhookTransport for ScriptedTransport {
    async fn post(&self, request: &OutboundRequest, _timeout: Duration) -> Result<u16, TransportError> {
        self.seen.lock().unwrap().push(request.clone());
        self.script.lock().unwrap().pop().unwrap_or(Ok(200))
    }
}

fn settings() -> DispatcherSettings {
    DispatcherSettings {
        max_attempts: 3,
        backoff_base: Duration::from_millis(1),
        timeout: Duration::from_millis(100),
        queue_capacity: 16,
        default_secret: "whsec_default".into(),
    }
}

fn deposit_event() -> TreasuryEvent {
    TreasuryEvent::DepositConfirmed(DepositConfirmed {
        amount: Decimal::new(10_000, 2),
        tx_reference: "5VERv8NMvzbJMEkV8xnrLkEa".into(),
        balance_after: Decimal::new(10_000, 2),
    })
}

async fn settle(handle: &WebhookHandle, merchant: MerchantId, deliveries: usize) {
    for _ in 0..200 {
        if handle.log().recent_deliveries(merchant, usize::MAX).len() >= deliveries {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("deliveries did not complete");
}

#[tokio::test]
async fn delivers_signed_body_to_subscribers() {
    let registry = Arc::new(EndpointRegistry::new());
    let merchant = MerchantId::new();
    registry
        .register(merchant, "https://hooks.example.com/a", EventFilter::All, Some("whsec_a".into()))
        .unwrap();
    registry
        .register(
            merchant,
            "https://hooks.example.com/b",
            EventFilter::Only(vec![EventType::PayoutClaimed]),
            None,
        )
        .unwrap();
    let transport = ScriptedTransport::answering(Vec::new());
    let (handle, _worker) = WebhookDispatcher::new(registry, transport.clone(), settings()).spawn();

    handle.publish(merchant, deposit_event());
    settle(&handle, merchant, 1).await;

    let requests = transport.requests();
    assert_eq!(requests.len(), 1, "only the catch-all endpoint subscribes to deposits");
    let request = &requests[0];
    assert_eq!(request.url, "https://hooks.example.com/a");
    assert_eq!(request.header(EVENT_HEADER), Some("deposit.confirmed"));

    let timestamp: i64 = request.header(TIMESTAMP_HEADER).unwrap().parse().unwrap();
    let signature = request.header(SIGNATURE_HEADER).unwrap();
    assert!(verify_signature("whsec_a", timestamp, &request.body, signature));

    let body: serde_json::Value = serde_json::from_str(&request.body).unwrap();
    assert_eq!(body["event"], "deposit.confirmed");
    assert_eq!(body["data"]["amount"], "100.00");
    assert!(body["timestamp"].is_i64());

    let log = handle.log().recent_deliveries(merchant, 10);
    assert_eq!(log[0].status, DeliveryStatus::Delivered);
    assert_eq!(log[0].attempts, 1);
}

#[tokio::test]
async fn retries_then_succeeds() {
    let registry = Arc::new(EndpointRegistry::new());
    let merchant = MerchantId::new();
    registry
        .register(merchant, "https://hooks.example.com/a", EventFilter::All, None)
        .unwrap();
    let transport = ScriptedTransport::answering(vec![
        Err(TransportError::Timeout(Duration::from_millis(100))),
        Ok(503),
    ]);
    let (handle, _worker) = WebhookDispatcher::new(registry, transport.clone(), settings()).spawn();

    handle.publish(merchant, deposit_event());
    settle(&handle, merchant, 1).await;

    assert_eq!(transport.requests().len(), 3);
    let record = &handle.log().recent_deliveries(merchant, 10)[0];
    assert_eq!(record.status, DeliveryStatus::Delivered);
    assert_eq!(record.attempts, 3);
    assert!(handle.log().dead_letters(merchant).is_empty());

    let request = &transport.requests()[2];
    let timestamp: i64 = request.header(TIMESTAMP_HEADER).unwrap().parse().unwrap();
    assert!(verify_signature(
        "whsec_default",
        timestamp,
        &request.body,
        request.header(SIGNATURE_HEADER).unwrap()
    ));
}

#[tokio::test]
async fn exhausted_retries_dead_letter() {
    let registry = Arc::new(EndpointRegistry::new());
    let merchant = MerchantId::new();
    let endpoint = registry
        .register(merchant, "https://hooks.example.com/a", EventFilter::All, None)
        .unwrap();
    let transport = ScriptedTransport::answering(vec![Ok(500), Ok(500), Ok(500)]);
    let (handle, _worker) = WebhookDispatcher::new(registry, transport.clone(), settings()).spawn();

    handle.publish(
        merchant,
        TreasuryEvent::PayoutFailed(PayoutFailed {
            payout_id: PayoutId::new(),
            amount: Decimal::TEN,
            reason: "frozen".into(),
        }),
    );
    settle(&handle, merchant, 1).await;

    assert_eq!(transport.requests().len(), 3);
    let record = &handle.log().recent_deliveries(merchant, 10)[0];
    assert_eq!(record.status, DeliveryStatus::Failed);
    assert_eq!(record.http_status, Some(500));

    let dead = handle.log().dead_letters(merchant);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].endpoint_id, Some(endpoint.id));
    assert_eq!(dead[0].attempts, 3);
    assert_eq!(dead[0].event_type, EventType::PayoutFailed);
}

#[tokio::test]
async fn inactive_and_foreign_endpoints_receive_nothing() {
    let registry = Arc::new(EndpointRegistry::new());
    let merchant = MerchantId::new();
    let endpoint = registry
        .register(merchant, "https://hooks.example.com/a", EventFilter::All, None)
        .unwrap();
    registry
        .register(MerchantId::new(), "https://hooks.example.com/other", EventFilter::All, None)
        .unwrap();
    registry.set_active(endpoint.id, false);
    let transport = ScriptedTransport::answering(Vec::new());
    let (handle, _worker) = WebhookDispatcher::new(registry, transport.clone(), settings()).spawn();

    handle.publish(merchant, deposit_event());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(transport.requests().is_empty());
}

#[tokio::test]
async fn history_is_scoped_to_the_merchant() {
    let registry = Arc::new(EndpointRegistry::new());
    let (merchant, other) = (MerchantId::new(), MerchantId::new());
    for (owner, url) in [(merchant, "https://hooks.example.com/a"), (other, "https://hooks.example.com/b")] {
        registry.register(owner, url, EventFilter::All, None).unwrap();
    }
    let transport = ScriptedTransport::answering(Vec::new());
    let (handle, _worker) = WebhookDispatcher::new(registry, transport, settings()).spawn();

    handle.publish(merchant, deposit_event());
    handle.publish(
        other,
        TreasuryEvent::PayoutFailed(PayoutFailed {
            payout_id: PayoutId::new(),
            amount: Decimal::TEN,
            reason: "frozen".into(),
        }),
    );
    settle(&handle, merchant, 1).await;
    settle(&handle, other, 1).await;

    let events = handle.log().events(merchant, &EventQuery::default());
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].merchant_id, merchant);
    assert_eq!(events[0].event.event_type(), EventType::DepositConfirmed);

    let deliveries = handle.log().recent_deliveries(merchant, 10);
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].merchant_id, merchant);
    assert_eq!(deliveries[0].url, "https://hooks.example.com/a");
    assert_eq!(
        handle.log().event_deliveries(merchant, events[0].id).len(),
        1
    );

    let foreign = handle.log().events(
        other,
        &EventQuery {
            kind: Some(EventType::DepositConfirmed),
            ..EventQuery::default()
        },
    );
    assert!(foreign.is_empty());
}
