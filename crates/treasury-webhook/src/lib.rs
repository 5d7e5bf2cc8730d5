//! # treasury-webhook
//!
//! Outbound notification of treasury events: endpoint registry, HMAC
//! signing, and a queue-backed dispatcher with retries and dead letters.
//!
//! The dispatcher's [`WebhookHandle`] implements
//! [`treasury_types::EventSink`], so engine components publish to it
//! without knowing about HTTP.

pub mod dispatcher;
pub mod endpoint;
pub mod signing;
pub mod transport;

pub use dispatcher::{
    DeadLetter, DeliveryLog, DeliveryRecord, DeliveryStatus, DispatcherSettings, EventQuery,
    WebhookDispatcher, WebhookHandle,
};
pub use endpoint::{EndpointRegistry, EventFilter, WebhookEndpoint};
pub use signing::{sign, verify_signature};
pub use transport::{OutboundRequest, ReqwestTransport, TransportError, WebhookTransport};
