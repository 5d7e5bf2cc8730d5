//! Registered webhook endpoints, per merchant.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;
use treasury_types::{EndpointId, EventType, MerchantId, Result, TreasuryError};

/// Which event kinds an endpoint wants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventFilter {
    All,
    Only(Vec<EventType>),
}

impl EventFilter {
    #[must_use]
    pub fn matches(&self, kind: EventType) -> bool {
        match self {
            Self::All => true,
            Self::Only(kinds) => kinds.contains(&kind),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    pub id: EndpointId,
    pub merchant_id: MerchantId,
    pub url: String,
    pub events: EventFilter,
    /// Endpoint-specific signing secret. The platform default applies when unset.
    #[serde(skip_serializing)]
    pub secret: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Endpoint registry. Reads happen on every published event, writes are rare.
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    endpoints: DashMap<EndpointId, WebhookEndpoint>,
}

impl EndpointRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an active endpoint.
    ///
    /// # Errors
    /// `InvalidRequest` unless `url` is an `http(s)://` URL, or if the filter
    /// names no event kinds.
    pub fn register(
        &self,
        merchant_id: MerchantId,
        url: &str,
        events: EventFilter,
        secret: Option<String>,
    ) -> Result<WebhookEndpoint> {
        let url = url.trim();
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(TreasuryError::InvalidRequest {
                reason: format!("webhook url must be http(s), got '{url}'"),
            });
        }
        if matches!(&events, EventFilter::Only(kinds) if kinds.is_empty()) {
            return Err(TreasuryError::InvalidRequest {
                reason: "webhook must subscribe to at least one event".into(),
            });
        }
        let endpoint = WebhookEndpoint {
            id: EndpointId::new(),
            merchant_id,
            url: url.to_string(),
            events,
            secret: secret.filter(|s| !s.is_empty()),
            active: true,
            created_at: Utc::now(),
        };
        self.endpoints.insert(endpoint.id, endpoint.clone());
        info!(%merchant_id, endpoint_id = %endpoint.id, url = %endpoint.url, "Webhook endpoint registered");
        Ok(endpoint)
    }

    /// Enable or disable an endpoint. Returns `false` if it does not exist.
    pub fn set_active(&self, id: EndpointId, active: bool) -> bool {
        self.endpoints
            .get_mut(&id)
            .map(|mut endpoint| endpoint.active = active)
            .is_some()
    }

    pub fn remove(&self, id: EndpointId) -> Option<WebhookEndpoint> {
        self.endpoints.remove(&id).map(|(_, endpoint)| endpoint)
    }

    #[must_use]
    pub fn list(&self, merchant_id: MerchantId) -> Vec<WebhookEndpoint> {
        let mut endpoints: Vec<_> = self
            .endpoints
            .iter()
            .filter(|e| e.merchant_id == merchant_id)
            .map(|e| e.clone())
            .collect();
        endpoints.sort_by_key(|e| e.id);
        endpoints
    }

    /// Active endpoints of `merchant_id` subscribed to `kind`.
    #[must_use]
    pub fn subscribers(&self, merchant_id: MerchantId, kind: EventType) -> Vec<WebhookEndpoint> {
        self.list(merchant_id)
            .into_iter()
            .filter(|e| e.active && e.events.matches(kind))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_respect_filter_and_active_flag() {
        let registry = EndpointRegistry::new();
        let merchant = MerchantId::new();
        let all = registry
            .register(merchant, "https://a.example.com/hook", EventFilter::All, None)
            .unwrap();
        registry
            .register(
                merchant,
                "https://b.example.com/hook",
                EventFilter::Only(vec![EventType::PayoutClaimed]),
                Some("whsec_b".into()),
            )
            .unwrap();
        registry
            .register(MerchantId::new(), "https://c.example.com/hook", EventFilter::All, None)
            .unwrap();

        assert_eq!(registry.subscribers(merchant, EventType::PayoutCreated).len(), 1);
        assert_eq!(registry.subscribers(merchant, EventType::PayoutClaimed).len(), 2);

        assert!(registry.set_active(all.id, false));
        assert!(registry.subscribers(merchant, EventType::PayoutCreated).is_empty());
        assert_eq!(registry.list(merchant).len(), 2);
    }

    #[test]
    fn rejects_bad_registrations() {
        let registry = EndpointRegistry::new();
        let merchant = MerchantId::new();
        assert!(registry
            .register(merchant, "ftp://x", EventFilter::All, None)
            .is_err());
        assert!(registry
            .register(merchant, "https://x.example.com", EventFilter::Only(Vec::new()), None)
            .is_err());
    }
}
