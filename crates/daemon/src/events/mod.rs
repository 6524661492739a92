//! Global audit events
//!
//! Every mutation attempt emits a structured event with success or failure
//! attribution. Events flow to a durable message bus through a non-blocking
//! producer; when the bus is unreachable at startup the no-op producer keeps
//! the service available, and publish failures never fail the user request.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Schema version stamped on every event
pub const EVENT_SCHEMA_VERSION: &str = "1.0";

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("event bus unavailable: {0}")]
    Unavailable(String),
    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Before/after snapshot pair recorded for updates
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifiedPair {
    pub before: serde_json::Value,
    pub after: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionResult {
    Success,
    Failure,
}

/// A single audit event
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalEvent {
    pub event_id: String,
    pub schema_version: String,
    pub event_type: String,
    /// The operation attempted, e.g. "create", "update", "expunge"
    pub action: String,
    pub action_result: ActionResult,
    /// Object id in hex, when one is in play
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_target: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub action_target_messages: Vec<String>,
    /// Full object snapshot on the success path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub modified_pairs: Vec<ModifiedPair>,
    pub session_id: String,
    pub user_dn: String,
    pub system_ip: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub x_forwarded_for: String,
    /// Query string for read endpoints
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_string: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Pre-populated per-request event fields, carried in the request context
#[derive(Debug, Clone, Default)]
pub struct EventTemplate {
    pub session_id: String,
    pub user_dn: String,
    pub system_ip: String,
    pub x_forwarded_for: String,
}

impl EventTemplate {
    /// Mint an event from the template with a fresh event id
    pub fn event(&self, action: &str, result: ActionResult) -> GlobalEvent {
        GlobalEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            schema_version: EVENT_SCHEMA_VERSION.to_string(),
            event_type: "object-drive-event".to_string(),
            action: action.to_string(),
            action_result: result,
            action_target: None,
            action_target_messages: Vec::new(),
            resources: None,
            modified_pairs: Vec::new(),
            session_id: self.session_id.clone(),
            user_dn: self.user_dn.clone(),
            system_ip: self.system_ip.clone(),
            x_forwarded_for: self.x_forwarded_for.clone(),
            query_string: None,
            timestamp: Utc::now(),
        }
    }
}

/// The durable message bus producer
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: &GlobalEvent) -> Result<(), EventError>;
    async fn reconnect(&self) -> Result<(), EventError>;
}

/// Producer that drops events; selected when no bus is configured or the
/// configured bus was unreachable at startup.
pub struct NoopBus;

#[async_trait]
impl EventBus for NoopBus {
    async fn publish(&self, _event: &GlobalEvent) -> Result<(), EventError> {
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), EventError> {
        Ok(())
    }
}

/// NATS-backed producer
pub struct NatsBus {
    url: String,
    subject: String,
    client: tokio::sync::RwLock<async_nats::Client>,
}

impl NatsBus {
    pub async fn connect(url: &str, subject: &str) -> Result<Self, EventError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| EventError::Unavailable(e.to_string()))?;
        Ok(NatsBus {
            url: url.to_string(),
            subject: subject.to_string(),
            client: tokio::sync::RwLock::new(client),
        })
    }
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish(&self, event: &GlobalEvent) -> Result<(), EventError> {
        let payload = serde_json::to_vec(event)?;
        let client = self.client.read().await;
        client
            .publish(self.subject.clone(), Bytes::from(payload))
            .await
            .map_err(|e| EventError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), EventError> {
        let fresh = async_nats::connect(&self.url)
            .await
            .map_err(|e| EventError::Unavailable(e.to_string()))?;
        *self.client.write().await = fresh;
        Ok(())
    }
}

/// Connect the configured bus, falling back to the no-op producer so the
/// service stays available when the bus is down.
pub async fn connect_bus(nats_url: Option<&str>, subject: &str) -> Arc<dyn EventBus> {
    match nats_url {
        Some(url) => match NatsBus::connect(url, subject).await {
            Ok(bus) => {
                tracing::info!(url = %url, subject = %subject, "audit event bus connected");
                Arc::new(bus)
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "audit event bus unreachable, using no-op producer");
                Arc::new(NoopBus)
            }
        },
        None => Arc::new(NoopBus),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_event_serialization_shape() {
        let template = EventTemplate {
            session_id: "abc".to_string(),
            user_dn: "cn=test".to_string(),
            system_ip: "10.0.0.1".to_string(),
            x_forwarded_for: String::new(),
        };
        let mut event = template.event("update", ActionResult::Failure);
        event.action_target = Some("00".repeat(16));
        event.action_target_messages = vec!["428".to_string()];

        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(json["action"], "update");
        assert_eq!(json["actionResult"], "FAILURE");
        assert_eq!(json["schemaVersion"], EVENT_SCHEMA_VERSION);
        assert!(json.get("xForwardedFor").is_none());
        assert!(json.get("resources").is_none());
    }

    #[test]
    fn test_event_ids_are_unique() {
        let template = EventTemplate::default();
        let a = template.event("create", ActionResult::Success);
        let b = template.event("create", ActionResult::Success);
        assert_ne!(a.event_id, b.event_id);
    }
}
