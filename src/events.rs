//! Event fan-out for service-level notifications.
//!
//! Services emit named events (`workflow.updated`, `credential.checkout`,
//! ...) through a [`Broadcaster`]. The engine and stores only depend on
//! the trait; the host application decides where events go. The bundled
//! [`BroadcastHub`] fans out over a tokio broadcast channel and is lossy
//! under backpressure: lagging subscribers drop old messages rather than
//! blocking emitters.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Event names emitted by the core services.
pub mod topics {
    pub const WORKFLOW_CREATED: &str = "workflow.created";
    pub const WORKFLOW_UPDATED: &str = "workflow.updated";
    pub const WORKFLOW_FAILED: &str = "workflow.failed";
    pub const WORKFLOW_PR_CREATED: &str = "workflow.pr_created";
    pub const WORKFLOW_POLICIES_UPDATED: &str = "workflow.policies.updated";

    pub const CREDENTIAL_CREATED: &str = "credential.created";
    pub const CREDENTIAL_UPDATED: &str = "credential.updated";
    pub const CREDENTIAL_DELETED: &str = "credential.deleted";
    pub const CREDENTIAL_GRANT_ADDED: &str = "credential.grant.added";
    pub const CREDENTIAL_GRANT_REVOKED: &str = "credential.grant.revoked";
    pub const CREDENTIAL_LEASE_CREATED: &str = "credential.lease.created";
    pub const CREDENTIAL_LEASE_EXPIRED: &str = "credential.lease.expired";
    pub const CREDENTIAL_CHECKOUT: &str = "credential.checkout";
    pub const CREDENTIAL_CHECKOUT_BLOCKED: &str = "credential.checkout.blocked";
}

/// A single broadcast message: event name plus a JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub event: String,
    pub payload: serde_json::Value,
}

/// Best-effort event sink consumed by the core services.
pub trait Broadcaster: Send + Sync {
    fn emit(&self, event: &str, payload: serde_json::Value);
}

/// Channel-backed broadcaster for in-process subscribers.
pub struct BroadcastHub {
    tx: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Broadcaster for BroadcastHub {
    fn emit(&self, event: &str, payload: serde_json::Value) {
        // send only fails when there are no subscribers; that's fine.
        let _ = self.tx.send(BroadcastMessage {
            event: event.to_string(),
            payload,
        });
        tracing::trace!(event, "broadcast");
    }
}

/// Broadcaster that discards everything. Useful for tests and headless
/// tools that don't care about events.
pub struct NullBroadcaster;

impl Broadcaster for NullBroadcaster {
    fn emit(&self, _event: &str, _payload: serde_json::Value) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hub_delivers_to_subscriber() {
        let hub = BroadcastHub::default();
        let mut rx = hub.subscribe();

        hub.emit(topics::WORKFLOW_CREATED, serde_json::json!({"id": "w1"}));

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.event, "workflow.created");
        assert_eq!(msg.payload["id"], "w1");
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_silent() {
        let hub = BroadcastHub::default();
        hub.emit("credential.updated", serde_json::json!({}));
    }
}
