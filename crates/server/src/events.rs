//! Live task events for user-facing clients (`GET /api/stream`).
//!
//! One broadcast channel carries every event tagged with the username it is
//! addressed to; each subscriber filters for its own name. Agents never
//! subscribe: host delivery stays pull-only.

use serde_json::Value;
use tokio::sync::broadcast;

/// Username whose stream also receives a `changed` ping for every task
/// transition.
pub const ADMIN_STREAM: &str = "admin";

const DEFAULT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct UserEvent {
    pub username: String,
    pub payload: Value,
}

#[derive(Clone)]
pub struct EventHub {
    sender: broadcast::Sender<UserEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl EventHub {
    pub fn new(buffer: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UserEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, username: &str, payload: Value) {
        let event = UserEvent {
            username: username.to_string(),
            payload,
        };
        if let Err(err) = self.sender.send(event) {
            tracing::debug!("no subscribers for task event: {}", err);
        }
    }

    /// Publishes `payload` to `username` and a `changed` ping to the admin
    /// stream.
    pub fn publish_with_admin(&self, username: &str, payload: Value) {
        self.publish(username, payload);
        if username != ADMIN_STREAM {
            self.publish(ADMIN_STREAM, serde_json::json!({ "type": "changed" }));
        }
    }
}
