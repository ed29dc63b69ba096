//! Messages exchanged between pages and the agent.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::oneshot;

use crate::clients::ClientId;
use crate::ServiceWorkerError;

/// Command sent by a page to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Skip the waiting phase and activate now.
    SkipWaiting,
    /// Reply with `{ version, isCritical }` on the supplied port.
    GetVersion,
    /// Register the deferred-retry task.
    TriggerSync,
}

impl ControlMessage {
    /// Decode a page message. Anything unrecognised is `None`.
    pub fn parse(data: &JsonValue) -> Option<Self> {
        Self::deserialize(data).ok()
    }
}

/// Notification pushed by the agent to pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LifecycleNotification {
    /// A new version took control.
    #[serde(rename = "SW_UPDATED", rename_all = "camelCase")]
    SwUpdated { version: String, is_critical: bool },

    /// Replay writes that failed while offline.
    #[serde(rename = "SYNC_POSTS")]
    SyncPosts,

    /// Check whether a newer version is deployed.
    #[serde(rename = "CHECK_UPDATES")]
    CheckUpdates,
}

/// Reply channel handed over with a page message.
#[derive(Debug)]
pub struct ReplyPort {
    tx: oneshot::Sender<JsonValue>,
}

impl ReplyPort {
    /// Create a port and the receiving end kept by the page.
    pub fn channel() -> (Self, oneshot::Receiver<JsonValue>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Send the reply. Consumes the port.
    pub fn post_message(self, data: JsonValue) -> Result<(), ServiceWorkerError> {
        self.tx
            .send(data)
            .map_err(|_| ServiceWorkerError::ClientError("reply port closed".to_string()))
    }
}

/// A message event delivered to the agent.
#[derive(Debug)]
pub struct MessageEvent {
    /// Message payload.
    pub data: JsonValue,

    /// Sending page, when known.
    pub source: Option<ClientId>,

    /// Transferred reply ports.
    pub ports: Vec<ReplyPort>,
}

impl MessageEvent {
    /// Create a message event without ports.
    pub fn new(data: JsonValue, source: Option<ClientId>) -> Self {
        Self {
            data,
            source,
            ports: Vec::new(),
        }
    }

    /// Attach a reply port.
    pub fn with_port(mut self, port: ReplyPort) -> Self {
        self.ports.push(port);
        self
    }
}
