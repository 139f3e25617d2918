//! Lifecycle event bus
//!
//! Fire-and-forget notifications for connection and tunnel state
//! transitions. Events are broadcast; late subscribers miss past events and
//! emission never blocks. For one logical connect or tunnel attempt,
//! `BeforeConnect` is always followed by exactly one of `Connected` or
//! `Disconnected`. Across concurrent operations events interleave freely,
//! so subscribers must key on the payload, not on ordering.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Which logical channel the transition belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventChannel {
    /// The SSH command channel (one-shot remote executions, client close)
    Ssh,
    /// A persistent port-forwarding tunnel
    Tunnel,
}

/// Lifecycle phase of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventPhase {
    BeforeConnect,
    Connected,
    BeforeDisconnect,
    Disconnected,
}

/// A single lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshEvent {
    /// Id of the client that emitted the event
    pub client_id: String,

    pub channel: EventChannel,
    pub phase: EventPhase,

    /// Tunnel name for `EventChannel::Tunnel` events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<String>,

    /// Human-readable context (error message, remote command, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Broadcast bus for `SshEvent`s.
///
/// Cloning is cheap; all clones share the same channel. Emission with no
/// subscribers is a no-op.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SshEvent>,
}

impl EventBus {
    const CAPACITY: usize = 64;

    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(Self::CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SshEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SshEvent) {
        // No subscribers is fine; slow subscribers lag and drop.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receivers", &self.tx.receiver_count())
            .finish()
    }
}
