//! Publish/subscribe transport contract.
//!
//! The chat core needs four things from a realtime backend: topic
//! subscriptions with a status report, best-effort broadcast to the other
//! subscribers, presence tracking and a presence snapshot. Calls return
//! immediately; everything the backend reports later (confirmation, incoming
//! broadcasts, presence changes) arrives as a [`TransportEvent`] on the
//! receiver handed out when the transport was created.

pub mod memory;

use std::collections::HashMap;

use crate::error::TransportError;
use crate::presence::PresenceRecord;

/// Handle for one subscription. Never reused within a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Per-subscription options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Presence key to track under. `None` disables presence events.
    pub presence_key: Option<String>,
}

impl ChannelOptions {
    pub fn with_presence(key: impl Into<String>) -> Self {
        Self {
            presence_key: Some(key.into()),
        }
    }
}

/// Subscription status as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeStatus {
    Subscribed,
    Closed,
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventKind {
    Status(SubscribeStatus),
    Broadcast {
        event: String,
        payload: serde_json::Value,
    },
    /// Full presence snapshot, sent after a presence-enabled subscribe.
    PresenceSync(HashMap<String, PresenceRecord>),
    PresenceJoin {
        key: String,
        record: PresenceRecord,
    },
    PresenceLeave {
        key: String,
    },
}

/// Something the backend reported for one subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub subscription: SubscriptionId,
    pub kind: TransportEventKind,
}

/// A realtime pub/sub backend.
pub trait Transport {
    /// Open a subscription to `topic`. Confirmation arrives later as
    /// [`SubscribeStatus::Subscribed`].
    fn subscribe(
        &mut self,
        topic: &str,
        options: ChannelOptions,
    ) -> Result<SubscriptionId, TransportError>;

    /// Close a subscription. Unknown ids are ignored.
    fn unsubscribe(&mut self, subscription: SubscriptionId);

    /// Publish to every other subscriber of the subscription's topic.
    /// The sender never receives its own broadcast.
    fn broadcast(
        &mut self,
        subscription: SubscriptionId,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), TransportError>;

    /// Announce this client under the subscription's presence key.
    fn presence_track(
        &mut self,
        subscription: SubscriptionId,
        record: &PresenceRecord,
    ) -> Result<(), TransportError>;

    fn presence_untrack(&mut self, subscription: SubscriptionId);

    /// Everyone currently tracked on the subscription's topic, by presence key.
    fn presence_state(&self, subscription: SubscriptionId) -> HashMap<String, PresenceRecord>;
}
