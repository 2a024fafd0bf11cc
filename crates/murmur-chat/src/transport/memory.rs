//! In-process transport hub.
//!
//! Every [`MemoryTransport`] connected to the same [`MemoryHub`] sees the
//! others' broadcasts and presence, which is enough to run several chat
//! clients side by side in one process. The hub can also be taken offline,
//! drop every subscription, or hold confirmations back, to exercise the
//! reconnect and timeout paths.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{
    ChannelOptions, SubscribeStatus, SubscriptionId, Transport, TransportEvent,
    TransportEventKind,
};
use crate::error::TransportError;
use crate::presence::PresenceRecord;

/// Broadcasts retained for [`MemoryHub::published`]; older ones are evicted.
pub const PUBLISHED_LOG_CAPACITY: usize = 1_024;

#[derive(Debug)]
struct Subscriber {
    client: u64,
    topic: String,
    presence_key: Option<String>,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

#[derive(Debug)]
struct HubState {
    online: bool,
    hold_confirmations: bool,
    next_client: u64,
    next_subscription: u64,
    subscribers: HashMap<SubscriptionId, Subscriber>,
    /// topic -> presence key -> record
    presence: HashMap<String, HashMap<String, PresenceRecord>>,
    /// Most recent accepted broadcasts, in order: (topic, event, payload).
    published: VecDeque<(String, String, serde_json::Value)>,
}

impl Default for HubState {
    fn default() -> Self {
        Self {
            online: true,
            hold_confirmations: false,
            next_client: 0,
            next_subscription: 0,
            subscribers: HashMap::new(),
            presence: HashMap::new(),
            published: VecDeque::with_capacity(64),
        }
    }
}

impl HubState {
    fn send(&self, subscription: SubscriptionId, kind: TransportEventKind) {
        if let Some(sub) = self.subscribers.get(&subscription) {
            // A closed receiver means the client is gone; nothing to report to.
            let _ = sub.tx.send(TransportEvent { subscription, kind });
        }
    }

    /// Subscribers of `topic` other than `except`.
    fn peers_of(&self, topic: &str, except: SubscriptionId) -> Vec<SubscriptionId> {
        self.subscribers
            .iter()
            .filter(|(id, sub)| **id != except && sub.topic == topic)
            .map(|(id, _)| *id)
            .collect()
    }

    fn untrack(&mut self, subscription: SubscriptionId) {
        let Some(sub) = self.subscribers.get(&subscription) else {
            return;
        };
        let Some(key) = sub.presence_key.clone() else {
            return;
        };
        let topic = sub.topic.clone();
        let removed = self
            .presence
            .get_mut(&topic)
            .and_then(|members| members.remove(&key))
            .is_some();
        if removed {
            for peer in self.peers_of(&topic, subscription) {
                self.send(peer, TransportEventKind::PresenceLeave { key: key.clone() });
            }
        }
    }

    fn remove(&mut self, subscription: SubscriptionId) {
        self.untrack(subscription);
        self.subscribers.remove(&subscription);
    }
}

/// Shared in-memory pub/sub backend.
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connect a new client. Events for its subscriptions arrive on the receiver.
    pub fn connect(&self) -> (MemoryTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = {
            let mut state = self.lock();
            state.next_client += 1;
            state.next_client
        };
        let transport = MemoryTransport {
            hub: self.clone(),
            client,
            tx,
        };
        (transport, rx)
    }

    /// While offline, new subscriptions fail and broadcasts are refused.
    pub fn set_online(&self, online: bool) {
        self.lock().online = online;
    }

    /// While held, subscriptions stay pending and never confirm.
    pub fn hold_confirmations(&self, hold: bool) {
        self.lock().hold_confirmations = hold;
    }

    /// Close every subscription as if the backend restarted.
    pub fn drop_all(&self) {
        let mut state = self.lock();
        let ids: Vec<_> = state.subscribers.keys().copied().collect();
        for id in &ids {
            state.send(*id, TransportEventKind::Status(SubscribeStatus::Closed));
        }
        state.subscribers.clear();
        state.presence.clear();
        debug!(count = ids.len(), "Hub dropped all subscriptions");
    }

    /// Payloads broadcast on `topic`, oldest first, from the last
    /// [`PUBLISHED_LOG_CAPACITY`] broadcasts hub-wide.
    pub fn published(&self, topic: &str) -> Vec<serde_json::Value> {
        self.lock()
            .published
            .iter()
            .filter(|(t, _, _)| t == topic)
            .map(|(_, _, payload)| payload.clone())
            .collect()
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock()
            .subscribers
            .values()
            .filter(|s| s.topic == topic)
            .count()
    }

    fn disconnect_client(&self, client: u64) {
        let mut state = self.lock();
        let ids: Vec<_> = state
            .subscribers
            .iter()
            .filter(|(_, s)| s.client == client)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            state.remove(id);
        }
    }
}

/// One client's connection to a [`MemoryHub`].
#[derive(Debug)]
pub struct MemoryTransport {
    hub: MemoryHub,
    client: u64,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl MemoryTransport {
    pub const fn hub(&self) -> &MemoryHub {
        &self.hub
    }
}

impl Transport for MemoryTransport {
    fn subscribe(
        &mut self,
        topic: &str,
        options: ChannelOptions,
    ) -> Result<SubscriptionId, TransportError> {
        let mut state = self.hub.lock();
        state.next_subscription += 1;
        let id = SubscriptionId(state.next_subscription);

        if !state.online {
            let _ = self.tx.send(TransportEvent {
                subscription: id,
                kind: TransportEventKind::Status(SubscribeStatus::Error("offline".into())),
            });
            return Ok(id);
        }

        let has_presence = options.presence_key.is_some();
        state.subscribers.insert(
            id,
            Subscriber {
                client: self.client,
                topic: topic.to_string(),
                presence_key: options.presence_key,
                tx: self.tx.clone(),
            },
        );
        trace!(%id, topic, "Subscribed");

        if !state.hold_confirmations {
            state.send(id, TransportEventKind::Status(SubscribeStatus::Subscribed));
            if has_presence {
                let snapshot = state.presence.get(topic).cloned().unwrap_or_default();
                state.send(id, TransportEventKind::PresenceSync(snapshot));
            }
        }
        Ok(id)
    }

    fn unsubscribe(&mut self, subscription: SubscriptionId) {
        let mut state = self.hub.lock();
        if state
            .subscribers
            .get(&subscription)
            .is_some_and(|s| s.client == self.client)
        {
            state.remove(subscription);
        }
    }

    fn broadcast(
        &mut self,
        subscription: SubscriptionId,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), TransportError> {
        let mut state = self.hub.lock();
        if !state.online {
            return Err(TransportError::Offline);
        }
        let topic = state
            .subscribers
            .get(&subscription)
            .filter(|s| s.client == self.client)
            .map(|s| s.topic.clone())
            .ok_or_else(|| TransportError::NotSubscribed(subscription.to_string()))?;

        for peer in state.peers_of(&topic, subscription) {
            if state.subscribers.get(&peer).is_some_and(|s| s.client != self.client) {
                state.send(
                    peer,
                    TransportEventKind::Broadcast {
                        event: event.to_string(),
                        payload: payload.clone(),
                    },
                );
            }
        }
        if state.published.len() == PUBLISHED_LOG_CAPACITY {
            state.published.pop_front();
        }
        state.published.push_back((topic, event.to_string(), payload));
        Ok(())
    }

    fn presence_track(
        &mut self,
        subscription: SubscriptionId,
        record: &PresenceRecord,
    ) -> Result<(), TransportError> {
        let mut state = self.hub.lock();
        let (topic, key) = match state.subscribers.get(&subscription) {
            Some(Subscriber {
                topic,
                presence_key: Some(key),
                client,
                ..
            }) if *client == self.client => (topic.clone(), key.clone()),
            Some(_) => {
                return Err(TransportError::Rejected(
                    "presence is not enabled on this subscription".into(),
                ));
            }
            None => return Err(TransportError::NotSubscribed(subscription.to_string())),
        };

        state
            .presence
            .entry(topic.clone())
            .or_default()
            .insert(key.clone(), record.clone());
        for peer in state.peers_of(&topic, subscription) {
            state.send(
                peer,
                TransportEventKind::PresenceJoin {
                    key: key.clone(),
                    record: record.clone(),
                },
            );
        }
        Ok(())
    }

    fn presence_untrack(&mut self, subscription: SubscriptionId) {
        self.hub.lock().untrack(subscription);
    }

    fn presence_state(&self, subscription: SubscriptionId) -> HashMap<String, PresenceRecord> {
        let state = self.hub.lock();
        state
            .subscribers
            .get(&subscription)
            .and_then(|s| state.presence.get(&s.topic))
            .cloned()
            .unwrap_or_default()
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.hub.disconnect_client(self.client);
    }
}
