//! Per-channel session state.

use std::collections::VecDeque;
use std::time::Instant;

use murmur_crypto::ChannelKey;

use crate::envelope::ChatEntry;
use crate::transport::SubscriptionId;

/// Lifecycle of one channel subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Waiting for the transport to confirm. `deadline` is cleared once the
    /// confirmation timeout has fired, so it fires at most once.
    Pending { deadline: Option<Instant> },
    Subscribed,
    /// Closed or errored by the transport.
    Closed,
}

/// The remote end of a direct-message session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmPeer {
    pub nickname: String,
    pub fingerprint: String,
}

/// One subscribed channel: its key, subscription handle and bounded history.
#[derive(Debug)]
pub struct ChannelSession {
    id: String,
    key: ChannelKey,
    subscription: SubscriptionId,
    state: SubscriptionState,
    history: VecDeque<ChatEntry>,
    capacity: usize,
    unread: usize,
    primary: bool,
    dm_peer: Option<DmPeer>,
}

impl ChannelSession {
    pub fn new(
        id: impl Into<String>,
        key: ChannelKey,
        subscription: SubscriptionId,
        capacity: usize,
        deadline: Instant,
    ) -> Self {
        Self {
            id: id.into(),
            key,
            subscription,
            state: SubscriptionState::Pending {
                deadline: Some(deadline),
            },
            history: VecDeque::with_capacity(capacity.min(64)),
            capacity: capacity.max(1),
            unread: 0,
            primary: false,
            dm_peer: None,
        }
    }

    #[must_use]
    pub const fn with_primary(mut self, primary: bool) -> Self {
        self.primary = primary;
        self
    }

    #[must_use]
    pub fn with_dm_peer(mut self, peer: DmPeer) -> Self {
        self.dm_peer = Some(peer);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub const fn key(&self) -> &ChannelKey {
        &self.key
    }

    pub const fn subscription(&self) -> SubscriptionId {
        self.subscription
    }

    pub const fn state(&self) -> SubscriptionState {
        self.state
    }

    pub const fn is_primary(&self) -> bool {
        self.primary
    }

    pub const fn dm_peer(&self) -> Option<&DmPeer> {
        self.dm_peer.as_ref()
    }

    pub const fn unread(&self) -> usize {
        self.unread
    }

    /// Point at a fresh subscription after a resubscribe.
    pub fn resubscribe(&mut self, subscription: SubscriptionId, deadline: Instant) {
        self.subscription = subscription;
        self.state = SubscriptionState::Pending {
            deadline: Some(deadline),
        };
    }

    pub fn mark_subscribed(&mut self) {
        self.state = SubscriptionState::Subscribed;
    }

    pub fn mark_closed(&mut self) {
        self.state = SubscriptionState::Closed;
    }

    /// Pending confirmation deadline, if one is still armed.
    pub const fn deadline(&self) -> Option<Instant> {
        match self.state {
            SubscriptionState::Pending { deadline } => deadline,
            _ => None,
        }
    }

    /// Disarm the confirmation deadline if it has passed. Returns `true` once
    /// per subscription attempt.
    pub fn take_expired(&mut self, now: Instant) -> bool {
        match &mut self.state {
            SubscriptionState::Pending { deadline } if deadline.is_some_and(|d| d <= now) => {
                *deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Append to history, evicting the oldest entry when full.
    pub fn push(&mut self, entry: ChatEntry) {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(entry);
    }

    pub fn mark_unread(&mut self) {
        self.unread = self.unread.saturating_add(1);
    }

    pub fn clear_unread(&mut self) {
        self.unread = 0;
    }

    /// Buffered history, oldest first.
    pub fn history(&self) -> impl ExactSizeIterator<Item = &ChatEntry> {
        self.history.iter()
    }

    pub fn history_snapshot(&self) -> Vec<ChatEntry> {
        self.history.iter().cloned().collect()
    }
}
