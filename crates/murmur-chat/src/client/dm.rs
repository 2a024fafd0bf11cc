//! Direct messages.
//!
//! A DM is a channel whose key comes from X25519 agreement between the two
//! participants instead of from the channel id, so knowing the id is not
//! enough to read it. Both sides compute the same id from their fingerprints
//! and meet there without any coordination.

use tracing::{info, warn};

use super::ChatCore;
use crate::channel::{ChannelSession, DmPeer, SubscriptionState};
use crate::error::{ChatError, Result};
use crate::events::NoticeLevel;
use crate::presence::Peer;
use crate::transport::{ChannelOptions, Transport};

/// Namespace of DM channel ids.
pub const DM_PREFIX: &str = "murmur-dm-";

/// Order-independent DM channel id for two fingerprints.
pub fn dm_channel_id(fingerprint_a: &str, fingerprint_b: &str) -> String {
    let a = fingerprint_a.replace(':', "");
    let b = fingerprint_b.replace(':', "");
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    format!("{DM_PREFIX}{low}-{high}")
}

impl<T: Transport> ChatCore<T> {
    /// Open a DM with a peer given its fingerprint and exchange public key.
    ///
    /// The DM becomes active once its subscription confirms. On failure the
    /// current channel stays as it was.
    pub fn start_dm(&mut self, nickname: &str, fingerprint: &str, exchange_key: &str) -> Result<()> {
        let result = self.open_dm(nickname, fingerprint, exchange_key);
        self.report(result)
    }

    /// Open a DM with a roster peer found by nickname.
    pub fn start_dm_with(&mut self, nickname: &str) -> Result<()> {
        let result = match self.roster.by_nickname(nickname).cloned() {
            Some(Peer {
                nickname,
                fingerprint: Some(fingerprint),
                exchange_key: Some(exchange_key),
                ..
            }) => self.open_dm(&nickname, &fingerprint, &exchange_key),
            Some(_) => Err(ChatError::UnknownPeer(format!(
                "{nickname} has not published encryption keys"
            ))),
            None => Err(ChatError::UnknownPeer(nickname.to_string())),
        };
        self.report(result)
    }

    fn open_dm(&mut self, nickname: &str, fingerprint: &str, exchange_key: &str) -> Result<()> {
        self.ensure_connected()?;
        let identity = self.identity.as_ref().ok_or(ChatError::NoIdentity)?;
        if exchange_key.trim().is_empty() {
            return Err(ChatError::UnknownPeer(format!(
                "{nickname} has no exchange key"
            )));
        }
        let key = identity.derive_shared_key(exchange_key)?;
        let channel_id = dm_channel_id(identity.fingerprint(), fingerprint);

        if self.dm.as_deref() == Some(channel_id.as_str()) {
            return Ok(());
        }
        if self.pending_dm.as_deref() == Some(channel_id.as_str()) {
            let waiting = self
                .channels
                .get(&channel_id)
                .and_then(ChannelSession::deadline)
                .is_some();
            return if waiting {
                Ok(())
            } else {
                self.retry_pending_dm(&channel_id)
            };
        }
        if let Some(pending) = self.pending_dm.take() {
            self.drop_channel(&pending);
        }

        let subscription = self
            .transport
            .subscribe(&channel_id, ChannelOptions::default())?;
        let session = ChannelSession::new(
            channel_id.clone(),
            key,
            subscription,
            self.config.history_capacity,
            self.subscribe_deadline(),
        )
        .with_dm_peer(DmPeer {
            nickname: nickname.to_string(),
            fingerprint: fingerprint.to_string(),
        });

        info!(peer = %nickname, channel = %channel_id, "Opening direct message");
        self.subscriptions.insert(subscription, channel_id.clone());
        self.channels.insert(channel_id.clone(), session);
        self.pending_dm = Some(channel_id);
        Ok(())
    }

    /// Resubscribe a pending DM whose confirmation timed out or failed.
    pub(super) fn retry_pending_dm(&mut self, channel_id: &str) -> Result<()> {
        let confirmed = self
            .channels
            .get(channel_id)
            .is_some_and(|s| s.state() == SubscriptionState::Subscribed);
        if confirmed {
            return Ok(());
        }
        info!(channel = %channel_id, "Retrying direct message subscription");
        if let Err(e) = self.resubscribe(channel_id) {
            self.fail_pending_dm(channel_id, &e.to_string());
            return Err(e);
        }
        Ok(())
    }

    /// The pending DM confirmed: make it the active channel.
    pub(super) fn activate_dm(&mut self, channel_id: &str) {
        self.pending_dm = None;
        if let Some(previous) = self.dm.take() {
            if previous != channel_id {
                self.drop_channel(&previous);
            }
        }
        self.dm = Some(channel_id.to_string());
        self.show_channel(channel_id);

        let peer = self
            .channels
            .get(channel_id)
            .and_then(ChannelSession::dm_peer)
            .map(|p| format!("{} ({})", p.nickname, p.fingerprint));
        if let Some(peer) = peer {
            self.notice(
                NoticeLevel::Info,
                format!("Direct message with {peer}. Only the two of you can read it."),
            );
        }
    }

    pub(super) fn fail_pending_dm(&mut self, channel_id: &str, reason: &str) {
        warn!(channel = %channel_id, reason, "Direct message subscription failed");
        self.pending_dm = None;
        self.drop_channel(channel_id);
        self.notice(
            NoticeLevel::Error,
            format!("Could not open direct message: {reason}"),
        );
    }

    /// Leave the DM and return to the default channel.
    pub fn close_dm(&mut self) {
        if let Some(pending) = self.pending_dm.take() {
            self.drop_channel(&pending);
        }
        let Some(dm) = self.dm.take() else {
            return;
        };
        self.drop_channel(&dm);
        info!(channel = %dm, "Closed direct message");
        let default = self.config.default_channel.clone();
        self.show_channel(&default);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dm_id_is_order_independent() {
        let a = "aa:bb:cc:dd:ee:ff:00:11";
        let b = "11:22:33:44:55:66:77:88";
        assert_eq!(dm_channel_id(a, b), dm_channel_id(b, a));
        assert_eq!(
            dm_channel_id(a, b),
            "murmur-dm-1122334455667788-aabbccddeeff0011"
        );
    }
}
