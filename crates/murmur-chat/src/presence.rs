//! Presence records announced on the primary channel, and the peer roster
//! built from them.

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use murmur_crypto::{Identity, fingerprint_of};
use serde::{Deserialize, Serialize};

/// What each participant tracks on the primary channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub nick: String,
    /// RFC 3339 join time.
    pub online_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(
        default,
        rename = "dhPubkey",
        skip_serializing_if = "Option::is_none"
    )]
    pub dh_pubkey: Option<String>,
}

impl PresenceRecord {
    /// Record for the local participant. Key fields stay empty without an identity.
    pub fn announce(nick: &str, identity: Option<&Identity>) -> Self {
        let keys = identity.map(Identity::public_keys);
        Self {
            nick: nick.to_string(),
            online_at: chrono::Utc::now().to_rfc3339(),
            pubkey: keys.as_ref().map(|k| k.signing.clone()),
            fingerprint: keys.as_ref().map(|k| k.fingerprint.clone()),
            dh_pubkey: keys.map(|k| k.exchange),
        }
    }
}

/// Another participant seen via presence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Presence key (the peer's session user id).
    pub key: String,
    pub nickname: String,
    pub fingerprint: Option<String>,
    pub signing_key: Option<String>,
    pub exchange_key: Option<String>,
}

impl Peer {
    /// Build from a record. A fingerprint that does not belong to the
    /// announced signing key is discarded.
    pub fn from_record(key: &str, record: &PresenceRecord) -> Self {
        let fingerprint = match (&record.fingerprint, &record.pubkey) {
            (Some(fp), Some(pk)) if fingerprint_matches(fp, pk) => Some(fp.clone()),
            _ => None,
        };
        Self {
            key: key.to_string(),
            nickname: crate::envelope::truncate_nick(&record.nick),
            fingerprint,
            signing_key: record.pubkey.clone(),
            exchange_key: record.dh_pubkey.clone(),
        }
    }

    /// Whether a DM can be opened with this peer.
    pub const fn can_dm(&self) -> bool {
        self.fingerprint.is_some() && self.exchange_key.is_some()
    }
}

/// Whether `fingerprint` is the fingerprint of base64 key `pubkey_b64`.
pub fn fingerprint_matches(fingerprint: &str, pubkey_b64: &str) -> bool {
    B64.decode(pubkey_b64)
        .is_ok_and(|raw| fingerprint_of(&raw) == fingerprint)
}

/// Current participants keyed by presence key, excluding the local one.
#[derive(Debug, Default)]
pub struct Roster {
    peers: HashMap<String, Peer>,
}

impl Roster {
    /// Replace the roster from a full presence snapshot.
    pub fn sync(&mut self, state: &HashMap<String, PresenceRecord>, self_key: &str) {
        self.peers = state
            .iter()
            .filter(|(key, _)| key.as_str() != self_key)
            .map(|(key, record)| (key.clone(), Peer::from_record(key, record)))
            .collect();
    }

    /// Add or refresh one peer. Returns `true` if it was not known before.
    pub fn join(&mut self, key: &str, record: &PresenceRecord) -> bool {
        self.peers
            .insert(key.to_string(), Peer::from_record(key, record))
            .is_none()
    }

    pub fn leave(&mut self, key: &str) -> Option<Peer> {
        self.peers.remove(key)
    }

    /// First peer currently using `nickname`.
    pub fn by_nickname(&self, nickname: &str) -> Option<&Peer> {
        let mut matches: Vec<_> = self
            .peers
            .values()
            .filter(|p| p.nickname == nickname)
            .collect();
        matches.sort_by(|a, b| a.key.cmp(&b.key));
        matches.first().copied()
    }

    /// Peers sorted by nickname.
    pub fn peers(&self) -> Vec<Peer> {
        let mut peers: Vec<_> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.nickname.cmp(&b.nickname).then_with(|| a.key.cmp(&b.key)));
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn record_uses_wire_field_names() {
        let identity = Identity::generate();
        let record = PresenceRecord::announce("alice", Some(&identity));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["nick"], "alice");
        assert!(json["dhPubkey"].is_string());
        assert_eq!(json["fingerprint"], identity.fingerprint());
        assert!(chrono::DateTime::parse_from_rfc3339(json["online_at"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn record_without_identity_has_no_keys() {
        let record = PresenceRecord::announce("anon", None);
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("pubkey").is_none());
        assert!(!Peer::from_record("k", &record).can_dm());
    }

    #[test]
    fn mismatched_fingerprint_is_dropped() {
        let a = Identity::generate();
        let b = Identity::generate();
        let mut record = PresenceRecord::announce("alice", Some(&a));
        record.fingerprint = Some(b.fingerprint().to_string());
        let peer = Peer::from_record("k", &record);
        assert!(peer.fingerprint.is_none());
        assert!(!peer.can_dm());
    }

    #[test]
    fn sync_excludes_self() {
        let mut state = HashMap::new();
        state.insert("me".to_string(), PresenceRecord::announce("me", None));
        state.insert("them".to_string(), PresenceRecord::announce("them", None));
        let mut roster = Roster::default();
        roster.sync(&state, "me");
        assert_eq!(roster.len(), 1);
        assert!(roster.by_nickname("them").is_some());
        assert!(roster.by_nickname("me").is_none());
    }

    #[test]
    fn join_and_leave() {
        let mut roster = Roster::default();
        let record = PresenceRecord::announce("bob", None);
        assert!(roster.join("b", &record));
        assert!(!roster.join("b", &record));
        assert_eq!(roster.leave("b").unwrap().nickname, "bob");
        assert!(roster.is_empty());
    }
}
