//! Wire envelope and the decrypted message model.

use serde::{Deserialize, Serialize};

/// Broadcast event name under which envelopes are published.
pub const MESSAGE_EVENT: &str = "message";

/// Longest nickname carried on the wire.
pub const MAX_NICK_CHARS: usize = 20;

/// Prefix that marks a decrypted payload as an inline image.
pub const IMAGE_PREFIX: &str = "data:image/";

/// One encrypted message as it travels over the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub id: String,
    pub user_id: String,
    pub nick: String,
    /// Send time, Unix ms.
    pub ts: i64,
    /// Base64 nonce.
    pub iv: String,
    /// Base64 ciphertext.
    pub ct: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl MessageEnvelope {
    /// The signed form of this envelope.
    pub fn canonical(&self) -> String {
        canonical_string(&self.id, &self.user_id, &self.nick, self.ts, &self.iv, &self.ct)
    }

    /// All three of signature, public key and fingerprint, when present.
    pub fn signature_material(&self) -> Option<(&str, &str, &str)> {
        match (&self.sig, &self.pubkey, &self.fingerprint) {
            (Some(sig), Some(pubkey), Some(fp)) => Some((sig, pubkey, fp)),
            _ => None,
        }
    }
}

/// Fixed `|`-joined order of the signed fields.
///
/// Signer and verifier must produce this byte for byte; any other order or
/// a missing field makes verification fail.
pub fn canonical_string(id: &str, user_id: &str, nick: &str, ts: i64, iv: &str, ct: &str) -> String {
    format!("{id}|{user_id}|{nick}|{ts}|{iv}|{ct}")
}

/// Trim a peer-supplied nickname to the wire limit.
pub fn truncate_nick(nick: &str) -> String {
    nick.chars().take(MAX_NICK_CHARS).collect()
}

/// Decrypted content of a history entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Text(String),
    /// A `data:image/...` URL.
    Image(String),
    /// Locally generated notice.
    System(String),
    PresenceJoin { nickname: String },
    PresenceLeave { nickname: String },
}

impl MessageBody {
    /// Classify decrypted plaintext.
    pub fn from_plaintext(plaintext: String) -> Self {
        if plaintext.starts_with(IMAGE_PREFIX) {
            Self::Image(plaintext)
        } else {
            Self::Text(plaintext)
        }
    }
}

/// Outcome of signature and trust checks for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Sent by this client.
    Own,
    /// Signature valid and fingerprint matches the trust record (or is new).
    Verified,
    /// Signature valid, but the nickname was first seen with another key.
    KeyChanged { expected: String, actual: String },
    /// Signature material present but it does not check out.
    Invalid,
    /// No signature material.
    Unverified,
    /// Local notices and presence events.
    System,
}

/// One rendered history entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEntry {
    pub id: String,
    pub user_id: String,
    pub nickname: String,
    /// Unix ms.
    pub ts: i64,
    pub body: MessageBody,
    pub verification: Verification,
    pub fingerprint: Option<String>,
}

impl ChatEntry {
    /// A local notice with a fresh id.
    pub fn system(text: impl Into<String>, ts: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: String::new(),
            nickname: String::new(),
            ts,
            body: MessageBody::System(text.into()),
            verification: Verification::System,
            fingerprint: None,
        }
    }

    pub fn presence(body: MessageBody, ts: i64) -> Self {
        Self {
            body,
            ..Self::system(String::new(), ts)
        }
    }
}
