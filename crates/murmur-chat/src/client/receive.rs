//! Incoming pipeline: decrypt, moderate, rate-limit, verify, render.

use murmur_crypto::{TrustStatus, verify_signature};
use tracing::{debug, warn};

use super::{ChatCore, now_ts};
use crate::envelope::{ChatEntry, MessageBody, MessageEnvelope, Verification, truncate_nick};
use crate::events::NoticeLevel;
use crate::presence::fingerprint_matches;
use crate::transport::Transport;

/// Shown for senders with an empty nickname.
const UNKNOWN_NICK: &str = "Anonymous";

/// Shown instead of a nickname that trips the keyword filter.
const FILTERED_NICK: &str = "[filtered]";

impl<T: Transport> ChatCore<T> {
    /// Run one envelope received on `channel_id` through the receive pipeline.
    ///
    /// Anything that fails a step is dropped without telling the user.
    pub fn receive(&mut self, channel_id: &str, envelope: MessageEnvelope) {
        if envelope.user_id == self.user_id {
            return;
        }
        let Some(session) = self.channels.get(channel_id) else {
            debug!(channel = %channel_id, "Dropping message for unknown channel");
            return;
        };
        let plaintext = match session.key().decrypt_wire(&envelope.iv, &envelope.ct) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                debug!(channel = %channel_id, id = %envelope.id, error = %e, "Dropping undecryptable message");
                return;
            }
        };

        let body = MessageBody::from_plaintext(plaintext);
        if let MessageBody::Text(text) = &body {
            if let Err(reason) = self.automod.filter(text, &envelope.user_id) {
                debug!(channel = %channel_id, sender = %envelope.user_id, %reason, "Dropping moderated message");
                return;
            }
        }
        let now = self.clock_ms();
        if let Err(reason) = self.automod.check_rate_limit(&envelope.user_id, now) {
            debug!(channel = %channel_id, sender = %envelope.user_id, %reason, "Dropping rate-limited message");
            return;
        }

        let nickname = self.sanitize_nickname(&envelope.nick);
        let verification = self.verify(&envelope, &nickname);
        let entry = ChatEntry {
            id: envelope.id,
            user_id: envelope.user_id,
            nickname,
            ts: envelope.ts,
            body,
            verification,
            fingerprint: envelope.fingerprint,
        };
        self.deliver(channel_id, entry);
    }

    fn sanitize_nickname(&self, raw: &str) -> String {
        let nickname = truncate_nick(raw.trim());
        if nickname.is_empty() {
            return UNKNOWN_NICK.to_string();
        }
        if self.automod.check_keywords(&nickname).is_err() {
            return FILTERED_NICK.to_string();
        }
        nickname
    }

    /// Classify the envelope's signature and check its key against the trust store.
    fn verify(&mut self, envelope: &MessageEnvelope, nickname: &str) -> Verification {
        let Some((signature, pubkey, fingerprint)) = envelope.signature_material() else {
            return Verification::Unverified;
        };
        if !verify_signature(&envelope.canonical(), signature, pubkey) {
            warn!(nickname, "Message signature does not verify");
            return Verification::Invalid;
        }
        if !fingerprint_matches(fingerprint, pubkey) {
            warn!(nickname, fingerprint, "Fingerprint does not belong to the signing key");
            return Verification::Invalid;
        }

        match self.trust.check(nickname, fingerprint, now_ts()) {
            TrustStatus::New | TrustStatus::Trusted => Verification::Verified,
            TrustStatus::Changed { expected, actual } => {
                warn!(nickname, %expected, %actual, "Key changed for known nickname");
                self.notice(
                    NoticeLevel::Warning,
                    format!(
                        "{nickname}'s key has changed (was {expected}, now {actual}). \
                         This may not be the same person."
                    ),
                );
                Verification::KeyChanged { expected, actual }
            }
        }
    }
}
