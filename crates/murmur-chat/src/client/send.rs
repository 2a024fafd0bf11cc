//! Outgoing pipeline: validate, rate-limit, moderate, encrypt, sign, publish.

use murmur_crypto::CryptoError;
use tracing::debug;

use super::{ChatCore, now_ts};
use crate::emoji::substitute_shortcodes;
use crate::envelope::{ChatEntry, IMAGE_PREFIX, MESSAGE_EVENT, MessageBody, MessageEnvelope, Verification};
use crate::error::{ChatError, Result};
use crate::events::{BlockReason, ConnectionState, NoticeLevel};
use crate::transport::Transport;

impl<T: Transport> ChatCore<T> {
    /// Send a text message to the active channel or DM.
    ///
    /// Rejected input never reaches the network; the reason is emitted as
    /// [`crate::ChatEvent::Blocked`].
    pub fn send(&mut self, text: &str) -> Result<()> {
        let result = self.send_text(text);
        self.report(result)
    }

    fn send_text(&mut self, text: &str) -> Result<()> {
        self.ensure_connected()?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(self.block(BlockReason::Empty));
        }
        let limit = self.config.max_message_length;
        if trimmed.chars().count() > limit {
            return Err(self.block(BlockReason::TooLong { limit }));
        }
        let text = substitute_shortcodes(trimmed);

        self.check_send_rate()?;
        if let Err(reason) = self.automod.filter(&text, &self.user_id) {
            return Err(self.block(BlockReason::Moderation(reason)));
        }
        self.publish(MessageBody::Text(text))
    }

    /// Send an image given as a `data:image/...` URL.
    pub fn send_image(&mut self, data_url: &str) -> Result<()> {
        let result = self.send_image_url(data_url);
        self.report(result)
    }

    fn send_image_url(&mut self, data_url: &str) -> Result<()> {
        self.ensure_connected()?;
        let data_url = data_url.trim();
        if data_url.is_empty() {
            return Err(self.block(BlockReason::Empty));
        }
        if !data_url.starts_with(IMAGE_PREFIX) {
            self.notice(NoticeLevel::Error, "Only images can be sent this way");
            return Err(ChatError::Validation("not an image data URL".into()));
        }
        let limit = self.config.max_image_bytes;
        if data_url.len() > limit {
            return Err(self.block(BlockReason::TooLong { limit }));
        }
        self.check_send_rate()?;
        self.publish(MessageBody::Image(data_url.to_string()))
    }

    pub(super) fn ensure_connected(&self) -> Result<()> {
        if self.nickname.is_none() || self.state != ConnectionState::Connected {
            return Err(ChatError::NotConnected);
        }
        Ok(())
    }

    fn check_send_rate(&mut self) -> Result<()> {
        let now = self.clock_ms();
        if self.send_limiter.check(&self.user_id, now) {
            Ok(())
        } else {
            Err(self.block(BlockReason::RateLimited))
        }
    }

    /// Encrypt `body` with the active key and broadcast it, then render the
    /// local copy. The transport does not echo our own broadcasts.
    fn publish(&mut self, body: MessageBody) -> Result<()> {
        let plaintext = match &body {
            MessageBody::Text(text) | MessageBody::Image(text) => text.clone(),
            _ => return Err(ChatError::Validation("only text and images can be sent".into())),
        };
        let channel = self.active.clone();
        let session = self
            .channels
            .get(&channel)
            .ok_or_else(|| ChatError::UnknownChannel(channel.clone()))?;
        let encrypted = session.key().encrypt(plaintext.as_bytes())?;
        let subscription = session.subscription();

        let mut envelope = MessageEnvelope {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: self.user_id.clone(),
            nick: self.nickname.clone().unwrap_or_default(),
            ts: now_ts(),
            iv: encrypted.iv_base64(),
            ct: encrypted.ciphertext_base64(),
            sig: None,
            pubkey: None,
            fingerprint: None,
        };
        if let Some(identity) = &self.identity {
            let keys = identity.public_keys();
            envelope.sig = Some(identity.sign(&envelope.canonical()));
            envelope.pubkey = Some(keys.signing);
            envelope.fingerprint = Some(keys.fingerprint);
        }

        let payload = serde_json::to_value(&envelope).map_err(CryptoError::from)?;
        self.transport
            .broadcast(subscription, MESSAGE_EVENT, payload)?;
        debug!(channel = %channel, id = %envelope.id, "Message sent");

        let entry = ChatEntry {
            id: envelope.id,
            user_id: envelope.user_id,
            nickname: envelope.nick,
            ts: envelope.ts,
            body,
            verification: Verification::Own,
            fingerprint: envelope.fingerprint,
        };
        self.deliver(&channel, entry);
        Ok(())
    }
}
