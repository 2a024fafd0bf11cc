//! Shared harness: chat clients wired to one in-memory hub.

#![allow(dead_code, clippy::unwrap_used)]

use murmur_chat::envelope::{ChatEntry, MessageBody};
use murmur_chat::transport::memory::{MemoryHub, MemoryTransport};
use murmur_chat::{ChatCore, ChatEvent, IdentityMode};
use murmur_core::Config;
use tokio::sync::mpsc;

/// Fast key derivation for tests. Every client in a test must agree.
pub const TEST_KDF_ROUNDS: u32 = 1_000;

pub fn test_config(channels: &[&str]) -> Config {
    let mut config = Config::default();
    config.chat.channels = channels.iter().map(ToString::to_string).collect();
    config.chat.default_channel = channels[0].to_string();
    config.chat.kdf_rounds = TEST_KDF_ROUNDS;
    config.trust.persist = false;
    config
}

pub struct Client {
    pub core: ChatCore<MemoryTransport>,
    pub events: mpsc::UnboundedReceiver<ChatEvent>,
}

impl Client {
    pub fn new(hub: &MemoryHub, config: &Config, mode: IdentityMode) -> Self {
        let (transport, transport_events) = hub.connect();
        let (core, events) = ChatCore::new(config, transport, transport_events);
        Self {
            core: core.with_identity_mode(mode),
            events,
        }
    }

    /// A client that has joined and processed its subscription confirmations.
    pub fn joined(hub: &MemoryHub, config: &Config, nickname: &str, mode: IdentityMode) -> Self {
        let mut client = Self::new(hub, config, mode);
        client.core.join(nickname).unwrap();
        client.core.pump();
        client
    }

    pub fn drain(&mut self) -> Vec<ChatEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    /// Process queued transport events, then return the chat messages
    /// (text and images) rendered since the last drain.
    pub fn received(&mut self) -> Vec<ChatEntry> {
        self.core.pump();
        messages(&self.drain())
    }
}

pub fn messages(events: &[ChatEvent]) -> Vec<ChatEntry> {
    events
        .iter()
        .filter_map(|event| match event {
            ChatEvent::Message { entry, .. }
                if matches!(entry.body, MessageBody::Text(_) | MessageBody::Image(_)) =>
            {
                Some(entry.clone())
            }
            _ => None,
        })
        .collect()
}

pub fn text_of(entry: &ChatEntry) -> &str {
    match &entry.body {
        MessageBody::Text(text) | MessageBody::Image(text) | MessageBody::System(text) => text,
        _ => "",
    }
}
