//! Murmur chat core.
//!
//! End-to-end encrypted group channels and direct messages on top of any
//! publish/subscribe [`transport::Transport`]:
//! - Per-channel keys derived from the channel id, DM keys from X25519
//! - Signed envelopes classified through a trust-on-first-use store
//! - Keyword, spam and rate moderation on both send and receive
//! - Exponential-backoff reconnection of the primary channel
//!
//! [`ChatCore`] owns all session state. Drive it step by step with
//! [`ChatCore::pump`] and [`ChatCore::on_tick`], or hand it to
//! [`ChatCore::run`].

pub mod automod;
pub mod channel;
pub mod client;
pub mod emoji;
pub mod envelope;
pub mod error;
pub mod events;
pub mod presence;
pub mod rate_limit;
pub mod reconnect;
pub mod transport;

pub use client::{ChatCommand, ChatCore, IdentityMode, dm_channel_id};
pub use error::{ChatError, Result, TransportError};
pub use events::{BlockReason, ChatEvent, ConnectionState, NoticeLevel};
