//! Chat error types.

use murmur_crypto::CryptoError;

use crate::automod::ModerationReason;

/// Failures reported by a [`crate::transport::Transport`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Transport is offline")]
    Offline,

    #[error("Not subscribed to channel {0}")]
    NotSubscribed(String),

    #[error("Transport rejected the request: {0}")]
    Rejected(String),
}

/// Errors surfaced by [`crate::ChatCore`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("Blocked by moderation: {0}")]
    ContentPolicy(ModerationReason),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Not connected")]
    NotConnected,

    #[error("No identity available")]
    NoIdentity,

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Unknown channel: {0}")]
    UnknownChannel(String),
}

pub type Result<T> = std::result::Result<T, ChatError>;
