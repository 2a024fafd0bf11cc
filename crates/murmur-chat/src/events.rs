//! Events emitted to the host for rendering.

use crate::automod::ModerationReason;
use crate::envelope::ChatEntry;
use crate::presence::Peer;

/// Connection state of the primary channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect attempts exhausted; only a manual retry leaves this state.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Everything the host needs to render the chat.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// A new entry in the active channel.
    Message { channel: String, entry: ChatEntry },
    /// Local notice, shown inline and not stored in any history.
    Notice { level: NoticeLevel, text: String },
    Status(ConnectionState),
    /// The active channel changed. `label` is what the header should show.
    ChannelChanged { channel: String, label: String },
    /// Full buffered history of the channel just switched to.
    HistoryReplay { channel: String, entries: Vec<ChatEntry> },
    /// Show or hide the manual retry affordance.
    Retry { visible: bool },
    InputEnabled(bool),
    /// Unread count of a background channel changed.
    Unread { channel: String, count: usize },
    /// An outgoing message was rejected before reaching the network.
    Blocked { reason: BlockReason },
    /// Peer roster changed.
    Roster(Vec<Peer>),
}

/// Why an outgoing message never left this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    Empty,
    TooLong { limit: usize },
    RateLimited,
    Moderation(ModerationReason),
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("Message is empty"),
            Self::TooLong { limit } => write!(f, "Message is too long (limit {limit})"),
            Self::RateLimited => f.write_str("Slow down: you're sending messages too fast"),
            Self::Moderation(reason) => f.write_str(reason.describe()),
        }
    }
}
