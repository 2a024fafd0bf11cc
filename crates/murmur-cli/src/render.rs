//! Plain-text rendering of chat events.

use chrono::{Local, TimeZone};
use murmur_chat::ChatEvent;
use murmur_chat::envelope::{ChatEntry, MessageBody, Verification};
use murmur_chat::events::NoticeLevel;

/// Render one event as a single line, or `None` for events with no text form.
pub fn line(event: &ChatEvent) -> Option<String> {
    match event {
        ChatEvent::Message { channel, entry } => Some(format!("[{channel}] {}", entry_line(entry))),
        ChatEvent::Notice { level, text } => {
            let tag = match level {
                NoticeLevel::Info => "info",
                NoticeLevel::Warning => "warn",
                NoticeLevel::Error => "error",
            };
            Some(format!("  ({tag}) {text}"))
        }
        ChatEvent::ChannelChanged { label, .. } => Some(format!("== {label} ==")),
        ChatEvent::Unread { channel, count } if *count > 0 => {
            Some(format!("  #{channel}: {count} unread"))
        }
        ChatEvent::Blocked { reason } => Some(format!("  (blocked) {reason}")),
        ChatEvent::Retry { visible: true } => Some("  (retry available)".to_string()),
        ChatEvent::HistoryReplay { entries, .. } if !entries.is_empty() => Some(
            entries
                .iter()
                .map(entry_line)
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        _ => None,
    }
}

fn entry_line(entry: &ChatEntry) -> String {
    let time = Local
        .timestamp_millis_opt(entry.ts)
        .single()
        .map_or_else(String::new, |t| t.format("%H:%M").to_string());
    match &entry.body {
        MessageBody::Text(text) => format!(
            "{time} {}{}: {text}",
            entry.nickname,
            badge(&entry.verification)
        ),
        MessageBody::Image(url) => format!(
            "{time} {}{}: [image, {} bytes]",
            entry.nickname,
            badge(&entry.verification),
            url.len()
        ),
        MessageBody::System(text) => format!("{time} * {text}"),
        MessageBody::PresenceJoin { nickname } => format!("{time} * {nickname} joined"),
        MessageBody::PresenceLeave { nickname } => format!("{time} * {nickname} left"),
    }
}

fn badge(verification: &Verification) -> &'static str {
    match verification {
        Verification::Own | Verification::System => "",
        Verification::Verified => " [verified]",
        Verification::KeyChanged { .. } => " [KEY CHANGED]",
        Verification::Invalid => " [INVALID SIGNATURE]",
        Verification::Unverified => " [unverified]",
    }
}
