//! Automatic moderation: banned keywords, spam and per-sender rate limits.
//!
//! Works on plaintext only and knows nothing about crypto, so the same
//! instance can screen outgoing messages before encryption and incoming ones
//! after decryption.

use std::collections::{HashMap, VecDeque};

use murmur_core::config::AutoModConfig;
use regex::{Regex, RegexBuilder};
use tracing::{debug, warn};

use crate::rate_limit::SlidingWindow;

/// Rate buckets idle for this many windows are purged during maintenance.
const IDLE_WINDOWS: u64 = 6;

/// Messages shorter than this are never checked for repeated characters.
const MIN_REPEATED_CHARS_LEN: usize = 6;

/// Why a message was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModerationReason {
    EmptyMessage,
    BannedKeyword,
    SpamRepeatedChars,
    SpamRepeatedMessage,
    RateLimited,
}

impl ModerationReason {
    /// Stable machine-readable code.
    pub const fn code(self) -> &'static str {
        match self {
            Self::EmptyMessage => "empty_message",
            Self::BannedKeyword => "keyword_blocked",
            Self::SpamRepeatedChars => "spam_repeated_chars",
            Self::SpamRepeatedMessage => "spam_repeated_message",
            Self::RateLimited => "rate_limited",
        }
    }

    /// Explanation shown inline to the sender.
    pub const fn describe(self) -> &'static str {
        match self {
            Self::EmptyMessage => "Message is empty",
            Self::BannedKeyword => "Message contains a blocked word",
            Self::SpamRepeatedChars => "Message is mostly one repeated character",
            Self::SpamRepeatedMessage => "You already sent that message",
            Self::RateLimited => "You're sending messages too fast",
        }
    }
}

impl std::fmt::Display for ModerationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Default)]
struct SpamHistory {
    recent: VecDeque<String>,
    last_update: u64,
}

/// Keyword, spam and rate filtering.
#[derive(Debug)]
pub struct AutoMod {
    config: AutoModConfig,
    keyword_matcher: Option<Regex>,
    rate: SlidingWindow,
    spam: HashMap<String, SpamHistory>,
    /// Logical clock for spam-history recency; only ordering matters.
    spam_clock: u64,
}

impl AutoMod {
    pub fn new(config: AutoModConfig) -> Self {
        let rate = SlidingWindow::per_secs(config.rate_limit, config.rate_window_secs);
        let mut automod = Self {
            keyword_matcher: None,
            rate,
            spam: HashMap::new(),
            spam_clock: 0,
            config,
        };
        automod.compile_keywords();
        automod
    }

    pub const fn config(&self) -> &AutoModConfig {
        &self.config
    }

    /// Replace the ban list and recompile the matcher.
    pub fn set_banned_words(&mut self, words: Vec<String>) {
        self.config.banned_words = words;
        self.compile_keywords();
    }

    fn compile_keywords(&mut self) {
        let words: Vec<String> = self
            .config
            .banned_words
            .iter()
            .map(|w| w.trim())
            .filter(|w| !w.is_empty())
            .map(regex::escape)
            .collect();
        if words.is_empty() {
            self.keyword_matcher = None;
            return;
        }
        let pattern = format!(r"\b(?:{})\b", words.join("|"));
        self.keyword_matcher = match RegexBuilder::new(&pattern).case_insensitive(true).build() {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(error = %e, "Failed to compile keyword filter, keyword checks disabled");
                None
            }
        };
    }

    /// Whole-word, case-insensitive ban list check.
    pub fn check_keywords(&self, text: &str) -> Result<(), ModerationReason> {
        if !self.config.filter_keywords {
            return Ok(());
        }
        match &self.keyword_matcher {
            Some(re) if re.is_match(text) => Err(ModerationReason::BannedKeyword),
            _ => Ok(()),
        }
    }

    /// Per-sender sliding window. Records the call only when accepted.
    pub fn check_rate_limit(&mut self, user_id: &str, now_ms: u64) -> Result<(), ModerationReason> {
        if self.rate.check(user_id, now_ms) {
            Ok(())
        } else {
            Err(ModerationReason::RateLimited)
        }
    }

    /// Repeated-character and repeated-message detection.
    pub fn check_spam(&mut self, text: &str, user_id: &str) -> Result<(), ModerationReason> {
        if !self.config.spam_detection {
            return Ok(());
        }
        if is_mostly_one_char(text, self.config.repeated_char_ratio) {
            return Err(ModerationReason::SpamRepeatedChars);
        }

        let threshold = self.config.repeat_threshold;
        self.spam_clock += 1;
        let history = self.spam.entry(user_id.to_string()).or_default();
        history.last_update = self.spam_clock;
        history.recent.push_back(normalize(text));
        while history.recent.len() > threshold {
            history.recent.pop_front();
        }
        let repeated = history.recent.len() == threshold
            && history.recent.iter().all(|m| Some(m) == history.recent.front());

        self.enforce_spam_cap();

        if repeated {
            Err(ModerationReason::SpamRepeatedMessage)
        } else {
            Ok(())
        }
    }

    /// Full content check: empty, then keywords, then spam.
    pub fn filter(&mut self, text: &str, user_id: &str) -> Result<(), ModerationReason> {
        if text.trim().is_empty() {
            return Err(ModerationReason::EmptyMessage);
        }
        if !self.config.enabled {
            return Ok(());
        }
        self.check_keywords(text)?;
        self.check_spam(text, user_id)
    }

    /// Periodic cleanup of rate buckets and spam history.
    pub fn maintain(&mut self, now_ms: u64) {
        let idle = self.rate.window_ms().saturating_mul(IDLE_WINDOWS);
        let purged = self.rate.purge_idle(now_ms, idle);
        self.enforce_spam_cap();
        if purged > 0 {
            debug!(purged, "Purged idle rate buckets");
        }
    }

    /// Senders with live rate buckets.
    pub fn rate_tracked(&self) -> usize {
        self.rate.tracked()
    }

    /// Senders with spam history.
    pub fn spam_tracked(&self) -> usize {
        self.spam.len()
    }

    fn enforce_spam_cap(&mut self) {
        while self.spam.len() > self.config.max_tracked_senders {
            let oldest = self
                .spam
                .iter()
                .min_by_key(|(_, h)| h.last_update)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    self.spam.remove(&key);
                }
                None => break,
            }
        }
    }
}

/// Lowercase with collapsed whitespace, for repeat comparison.
fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn is_mostly_one_char(text: &str, ratio: f64) -> bool {
    let total = text.chars().count();
    if total < MIN_REPEATED_CHARS_LEN {
        return false;
    }
    let mut counts: HashMap<char, usize> = HashMap::new();
    for c in text.chars() {
        *counts.entry(c).or_default() += 1;
    }
    let max = counts.values().copied().max().unwrap_or(0);
    #[allow(clippy::cast_precision_loss)]
    let share = max as f64 / total as f64;
    share >= ratio
}

#[cfg(test)]
mod tests {
    use super::*;

    fn automod() -> AutoMod {
        AutoMod::new(AutoModConfig {
            banned_words: vec!["darn".into(), "heck".into()],
            ..AutoModConfig::default()
        })
    }

    #[test]
    fn keyword_is_whole_word_and_case_insensitive() {
        let am = automod();
        assert_eq!(
            am.check_keywords("well DARN it"),
            Err(ModerationReason::BannedKeyword)
        );
        assert_eq!(
            am.check_keywords("what the heck."),
            Err(ModerationReason::BannedKeyword)
        );
        assert!(am.check_keywords("darning socks").is_ok());
        assert!(am.check_keywords("checkout").is_ok());
    }

    #[test]
    fn changing_ban_list_recompiles() {
        let mut am = automod();
        assert!(am.check_keywords("gosh").is_ok());
        am.set_banned_words(vec!["gosh".into()]);
        assert!(am.check_keywords("oh GOSH").is_err());
        assert!(am.check_keywords("darn").is_ok());
    }

    #[test]
    fn ban_list_entries_are_literal() {
        let mut am = automod();
        am.set_banned_words(vec!["a.c".into()]);
        assert!(am.check_keywords("abc").is_ok());
        assert!(am.check_keywords("a.c").is_err());
    }

    #[test]
    fn empty_ban_list_allows_everything() {
        let mut am = automod();
        am.set_banned_words(vec![String::new(), "  ".into()]);
        assert!(am.check_keywords("anything goes").is_ok());
    }

    #[test]
    fn rate_limit_default_five_per_ten_seconds() {
        let mut am = automod();
        for i in 0..5 {
            assert!(am.check_rate_limit("u1", i * 10).is_ok());
        }
        assert_eq!(
            am.check_rate_limit("u1", 100),
            Err(ModerationReason::RateLimited)
        );
        assert!(am.check_rate_limit("u1", 10_000).is_ok());
    }

    #[test]
    fn repeated_chars_trigger_at_eighty_percent() {
        let mut am = automod();
        assert_eq!(
            am.check_spam("aaaaaaaab", "u1"),
            Err(ModerationReason::SpamRepeatedChars)
        );
        assert_eq!(
            am.check_spam("aaaab", "u2"),
            Ok(()),
            "five characters is below the length floor"
        );
        assert!(am.check_spam("aaaabb", "u3").is_ok());
        assert_eq!(
            am.check_spam("aaaaab", "u4"),
            Err(ModerationReason::SpamRepeatedChars)
        );
    }

    #[test]
    fn third_identical_message_is_spam() {
        let mut am = automod();
        assert!(am.check_spam("hello there", "u1").is_ok());
        assert!(am.check_spam("Hello   there", "u1").is_ok());
        assert_eq!(
            am.check_spam("HELLO THERE", "u1"),
            Err(ModerationReason::SpamRepeatedMessage)
        );
    }

    #[test]
    fn interleaved_message_resets_repeat_run() {
        let mut am = automod();
        assert!(am.check_spam("hi all", "u1").is_ok());
        assert!(am.check_spam("hi all", "u1").is_ok());
        assert!(am.check_spam("something else", "u1").is_ok());
        assert!(am.check_spam("hi all", "u1").is_ok());
    }

    #[test]
    fn repeat_history_is_per_sender() {
        let mut am = automod();
        assert!(am.check_spam("hi all", "u1").is_ok());
        assert!(am.check_spam("hi all", "u2").is_ok());
        assert!(am.check_spam("hi all", "u3").is_ok());
    }

    #[test]
    fn filter_order_and_short_circuit() {
        let mut am = automod();
        assert_eq!(am.filter("   ", "u1"), Err(ModerationReason::EmptyMessage));
        assert_eq!(
            am.filter("heck heck heck", "u1"),
            Err(ModerationReason::BannedKeyword)
        );
        assert_eq!(am.spam_tracked(), 0, "keyword rejection skips spam tracking");
        assert!(am.filter("normal message", "u1").is_ok());
    }

    #[test]
    fn disabled_automod_only_rejects_empty() {
        let mut am = AutoMod::new(AutoModConfig {
            enabled: false,
            ..AutoModConfig::default()
        });
        assert_eq!(am.filter("", "u1"), Err(ModerationReason::EmptyMessage));
        assert!(am.filter("aaaaaaaaaa", "u1").is_ok());
    }

    #[test]
    fn maintenance_purges_idle_rate_buckets() {
        let mut am = automod();
        let _ = am.check_rate_limit("idle", 0);
        let _ = am.check_rate_limit("active", 55_000);
        am.maintain(61_000);
        assert_eq!(am.rate_tracked(), 1);
    }

    #[test]
    fn spam_history_is_capped_evicting_oldest() {
        let mut am = AutoMod::new(AutoModConfig {
            max_tracked_senders: 3,
            ..AutoModConfig::default()
        });
        for user in ["a", "b", "c", "d"] {
            let _ = am.check_spam("hello", user);
        }
        assert_eq!(am.spam_tracked(), 3);
        // "a" was evicted, so its run starts over.
        assert!(am.check_spam("hello", "a").is_ok());
        assert!(am.check_spam("hello", "a").is_ok());
    }

    #[test]
    fn reason_codes() {
        assert_eq!(ModerationReason::SpamRepeatedChars.code(), "spam_repeated_chars");
        assert_eq!(
            ModerationReason::SpamRepeatedMessage.to_string(),
            "spam_repeated_message"
        );
    }
}
