//! Configuration resolution for Murmur.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/murmur/settings.json)
//! 3. Explicit config file (e.g. `--config` on the CLI)
//! 4. Environment variables (highest priority)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Name of the channel every client joins unless configured otherwise.
pub const DEFAULT_CHANNEL: &str = "murmur-livechat";

/// Longest accepted rate-limit window.
pub const MAX_WINDOW_SECS: u64 = 86_400;

/// Longest accepted subscribe timeout or maintenance interval.
pub const MAX_TIMER_SECS: u64 = 3_600;

/// Complete Murmur configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub automod: AutoModConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub trust: TrustConfig,
}

/// Chat session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Channels subscribed on join. The first entry carries presence.
    pub channels: Vec<String>,
    /// Channel shown after join and after a DM closes.
    pub default_channel: String,
    /// Maximum text message length, in characters.
    pub max_message_length: usize,
    /// Maximum encoded image size (data URL bytes).
    pub max_image_bytes: usize,
    /// Messages retained per channel.
    pub history_capacity: usize,
    /// Seconds to wait for a subscription to be confirmed before offering a retry.
    pub subscribe_timeout_secs: u64,
    /// Outgoing messages allowed per window, checked before any network call.
    pub send_rate_limit: usize,
    pub send_rate_window_secs: u64,
    /// PBKDF2 rounds for channel key derivation. Every participant must agree.
    pub kdf_rounds: u32,
    pub nickname: NicknameConfig,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            channels: vec![DEFAULT_CHANNEL.to_string()],
            default_channel: DEFAULT_CHANNEL.to_string(),
            max_message_length: 500,
            max_image_bytes: 512 * 1024,
            history_capacity: 500,
            subscribe_timeout_secs: 10,
            send_rate_limit: 5,
            send_rate_window_secs: 10,
            kdf_rounds: 100_000,
            nickname: NicknameConfig::default(),
        }
    }
}

/// Nickname validation rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NicknameConfig {
    pub min_length: usize,
    pub max_length: usize,
    pub pattern: String,
}

impl Default for NicknameConfig {
    fn default() -> Self {
        Self {
            min_length: 1,
            max_length: 20,
            pattern: r"^[a-zA-Z0-9_\- ]+$".into(),
        }
    }
}

/// Auto-moderation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoModConfig {
    pub enabled: bool,
    pub filter_keywords: bool,
    /// Whole words rejected case-insensitively.
    pub banned_words: Vec<String>,
    /// Messages per sender allowed within `rate_window_secs`.
    pub rate_limit: usize,
    pub rate_window_secs: u64,
    pub spam_detection: bool,
    /// Identical consecutive messages that count as spam.
    pub repeat_threshold: usize,
    /// Share of a message a single character may occupy before it is spam.
    pub repeated_char_ratio: f64,
    /// Upper bound on senders tracked for repeat detection.
    pub max_tracked_senders: usize,
    pub maintenance_interval_secs: u64,
}

impl Default for AutoModConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            filter_keywords: true,
            banned_words: ["fuck", "shit", "cunt", "bitch", "asshole"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            rate_limit: 5,
            rate_window_secs: 10,
            spam_detection: true,
            repeat_threshold: 3,
            repeated_char_ratio: 0.8,
            max_tracked_senders: 1000,
            maintenance_interval_secs: 60,
        }
    }
}

/// Reconnection backoff settings for the primary channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Fraction of the delay applied as random jitter in both directions.
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: 0.25,
            max_attempts: 8,
        }
    }
}

/// Identity key handling.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct IdentityConfig {
    /// Keep the identity across sessions. Off by default: a fresh identity
    /// is generated for every session.
    pub persist: bool,
    /// Key file location when `persist` is set.
    pub key_path: Option<PathBuf>,
}

/// Trust-on-first-use store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Keep first-seen fingerprints on disk. When off, or when no path
    /// resolves, records last only for the session.
    pub persist: bool,
    pub store_path: Option<PathBuf>,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            persist: true,
            store_path: None,
        }
    }
}

impl Config {
    /// Check values that would make the chat pipeline unusable.
    pub fn validate(&self) -> Result<()> {
        if self.chat.channels.is_empty() {
            return Err(Error::InvalidSetting("chat.channels must not be empty".into()));
        }
        if !self.chat.channels.contains(&self.chat.default_channel) {
            return Err(Error::InvalidSetting(format!(
                "chat.default_channel {:?} is not in chat.channels",
                self.chat.default_channel
            )));
        }
        if self.chat.history_capacity == 0 {
            return Err(Error::InvalidSetting("chat.history_capacity must be > 0".into()));
        }
        if self.chat.send_rate_limit == 0 || self.automod.rate_limit == 0 {
            return Err(Error::InvalidSetting("rate limits must be > 0".into()));
        }
        if self.chat.kdf_rounds == 0 {
            return Err(Error::InvalidSetting("chat.kdf_rounds must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.automod.repeated_char_ratio) {
            return Err(Error::InvalidSetting(
                "automod.repeated_char_ratio must be within 0.0..=1.0".into(),
            ));
        }
        if self.automod.repeat_threshold < 2 {
            return Err(Error::InvalidSetting("automod.repeat_threshold must be >= 2".into()));
        }
        if self.chat.send_rate_window_secs > MAX_WINDOW_SECS
            || self.automod.rate_window_secs > MAX_WINDOW_SECS
        {
            return Err(Error::InvalidSetting(format!(
                "rate windows must be at most {MAX_WINDOW_SECS}s"
            )));
        }
        if self.chat.subscribe_timeout_secs > MAX_TIMER_SECS
            || self.automod.maintenance_interval_secs > MAX_TIMER_SECS
        {
            return Err(Error::InvalidSetting(format!(
                "subscribe timeout and maintenance interval must be at most {MAX_TIMER_SECS}s"
            )));
        }
        if !(0.0..1.0).contains(&self.reconnect.jitter) {
            return Err(Error::InvalidSetting("reconnect.jitter must be within 0.0..1.0".into()));
        }
        Ok(())
    }

    /// Path of the trust store, falling back to the platform config directory.
    ///
    /// Ignores `trust.persist`; see [`Self::persistent_trust_path`].
    pub fn trust_store_path(&self) -> Option<PathBuf> {
        self.trust
            .store_path
            .clone()
            .or_else(|| config_dir().map(|d| d.join("trust.json")))
    }

    /// Where a chat session should keep its trust store, if anywhere.
    pub fn persistent_trust_path(&self) -> Option<PathBuf> {
        if self.trust.persist {
            self.trust_store_path()
        } else {
            None
        }
    }

    /// Path of the identity key file, falling back to the platform config directory.
    pub fn identity_key_path(&self) -> Option<PathBuf> {
        self.identity
            .key_path
            .clone()
            .or_else(|| config_dir().map(|d| d.join("identity.key")))
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            let global = load_config_file(&global_path)?;
            merge_config(&mut config, global);
        }
    }

    if let Some(path) = explicit {
        let file = load_config_file(path)?;
        merge_config(&mut config, file);
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;

    Ok(config)
}

/// Directory holding Murmur's settings and durable state.
///
/// `$XDG_CONFIG_HOME/murmur` on Linux and the platform equivalent elsewhere.
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("murmur"))
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("settings.json"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|source| Error::ReadSettings {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| Error::ParseSettings {
        path: path.to_path_buf(),
        source,
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    base.chat = overlay.chat;
    base.automod = overlay.automod;
    base.reconnect = overlay.reconnect;

    base.identity.persist = overlay.identity.persist;
    if overlay.identity.key_path.is_some() {
        base.identity.key_path = overlay.identity.key_path;
    }
    base.trust.persist = overlay.trust.persist;
    if overlay.trust.store_path.is_some() {
        base.trust.store_path = overlay.trust.store_path;
    }
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(val) = var("MURMUR_CHANNELS") {
        let channels: Vec<String> = val
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(ToString::to_string)
            .collect();
        if let Some(first) = channels.first() {
            if !channels.contains(&config.chat.default_channel) {
                config.chat.default_channel = first.clone();
            }
            config.chat.channels = channels;
        }
    }
    if let Some(val) = var("MURMUR_TRUST_PATH") {
        config.trust.store_path = Some(PathBuf::from(val));
    }
    if let Some(val) = var("MURMUR_KDF_ROUNDS") {
        if let Ok(n) = val.parse() {
            config.chat.kdf_rounds = n;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.chat.channels, vec![DEFAULT_CHANNEL.to_string()]);
        assert_eq!(config.chat.history_capacity, 500);
        assert_eq!(config.chat.subscribe_timeout_secs, 10);
    }

    #[test]
    fn default_reconnect_policy_values() {
        let config = Config::default();
        assert_eq!(config.reconnect.base_delay_ms, 2_000);
        assert_eq!(config.reconnect.max_delay_ms, 30_000);
        assert_eq!(config.reconnect.max_attempts, 8);
    }

    #[test]
    fn default_automod_limits() {
        let config = Config::default();
        assert_eq!(config.automod.rate_limit, 5);
        assert_eq!(config.automod.rate_window_secs, 10);
        assert_eq!(config.automod.repeat_threshold, 3);
    }

    #[test]
    fn validate_rejects_oversized_windows_and_timers() {
        let mut config = Config::default();
        config.chat.send_rate_window_secs = u64::MAX;
        assert!(matches!(config.validate(), Err(Error::InvalidSetting(_))));

        let mut config = Config::default();
        config.automod.rate_window_secs = MAX_WINDOW_SECS + 1;
        assert!(matches!(config.validate(), Err(Error::InvalidSetting(_))));

        let mut config = Config::default();
        config.chat.subscribe_timeout_secs = u64::MAX;
        assert!(matches!(config.validate(), Err(Error::InvalidSetting(_))));

        let mut config = Config::default();
        config.chat.send_rate_window_secs = MAX_WINDOW_SECS;
        config.chat.subscribe_timeout_secs = MAX_TIMER_SECS;
        config.validate().unwrap();
    }

    #[test]
    fn trust_persists_by_default_unless_disabled() {
        let mut config = Config::default();
        config.trust.store_path = Some(PathBuf::from("/tmp/murmur-trust.json"));
        assert_eq!(
            config.persistent_trust_path(),
            Some(PathBuf::from("/tmp/murmur-trust.json"))
        );

        config.trust.persist = false;
        assert_eq!(config.persistent_trust_path(), None);
        assert!(config.trust_store_path().is_some());
    }

    #[test]
    fn validate_rejects_default_channel_outside_list() {
        let mut config = Config::default();
        config.chat.default_channel = "elsewhere".into();
        assert!(matches!(config.validate(), Err(Error::InvalidSetting(_))));
    }

    #[test]
    fn validate_rejects_empty_channel_list() {
        let mut config = Config::default();
        config.chat.channels.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"chat": {"max_message_length": 280}}"#).unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.chat.max_message_length, 280);
        assert_eq!(config.chat.history_capacity, 500);
        assert_eq!(config.automod.rate_limit, 5);
    }

    #[test]
    fn malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ nope").unwrap();
        assert!(matches!(
            load_config_file(&path),
            Err(Error::ParseSettings { .. })
        ));
    }

    #[test]
    fn env_channels_override_list_and_default() {
        let mut config = Config::default();
        apply_env_overrides(&mut config, |key| {
            (key == "MURMUR_CHANNELS").then(|| "lobby, random ,".to_string())
        });
        assert_eq!(config.chat.channels, vec!["lobby", "random"]);
        assert_eq!(config.chat.default_channel, "lobby");
        config.validate().unwrap();
    }

    #[test]
    fn env_trust_path_override() {
        let mut config = Config::default();
        apply_env_overrides(&mut config, |key| {
            (key == "MURMUR_TRUST_PATH").then(|| "/tmp/trust.json".to_string())
        });
        assert_eq!(
            config.trust_store_path(),
            Some(PathBuf::from("/tmp/trust.json"))
        );
    }

    #[test]
    fn merge_keeps_base_paths_when_overlay_has_none() {
        let mut base = Config::default();
        base.trust.store_path = Some(PathBuf::from("/a/trust.json"));
        merge_config(&mut base, Config::default());
        assert_eq!(base.trust.store_path, Some(PathBuf::from("/a/trust.json")));
    }
}
