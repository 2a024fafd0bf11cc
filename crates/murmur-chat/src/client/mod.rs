//! The chat orchestrator.
//!
//! [`ChatCore`] owns every piece of mutable session state: the channel
//! sessions and their keys, the active-channel pointer, the optional DM, the
//! identity, trust store, moderation state and reconnect timers. All methods
//! take `&mut self`, so everything runs on one logical event loop and needs
//! no locking. Timers are plain deadlines: [`ChatCore::next_deadline`] says
//! when to call [`ChatCore::on_tick`] next, which is what [`ChatCore::run`]
//! does.

mod dm;
mod receive;
mod send;

pub use dm::{DM_PREFIX, dm_channel_id};

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use murmur_core::Config;
use murmur_core::config::{ChatConfig, DEFAULT_CHANNEL, MAX_TIMER_SECS};
use murmur_crypto::{ChannelKey, Identity, TrustStore, derive_channel_key_with_rounds};
use regex::Regex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::automod::{AutoMod, ModerationReason};
use crate::channel::{ChannelSession, SubscriptionState};
use crate::envelope::{ChatEntry, MESSAGE_EVENT, MessageBody, MessageEnvelope};
use crate::error::{ChatError, Result};
use crate::events::{ChatEvent, ConnectionState, NoticeLevel};
use crate::presence::{Peer, PresenceRecord, Roster};
use crate::rate_limit::SlidingWindow;
use crate::reconnect::Backoff;
use crate::transport::{
    ChannelOptions, SubscribeStatus, SubscriptionId, Transport, TransportEvent, TransportEventKind,
};

/// Where the session identity comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityMode {
    /// Fresh keys for every session.
    Ephemeral,
    /// Keys loaded from, or generated into, an owner-only key file.
    Persistent(PathBuf),
    /// No identity: messages go out unsigned and DMs are unavailable.
    Disabled,
}

/// Host requests accepted by [`ChatCore::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Send(String),
    SendImage(String),
    SwitchChannel(String),
    /// Open a DM with a roster peer, by nickname.
    StartDm(String),
    CloseDm,
    Retry,
}

/// Client-side chat session over a [`Transport`].
pub struct ChatCore<T: Transport> {
    config: ChatConfig,
    transport: T,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    events: mpsc::UnboundedSender<ChatEvent>,

    identity_mode: IdentityMode,
    identity: Option<Identity>,
    trust: TrustStore,
    automod: AutoMod,
    send_limiter: SlidingWindow,
    nick_pattern: Option<Regex>,
    reconnect: Backoff,
    maintenance_interval: Duration,
    /// Origin of the monotonic millisecond clock used for rate limiting.
    epoch: Instant,

    user_id: String,
    nickname: Option<String>,
    state: ConnectionState,
    input_enabled: bool,
    attempts: u32,
    reconnect_at: Option<Instant>,
    maintenance_at: Option<Instant>,

    key_cache: HashMap<String, ChannelKey>,
    channels: HashMap<String, ChannelSession>,
    subscriptions: HashMap<SubscriptionId, String>,
    primary: String,
    active: String,
    dm: Option<String>,
    /// DM waiting for its subscription to confirm before it becomes active.
    pending_dm: Option<String>,
    roster: Roster,
}

impl<T: Transport> std::fmt::Debug for ChatCore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCore")
            .field("user_id", &self.user_id)
            .field("nickname", &self.nickname)
            .field("state", &self.state)
            .field("active", &self.active)
            .field("dm", &self.dm)
            .field("channels", &self.channels.len())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> ChatCore<T> {
    /// Create a session. `transport_events` must be the receiver paired with
    /// `transport`. Returns the core and the receiver for UI events.
    ///
    /// The trust store is loaded from the configured file, or kept in memory
    /// when persistence is off or no path resolves. [`Self::with_trust_store`]
    /// replaces it.
    pub fn new(
        config: &Config,
        transport: T,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<ChatEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let chat = config.chat.clone();

        let nick_pattern = match Regex::new(&chat.nickname.pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(error = %e, "Invalid nickname pattern, only length is checked");
                None
            }
        };
        let identity_mode = if config.identity.persist {
            config
                .identity_key_path()
                .map_or(IdentityMode::Ephemeral, IdentityMode::Persistent)
        } else {
            IdentityMode::Ephemeral
        };
        let primary = chat
            .channels
            .first()
            .cloned()
            .unwrap_or_else(|| DEFAULT_CHANNEL.to_string());

        let core = Self {
            send_limiter: SlidingWindow::per_secs(
                chat.send_rate_limit,
                chat.send_rate_window_secs,
            ),
            automod: AutoMod::new(config.automod.clone()),
            reconnect: Backoff::from(&config.reconnect),
            maintenance_interval: Duration::from_secs(
                config.automod.maintenance_interval_secs.clamp(1, MAX_TIMER_SECS),
            ),
            active: chat.default_channel.clone(),
            primary,
            config: chat,
            transport,
            transport_events,
            events,
            identity_mode,
            identity: None,
            trust: config
                .persistent_trust_path()
                .map_or_else(TrustStore::in_memory, |path| TrustStore::open(&path)),
            nick_pattern,
            epoch: Instant::now(),
            user_id: String::new(),
            nickname: None,
            state: ConnectionState::Disconnected,
            input_enabled: false,
            attempts: 0,
            reconnect_at: None,
            maintenance_at: None,
            key_cache: HashMap::new(),
            channels: HashMap::new(),
            subscriptions: HashMap::new(),
            dm: None,
            pending_dm: None,
            roster: Roster::default(),
        };
        (core, events_rx)
    }

    #[must_use]
    pub fn with_trust_store(mut self, trust: TrustStore) -> Self {
        self.trust = trust;
        self
    }

    #[must_use]
    pub fn with_identity_mode(mut self, mode: IdentityMode) -> Self {
        self.identity_mode = mode;
        self
    }

    // ── accessors ──

    /// Session-scoped user id, empty before [`Self::join`].
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn nickname(&self) -> Option<&str> {
        self.nickname.as_deref()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.identity.as_ref().map(Identity::fingerprint)
    }

    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    pub const fn input_enabled(&self) -> bool {
        self.input_enabled
    }

    pub fn active_channel(&self) -> &str {
        &self.active
    }

    pub fn dm_channel(&self) -> Option<&str> {
        self.dm.as_deref()
    }

    pub fn channel(&self, channel_id: &str) -> Option<&ChannelSession> {
        self.channels.get(channel_id)
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.roster.peers()
    }

    pub const fn trust_store(&self) -> &TrustStore {
        &self.trust
    }

    /// Moderation settings, e.g. to change the ban list at runtime.
    pub const fn automod_mut(&mut self) -> &mut AutoMod {
        &mut self.automod
    }

    pub const fn reconnect_attempts(&self) -> u32 {
        self.attempts
    }

    /// When the pending reconnect fires, if one is scheduled.
    pub const fn reconnect_at(&self) -> Option<Instant> {
        self.reconnect_at
    }

    pub const fn transport(&self) -> &T {
        &self.transport
    }

    // ── lifecycle ──

    /// Join as `nickname`: create the session identity and subscribe every
    /// configured channel. The first configured channel is primary and
    /// carries presence.
    pub fn join(&mut self, nickname: &str) -> Result<()> {
        if self.nickname.is_some() {
            return Err(ChatError::Validation("already joined".into()));
        }
        let nickname = self.validate_nickname(nickname)?;

        self.user_id = uuid::Uuid::new_v4().to_string();
        self.identity = self.init_identity();
        self.nickname = Some(nickname.clone());
        info!(
            user_id = %self.user_id,
            nickname = %nickname,
            signed = self.identity.is_some(),
            "Joining chat"
        );

        self.set_input(false);
        self.set_state(ConnectionState::Connecting);

        let channels = self.config.channels.clone();
        for (i, channel) in channels.iter().enumerate() {
            let is_primary = i == 0;
            if let Err(e) = self.subscribe(channel, is_primary) {
                warn!(channel = %channel, error = %e, "Subscribe failed");
                if is_primary {
                    self.on_primary_lost(&e.to_string());
                }
            }
        }

        self.active.clone_from(&self.config.default_channel);
        self.emit_channel_changed();
        self.maintenance_at = Some(Instant::now() + self.maintenance_interval);
        Ok(())
    }

    fn validate_nickname(&self, raw: &str) -> Result<String> {
        let nickname = raw.trim();
        let rules = &self.config.nickname;
        let len = nickname.chars().count();
        if len < rules.min_length.max(1) || len > rules.max_length {
            return Err(ChatError::Validation(format!(
                "nickname must be {}-{} characters",
                rules.min_length.max(1),
                rules.max_length
            )));
        }
        if self
            .nick_pattern
            .as_ref()
            .is_some_and(|re| !re.is_match(nickname))
        {
            return Err(ChatError::Validation(
                "nickname may only contain letters, digits, spaces, '_' and '-'".into(),
            ));
        }
        self.automod
            .check_keywords(nickname)
            .map_err(ChatError::ContentPolicy)?;
        Ok(nickname.to_string())
    }

    fn init_identity(&self) -> Option<Identity> {
        match &self.identity_mode {
            IdentityMode::Disabled => None,
            IdentityMode::Ephemeral => Some(Identity::generate()),
            IdentityMode::Persistent(path) => match Identity::load_or_generate(path) {
                Ok(identity) => Some(identity),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Identity unavailable, continuing unsigned");
                    self.notice(
                        NoticeLevel::Warning,
                        "Signing keys unavailable: your messages will show as unverified",
                    );
                    None
                }
            },
        }
    }

    /// Subscribe `channel_id`, deriving and caching its key. Already-open
    /// channels are left alone; closed ones are resubscribed.
    pub fn subscribe(&mut self, channel_id: &str, is_primary: bool) -> Result<()> {
        if let Some(session) = self.channels.get(channel_id) {
            if session.state() == SubscriptionState::Closed {
                return self.resubscribe(channel_id);
            }
            return Ok(());
        }

        let key = self.channel_key(channel_id);
        let options = if is_primary {
            ChannelOptions::with_presence(self.user_id.clone())
        } else {
            ChannelOptions::default()
        };
        let subscription = self.transport.subscribe(channel_id, options)?;
        let session = ChannelSession::new(
            channel_id,
            key,
            subscription,
            self.config.history_capacity,
            self.subscribe_deadline(),
        )
        .with_primary(is_primary);

        debug!(channel = %channel_id, %subscription, is_primary, "Subscribing");
        self.subscriptions
            .insert(subscription, channel_id.to_string());
        self.channels.insert(channel_id.to_string(), session);
        Ok(())
    }

    fn channel_key(&mut self, channel_id: &str) -> ChannelKey {
        let rounds = self.config.kdf_rounds;
        self.key_cache
            .entry(channel_id.to_string())
            .or_insert_with(|| derive_channel_key_with_rounds(channel_id, rounds))
            .clone()
    }

    /// Replace a channel's subscription, keeping its key and history.
    fn resubscribe(&mut self, channel_id: &str) -> Result<()> {
        let Some(session) = self.channels.get(channel_id) else {
            return Err(ChatError::UnknownChannel(channel_id.to_string()));
        };
        let old = session.subscription();
        let options = if session.is_primary() {
            ChannelOptions::with_presence(self.user_id.clone())
        } else {
            ChannelOptions::default()
        };
        self.subscriptions.remove(&old);
        self.transport.unsubscribe(old);

        let deadline = self.subscribe_deadline();
        match self.transport.subscribe(channel_id, options) {
            Ok(subscription) => {
                if let Some(session) = self.channels.get_mut(channel_id) {
                    session.resubscribe(subscription, deadline);
                }
                self.subscriptions
                    .insert(subscription, channel_id.to_string());
                debug!(channel = %channel_id, %subscription, "Resubscribing");
                Ok(())
            }
            Err(e) => {
                if let Some(session) = self.channels.get_mut(channel_id) {
                    session.mark_closed();
                }
                Err(e.into())
            }
        }
    }

    /// Remove a channel entirely.
    fn drop_channel(&mut self, channel_id: &str) {
        if let Some(session) = self.channels.remove(channel_id) {
            self.subscriptions.remove(&session.subscription());
            self.transport.unsubscribe(session.subscription());
        }
    }

    fn subscribe_deadline(&self) -> Instant {
        let timeout = self.config.subscribe_timeout_secs.min(MAX_TIMER_SECS);
        Instant::now() + Duration::from_secs(timeout)
    }

    /// Make `channel_id` the active channel without any subscription changes.
    pub fn switch_channel(&mut self, channel_id: &str) -> Result<()> {
        let result = self.switch_to(channel_id);
        self.report(result)
    }

    fn switch_to(&mut self, channel_id: &str) -> Result<()> {
        if self.active == channel_id {
            return Ok(());
        }
        let Some(target) = self.channels.get(channel_id) else {
            return Err(ChatError::UnknownChannel(channel_id.to_string()));
        };
        if target.dm_peer().is_some() {
            return Err(ChatError::UnknownChannel(channel_id.to_string()));
        }
        let closed = target.state() == SubscriptionState::Closed;

        if let Some(pending) = self.pending_dm.take() {
            debug!(channel = %pending, "Abandoning pending direct message");
            self.drop_channel(&pending);
        }
        if let Some(dm) = self.dm.take() {
            self.drop_channel(&dm);
        }
        self.show_channel(channel_id);
        if closed {
            self.resubscribe(channel_id)?;
        }
        Ok(())
    }

    /// Point the UI at `channel_id`: clear its unread count and replay history.
    fn show_channel(&mut self, channel_id: &str) {
        self.active = channel_id.to_string();
        let Some(session) = self.channels.get_mut(channel_id) else {
            self.emit_channel_changed();
            return;
        };
        let had_unread = session.unread() > 0;
        session.clear_unread();
        let entries = session.history_snapshot();

        info!(channel = %channel_id, "Switched channel");
        self.emit_channel_changed();
        if had_unread {
            self.emit(ChatEvent::Unread {
                channel: channel_id.to_string(),
                count: 0,
            });
        }
        self.emit(ChatEvent::HistoryReplay {
            channel: channel_id.to_string(),
            entries,
        });
    }

    /// Manual retry: reset the backoff and resubscribe whatever is not connected.
    pub fn retry(&mut self) -> Result<()> {
        let result = self.retry_now();
        self.report(result)
    }

    fn retry_now(&mut self) -> Result<()> {
        if self.nickname.is_none() {
            return Err(ChatError::NotConnected);
        }
        info!("Manual retry");
        self.attempts = 0;
        self.reconnect_at = None;
        self.emit(ChatEvent::Retry { visible: false });

        let primary = self.primary.clone();
        if self.state != ConnectionState::Connected {
            self.set_state(ConnectionState::Connecting);
            if let Err(e) = self.resubscribe(&primary) {
                self.on_primary_lost(&e.to_string());
                return Err(e);
            }
        }
        let active = self.active.clone();
        let active_down = self
            .channels
            .get(&active)
            .is_some_and(|s| s.state() != SubscriptionState::Subscribed);
        if active != primary && active_down {
            self.resubscribe(&active)?;
        }
        if let Some(pending) = self.pending_dm.clone() {
            self.retry_pending_dm(&pending)?;
        }
        Ok(())
    }

    /// Cancel timers, withdraw presence and unsubscribe everything.
    pub fn teardown(&mut self) {
        if self.nickname.is_none() && self.channels.is_empty() {
            return;
        }
        info!(user_id = %self.user_id, "Tearing down chat session");

        self.reconnect_at = None;
        self.maintenance_at = None;
        if let Some(primary) = self.channels.get(&self.primary) {
            self.transport.presence_untrack(primary.subscription());
        }
        for (_, session) in self.channels.drain() {
            self.transport.unsubscribe(session.subscription());
        }
        self.subscriptions.clear();
        self.dm = None;
        self.pending_dm = None;
        self.roster.clear();
        self.nickname = None;
        self.attempts = 0;

        self.set_input(false);
        self.set_state(ConnectionState::Disconnected);
    }

    // ── transport events ──

    /// Process every transport event already queued. Returns how many there were.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.transport_events.try_recv() {
            self.handle_transport_event(event);
            handled += 1;
        }
        handled
    }

    /// Dispatch one transport event. Events for replaced or closed
    /// subscriptions are ignored.
    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        let Some(channel_id) = self.subscriptions.get(&event.subscription).cloned() else {
            debug!(subscription = %event.subscription, "Ignoring event for stale subscription");
            return;
        };
        match event.kind {
            TransportEventKind::Status(status) => self.on_status(&channel_id, status),
            TransportEventKind::Broadcast { event, payload } => {
                if event != MESSAGE_EVENT {
                    debug!(channel = %channel_id, event = %event, "Ignoring broadcast event");
                    return;
                }
                match serde_json::from_value::<MessageEnvelope>(payload) {
                    Ok(envelope) => self.receive(&channel_id, envelope),
                    Err(e) => {
                        debug!(channel = %channel_id, error = %e, "Dropping malformed envelope");
                    }
                }
            }
            TransportEventKind::PresenceSync(state) => {
                if channel_id == self.primary {
                    self.roster.sync(&state, &self.user_id);
                    self.emit_roster();
                }
            }
            TransportEventKind::PresenceJoin { key, record } => {
                self.on_presence_join(&channel_id, &key, &record);
            }
            TransportEventKind::PresenceLeave { key } => self.on_presence_leave(&channel_id, &key),
        }
    }

    fn on_status(&mut self, channel_id: &str, status: SubscribeStatus) {
        let is_primary = channel_id == self.primary;
        if status == SubscribeStatus::Subscribed {
            if let Some(session) = self.channels.get_mut(channel_id) {
                session.mark_subscribed();
            }
            if is_primary {
                self.on_primary_connected();
            } else if self.pending_dm.as_deref() == Some(channel_id) {
                self.activate_dm(channel_id);
            } else {
                debug!(channel = %channel_id, "Channel subscribed");
            }
            return;
        }

        let reason = match status {
            SubscribeStatus::Error(e) => e,
            _ => "closed".to_string(),
        };
        if let Some(session) = self.channels.get_mut(channel_id) {
            session.mark_closed();
        }
        if is_primary {
            self.on_primary_lost(&reason);
        } else if self.pending_dm.as_deref() == Some(channel_id) {
            self.fail_pending_dm(channel_id, &reason);
        } else {
            warn!(channel = %channel_id, reason = %reason, "Channel subscription lost");
            if self.active == channel_id {
                let label = channel_label(
                    channel_id,
                    self.channels.get(channel_id).and_then(ChannelSession::dm_peer),
                );
                self.notice(NoticeLevel::Warning, format!("Lost connection to {label}"));
            }
        }
    }

    fn on_primary_connected(&mut self) {
        self.attempts = 0;
        self.reconnect_at = None;
        self.set_state(ConnectionState::Connected);
        self.set_input(true);
        self.emit(ChatEvent::Retry { visible: false });
        let mode = if self.identity.is_some() {
            "signed"
        } else {
            "unsigned"
        };
        info!(channel = %self.primary, mode, "Connected");
        self.notice(
            NoticeLevel::Info,
            format!("Connected. Messages are end-to-end encrypted ({mode})."),
        );
        self.track_presence();
    }

    fn track_presence(&mut self) {
        let Some(subscription) = self.channels.get(&self.primary).map(ChannelSession::subscription)
        else {
            return;
        };
        let nickname = self.nickname.clone().unwrap_or_default();
        let record = PresenceRecord::announce(&nickname, self.identity.as_ref());
        if let Err(e) = self.transport.presence_track(subscription, &record) {
            warn!(error = %e, "Failed to announce presence");
            return;
        }
        let state = self.transport.presence_state(subscription);
        self.roster.sync(&state, &self.user_id);
        self.emit_roster();
    }

    /// Primary subscription closed or failed: schedule a backoff reconnect,
    /// or give up once attempts are exhausted.
    fn on_primary_lost(&mut self, reason: &str) {
        if self.nickname.is_none() {
            return;
        }
        self.set_input(false);
        if self.state == ConnectionState::Error || self.reconnect_at.is_some() {
            return;
        }
        if self.reconnect.exhausted(self.attempts) {
            warn!(attempts = self.attempts, reason, "Max reconnect attempts reached");
            self.set_state(ConnectionState::Error);
            self.notice(
                NoticeLevel::Error,
                "Connection lost and automatic reconnect gave up. Use retry to reconnect manually.",
            );
            self.emit(ChatEvent::Retry { visible: true });
            return;
        }

        let delay = self.reconnect.next_delay(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        self.reconnect_at = Some(Instant::now() + delay);
        self.set_state(ConnectionState::Disconnected);
        warn!(
            reason,
            attempt = self.attempts,
            delay_ms = delay.as_millis(),
            "Primary channel lost, reconnecting"
        );
        self.notice(
            NoticeLevel::Warning,
            format!(
                "Disconnected. Reconnecting in {}s (attempt {}/{})",
                delay.as_secs().max(1),
                self.attempts,
                self.reconnect.limit
            ),
        );
    }

    fn reconnect_now(&mut self) {
        self.reconnect_at = None;
        self.set_state(ConnectionState::Connecting);
        info!(attempt = self.attempts, "Reconnecting");

        let primary = self.primary.clone();
        if let Err(e) = self.resubscribe(&primary) {
            self.on_primary_lost(&e.to_string());
            return;
        }
        let active = self.active.clone();
        if active != primary {
            if let Err(e) = self.resubscribe(&active) {
                warn!(channel = %active, error = %e, "Failed to resubscribe active channel");
            }
        }
    }

    fn on_presence_join(&mut self, channel_id: &str, key: &str, record: &PresenceRecord) {
        if channel_id != self.primary || key == self.user_id {
            return;
        }
        if self.roster.join(key, record) {
            let nickname = crate::envelope::truncate_nick(&record.nick);
            let entry = ChatEntry::presence(MessageBody::PresenceJoin { nickname }, now_ts());
            self.deliver(channel_id, entry);
        }
        self.emit_roster();
    }

    fn on_presence_leave(&mut self, channel_id: &str, key: &str) {
        if channel_id != self.primary {
            return;
        }
        if let Some(peer) = self.roster.leave(key) {
            let entry = ChatEntry::presence(
                MessageBody::PresenceLeave {
                    nickname: peer.nickname,
                },
                now_ts(),
            );
            self.deliver(channel_id, entry);
            self.emit_roster();
        }
    }

    // ── timers ──

    /// Fire whatever deadlines have passed at `now`.
    pub fn on_tick(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .channels
            .iter_mut()
            .filter_map(|(id, session)| session.take_expired(now).then(|| id.clone()))
            .collect();
        for channel in expired {
            warn!(channel = %channel, "Subscription not confirmed in time");
            let label = channel_label(
                &channel,
                self.channels.get(&channel).and_then(ChannelSession::dm_peer),
            );
            self.notice(
                NoticeLevel::Warning,
                format!("Still waiting to connect to {label}"),
            );
            self.emit(ChatEvent::Retry { visible: true });
        }

        if self.reconnect_at.is_some_and(|at| at <= now) {
            self.reconnect_now();
        }

        if self.maintenance_at.is_some_and(|at| at <= now) {
            let now_ms = self.clock_ms();
            self.automod.maintain(now_ms);
            self.maintenance_at = Some(now + self.maintenance_interval);
        }
    }

    /// The earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.channels
            .values()
            .filter_map(ChannelSession::deadline)
            .chain(self.reconnect_at)
            .chain(self.maintenance_at)
            .min()
    }

    /// Drive the session until `commands` closes or `shutdown` flips, then
    /// tear down.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<ChatCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                info!("Chat session shutting down");
                break;
            }
            let deadline = self.next_deadline();
            let sleep_until = tokio::time::Instant::from_std(
                deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600)),
            );

            tokio::select! {
                Some(event) = self.transport_events.recv() => {
                    self.handle_transport_event(event);
                }
                command = commands.recv() => {
                    let Some(command) = command else {
                        info!("Command channel closed");
                        break;
                    };
                    self.apply(command);
                }
                () = tokio::time::sleep_until(sleep_until), if deadline.is_some() => {
                    self.on_tick(Instant::now());
                }
                _ = shutdown.changed() => {
                    info!("Chat session shutting down");
                    break;
                }
            }
        }
        self.teardown();
    }

    fn apply(&mut self, command: ChatCommand) {
        let result = match command {
            ChatCommand::Send(text) => self.send(&text),
            ChatCommand::SendImage(data_url) => self.send_image(&data_url),
            ChatCommand::SwitchChannel(channel) => self.switch_channel(&channel),
            ChatCommand::StartDm(nickname) => self.start_dm_with(&nickname),
            ChatCommand::CloseDm => {
                self.close_dm();
                Ok(())
            }
            ChatCommand::Retry => self.retry(),
        };
        if let Err(e) = result {
            debug!(error = %e, "Command failed");
        }
    }

    // ── output helpers ──

    fn emit(&self, event: ChatEvent) {
        // A dropped receiver means the host is gone; the session keeps running headless.
        let _ = self.events.send(event);
    }

    fn notice(&self, level: NoticeLevel, text: impl Into<String>) {
        self.emit(ChatEvent::Notice {
            level,
            text: text.into(),
        });
    }

    /// Show an operation's failure to the user and hand it back to the caller.
    /// Validation and policy failures are shown as `Blocked` where they occur.
    fn report<V>(&self, result: Result<V>) -> Result<V> {
        if let Err(e) = &result {
            match e {
                ChatError::Validation(_) | ChatError::ContentPolicy(_) => {}
                other => self.notice(NoticeLevel::Error, other.to_string()),
            }
        }
        result
    }

    fn emit_roster(&self) {
        self.emit(ChatEvent::Roster(self.roster.peers()));
    }

    fn emit_channel_changed(&self) {
        let peer = self.channels.get(&self.active).and_then(ChannelSession::dm_peer);
        self.emit(ChatEvent::ChannelChanged {
            channel: self.active.clone(),
            label: channel_label(&self.active, peer),
        });
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            self.state = state;
            self.emit(ChatEvent::Status(state));
        }
    }

    fn set_input(&mut self, enabled: bool) {
        if self.input_enabled != enabled {
            self.input_enabled = enabled;
            self.emit(ChatEvent::InputEnabled(enabled));
        }
    }

    /// Store an entry and either render it or bump the channel's unread count.
    fn deliver(&mut self, channel_id: &str, entry: ChatEntry) {
        let is_active = self.active == channel_id;
        let Some(session) = self.channels.get_mut(channel_id) else {
            return;
        };
        session.push(entry.clone());
        if is_active {
            self.emit(ChatEvent::Message {
                channel: channel_id.to_string(),
                entry,
            });
        } else {
            session.mark_unread();
            let count = session.unread();
            self.emit(ChatEvent::Unread {
                channel: channel_id.to_string(),
                count,
            });
        }
    }

    fn clock_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn block(&self, reason: crate::events::BlockReason) -> ChatError {
        use crate::events::BlockReason;

        debug!(reason = %reason, "Outgoing message blocked");
        self.emit(ChatEvent::Blocked { reason });
        match reason {
            BlockReason::Empty | BlockReason::TooLong { .. } => {
                ChatError::Validation(reason.to_string())
            }
            BlockReason::RateLimited => ChatError::ContentPolicy(ModerationReason::RateLimited),
            BlockReason::Moderation(reason) => ChatError::ContentPolicy(reason),
        }
    }
}

/// Header text for a channel.
fn channel_label(channel_id: &str, dm_peer: Option<&crate::channel::DmPeer>) -> String {
    dm_peer.map_or_else(
        || format!("#{channel_id}"),
        |peer| format!("DM with {}", peer.nickname),
    )
}

/// Wall-clock Unix milliseconds.
fn now_ts() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
