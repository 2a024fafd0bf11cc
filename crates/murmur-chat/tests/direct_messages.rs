#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Direct messages keyed by X25519 agreement.

mod common;

use common::{Client, test_config, text_of};
use murmur_chat::envelope::{MessageEnvelope, Verification};
use murmur_chat::events::NoticeLevel;
use murmur_chat::transport::memory::MemoryHub;
use murmur_chat::transport::{ChannelOptions, Transport, TransportEventKind};
use murmur_chat::{ChatError, ChatEvent, IdentityMode, dm_channel_id};
use murmur_crypto::{Identity, derive_channel_key_with_rounds};

/// Alice and Bob on `general`, each aware of the other through presence.
fn pair(hub: &MemoryHub) -> (Client, Client) {
    pair_on(hub, &["general"])
}

fn pair_on(hub: &MemoryHub, channels: &[&str]) -> (Client, Client) {
    let config = test_config(channels);
    let mut alice = Client::joined(hub, &config, "Alice", IdentityMode::Ephemeral);
    let mut bob = Client::joined(hub, &config, "Bob", IdentityMode::Ephemeral);
    alice.core.pump();
    alice.drain();
    bob.drain();
    (alice, bob)
}

/// Both sides open the DM and process their confirmations.
fn open_dm(alice: &mut Client, bob: &mut Client) -> String {
    alice.core.start_dm_with("Bob").unwrap();
    alice.core.pump();
    bob.core.start_dm_with("Alice").unwrap();
    bob.core.pump();
    alice.drain();
    bob.drain();
    alice.core.dm_channel().unwrap().to_string()
}

fn has_notice(events: &[ChatEvent], level: NoticeLevel, needle: &str) -> bool {
    events.iter().any(|e| {
        matches!(e, ChatEvent::Notice { level: l, text } if *l == level && text.contains(needle))
    })
}

// =========================================================================
// Opening and messaging
// =========================================================================

#[test]
fn both_sides_meet_on_the_same_channel() {
    let hub = MemoryHub::new();
    let (mut alice, mut bob) = pair(&hub);

    let dm = open_dm(&mut alice, &mut bob);

    assert_eq!(bob.core.dm_channel(), Some(dm.as_str()));
    assert_eq!(
        dm,
        dm_channel_id(alice.core.fingerprint().unwrap(), bob.core.fingerprint().unwrap())
    );
    assert_eq!(alice.core.active_channel(), dm);
    assert_eq!(hub.subscriber_count(&dm), 2);
}

#[test]
fn dm_activates_with_notice_and_header() {
    let hub = MemoryHub::new();
    let (mut alice, _bob) = pair(&hub);

    alice.core.start_dm_with("Bob").unwrap();
    assert_eq!(alice.core.active_channel(), "general", "pending until confirmed");
    alice.core.pump();

    let events = alice.drain();
    let dm = alice.core.dm_channel().unwrap().to_string();
    assert!(events.contains(&ChatEvent::ChannelChanged {
        channel: dm,
        label: "DM with Bob".into()
    }));
    assert!(has_notice(&events, NoticeLevel::Info, "Only the two of you"));
}

#[test]
fn dm_message_is_verified_and_stays_out_of_group() {
    let hub = MemoryHub::new();
    let (mut alice, mut bob) = pair(&hub);
    let dm = open_dm(&mut alice, &mut bob);

    alice.core.send("just between us").unwrap();

    let got = bob.received();
    assert_eq!(got.len(), 1);
    assert_eq!(text_of(&got[0]), "just between us");
    assert_eq!(got[0].verification, Verification::Verified);
    assert_eq!(hub.published(&dm).len(), 1);
    assert!(hub.published("general").is_empty());
}

#[test]
fn repeated_start_is_a_no_op() {
    let hub = MemoryHub::new();
    let (mut alice, mut bob) = pair(&hub);
    let dm = open_dm(&mut alice, &mut bob);

    alice.core.start_dm_with("Bob").unwrap();
    alice.core.pump();

    assert!(alice.drain().is_empty());
    assert_eq!(hub.subscriber_count(&dm), 2);
}

// =========================================================================
// Confidentiality
// =========================================================================

#[test]
fn observer_with_the_channel_id_cannot_read() {
    let hub = MemoryHub::new();
    let (mut alice, mut bob) = pair(&hub);
    let dm = open_dm(&mut alice, &mut bob);

    let (mut observer, mut rx) = hub.connect();
    observer.subscribe(&dm, ChannelOptions::default()).unwrap();
    while rx.try_recv().is_ok() {}

    alice.core.send("not for you").unwrap();

    let event = rx.try_recv().unwrap();
    let TransportEventKind::Broadcast { payload, .. } = event.kind else {
        panic!("expected broadcast, got {:?}", event.kind);
    };
    let envelope: MessageEnvelope = serde_json::from_value(payload).unwrap();

    let id_key = derive_channel_key_with_rounds(&dm, common::TEST_KDF_ROUNDS);
    assert!(id_key.decrypt_wire(&envelope.iv, &envelope.ct).is_err());

    let mallory = Identity::generate();
    let alice_exchange = alice.core.identity().unwrap().public_keys().exchange;
    let wrong_key = mallory.derive_shared_key(&alice_exchange).unwrap();
    assert!(wrong_key.decrypt_wire(&envelope.iv, &envelope.ct).is_err());
}

// =========================================================================
// Failures
// =========================================================================

#[test]
fn dm_requires_an_identity() {
    let hub = MemoryHub::new();
    let config = test_config(&["general"]);
    let mut anon = Client::joined(&hub, &config, "Anon", IdentityMode::Disabled);
    let bob = Identity::generate();
    anon.drain();

    let keys = bob.public_keys();
    let result = anon.core.start_dm("Bob", &keys.fingerprint, &keys.exchange);

    assert!(matches!(result, Err(ChatError::NoIdentity)));
    assert!(has_notice(&anon.drain(), NoticeLevel::Error, "identity"));
}

#[test]
fn unknown_or_keyless_peers_are_rejected() {
    let hub = MemoryHub::new();
    let config = test_config(&["general"]);
    let mut alice = Client::joined(&hub, &config, "Alice", IdentityMode::Ephemeral);
    let _anon = Client::joined(&hub, &config, "Anon", IdentityMode::Disabled);
    alice.core.pump();

    assert!(matches!(
        alice.core.start_dm_with("Nobody"),
        Err(ChatError::UnknownPeer(_))
    ));
    assert!(matches!(
        alice.core.start_dm_with("Anon"),
        Err(ChatError::UnknownPeer(_))
    ));
    assert!(matches!(
        alice.core.start_dm("Bob", "aa:bb", ""),
        Err(ChatError::UnknownPeer(_))
    ));
    assert_eq!(alice.core.active_channel(), "general");
}

#[test]
fn failed_subscription_leaves_current_channel_untouched() {
    let hub = MemoryHub::new();
    let (mut alice, bob) = pair(&hub);

    hub.set_online(false);
    alice.core.start_dm_with("Bob").unwrap();
    alice.core.pump();

    let events = alice.drain();
    assert!(has_notice(&events, NoticeLevel::Error, "Could not open direct message"));
    assert!(!events.iter().any(|e| matches!(e, ChatEvent::ChannelChanged { .. })));
    assert_eq!(alice.core.active_channel(), "general");
    assert!(alice.core.dm_channel().is_none());
    let dm = dm_channel_id(
        alice.core.fingerprint().unwrap(),
        bob.core.fingerprint().unwrap(),
    );
    assert!(alice.core.channel(&dm).is_none());
}

#[test]
fn dm_requires_a_connection() {
    let hub = MemoryHub::new();
    let config = test_config(&["general"]);
    let mut alice = Client::new(&hub, &config, IdentityMode::Ephemeral);
    assert!(matches!(
        alice.core.start_dm_with("Bob"),
        Err(ChatError::UnknownPeer(_) | ChatError::NotConnected)
    ));
    let bob = Identity::generate().public_keys();
    assert!(matches!(
        alice.core.start_dm("Bob", &bob.fingerprint, &bob.exchange),
        Err(ChatError::NotConnected)
    ));
}

// =========================================================================
// Slow confirmations
// =========================================================================

/// Alice asks for a DM with Bob while the hub withholds confirmations, and
/// lets the confirmation deadline pass.
fn timed_out_dm(hub: &MemoryHub) -> (Client, Client, String) {
    let (mut alice, bob) = pair(hub);
    let dm = dm_channel_id(
        alice.core.fingerprint().unwrap(),
        bob.core.fingerprint().unwrap(),
    );
    hub.hold_confirmations(true);
    alice.core.start_dm_with("Bob").unwrap();
    alice.core.pump();

    let deadline = alice.core.next_deadline().unwrap();
    alice.core.on_tick(deadline);
    let events = alice.drain();
    assert!(events.contains(&ChatEvent::Retry { visible: true }));
    assert!(has_notice(&events, NoticeLevel::Warning, "DM with Bob"));
    assert!(alice.core.dm_channel().is_none());
    (alice, bob, dm)
}

#[test]
fn retry_resubscribes_a_timed_out_dm() {
    let hub = MemoryHub::new();
    let (mut alice, _bob, dm) = timed_out_dm(&hub);

    hub.hold_confirmations(false);
    alice.core.retry().unwrap();
    alice.core.pump();

    assert_eq!(alice.core.dm_channel(), Some(dm.as_str()));
    assert_eq!(alice.core.active_channel(), dm);
    assert_eq!(hub.subscriber_count(&dm), 1);
}

#[test]
fn starting_again_resubscribes_a_timed_out_dm() {
    let hub = MemoryHub::new();
    let (mut alice, _bob, dm) = timed_out_dm(&hub);

    hub.hold_confirmations(false);
    alice.core.start_dm_with("Bob").unwrap();
    alice.core.pump();

    assert_eq!(alice.core.dm_channel(), Some(dm.as_str()));
    assert_eq!(hub.subscriber_count(&dm), 1);
}

#[test]
fn starting_again_while_waiting_keeps_one_subscription() {
    let hub = MemoryHub::new();
    let (mut alice, bob) = pair(&hub);
    let dm = dm_channel_id(
        alice.core.fingerprint().unwrap(),
        bob.core.fingerprint().unwrap(),
    );
    hub.hold_confirmations(true);

    alice.core.start_dm_with("Bob").unwrap();
    alice.core.start_dm_with("Bob").unwrap();

    assert_eq!(hub.subscriber_count(&dm), 1);
    assert!(alice.core.dm_channel().is_none());
}

#[test]
fn switching_away_abandons_a_pending_dm() {
    let hub = MemoryHub::new();
    let (mut alice, bob) = pair_on(&hub, &["general", "random"]);
    let dm = dm_channel_id(
        alice.core.fingerprint().unwrap(),
        bob.core.fingerprint().unwrap(),
    );

    alice.core.start_dm_with("Bob").unwrap();
    alice.core.switch_channel("random").unwrap();
    alice.core.pump();

    assert_eq!(alice.core.active_channel(), "random");
    assert!(alice.core.dm_channel().is_none());
    assert!(alice.core.channel(&dm).is_none());
    assert_eq!(hub.subscriber_count(&dm), 0);
}

#[test]
fn lost_dm_is_named_after_the_peer() {
    let hub = MemoryHub::new();
    let (mut alice, mut bob) = pair(&hub);
    open_dm(&mut alice, &mut bob);

    hub.drop_all();
    alice.core.pump();

    assert!(has_notice(
        &alice.drain(),
        NoticeLevel::Warning,
        "Lost connection to DM with Bob"
    ));
}

// =========================================================================
// Leaving
// =========================================================================

#[test]
fn close_dm_returns_to_default_channel() {
    let hub = MemoryHub::new();
    let (mut alice, mut bob) = pair(&hub);
    let dm = open_dm(&mut alice, &mut bob);

    alice.core.close_dm();

    assert!(alice.core.dm_channel().is_none());
    assert_eq!(alice.core.active_channel(), "general");
    assert!(alice.core.channel(&dm).is_none());
    assert_eq!(hub.subscriber_count(&dm), 1);
    assert!(alice.drain().contains(&ChatEvent::ChannelChanged {
        channel: "general".into(),
        label: "#general".into()
    }));
}

#[test]
fn switching_channels_closes_the_dm() {
    let hub = MemoryHub::new();
    let (mut alice, mut bob) = pair(&hub);
    let dm = open_dm(&mut alice, &mut bob);

    alice.core.switch_channel(&dm).unwrap();
    alice.core.switch_channel("general").unwrap();

    assert!(alice.core.dm_channel().is_none());
    assert_eq!(alice.core.active_channel(), "general");
    assert_eq!(hub.subscriber_count(&dm), 1);
}

#[test]
fn dm_channels_are_not_switch_targets() {
    let hub = MemoryHub::new();
    let (mut alice, mut bob) = pair(&hub);
    let dm = open_dm(&mut alice, &mut bob);
    alice.core.close_dm();

    assert!(matches!(
        alice.core.switch_channel(&dm),
        Err(ChatError::UnknownChannel(_))
    ));
    // Bob still holds the DM open; his messages there no longer reach Alice.
    bob.core.send("hello?").unwrap();
    assert!(alice.received().is_empty());
}
