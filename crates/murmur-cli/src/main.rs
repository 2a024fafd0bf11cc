//! Murmur CLI
//!
//! Inspect the local identity and trust store, or watch two clients talk
//! over an in-process hub.

mod render;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use murmur_chat::transport::memory::MemoryHub;
use murmur_chat::{ChatCommand, ChatCore, ChatEvent, IdentityMode};
use murmur_core::Config;
use murmur_core::config::load_config;
use murmur_core::tracing_init::init_tracing;
use murmur_crypto::{Identity, TrustStore};

/// Pause between demo steps so both event loops settle.
const STEP: Duration = Duration::from_millis(150);

#[derive(Debug, Parser)]
#[command(name = "murmur", version, about = "Ephemeral end-to-end encrypted chat")]
struct Cli {
    /// Settings file layered over the global one
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, global = true, env = "MURMUR_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show this device's identity fingerprint, creating the key file if needed
    Fingerprint,
    /// Inspect the trust-on-first-use store
    Trust {
        #[command(subcommand)]
        action: TrustAction,
    },
    /// Run two clients against an in-process hub and print what one of them sees
    Demo {
        /// Messages Alice sends to the group channel
        #[arg(default_values_t = vec!["hello :wave:".to_string(), "anyone here?".to_string()])]
        messages: Vec<String>,
    },
}

#[derive(Debug, Subcommand)]
enum TrustAction {
    /// List every nickname and the fingerprint first seen for it
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_json);

    let config = load_config(cli.config.as_deref()).context("Failed to load configuration")?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting murmur CLI");

    match cli.command {
        Commands::Fingerprint => show_fingerprint(&config),
        Commands::Trust {
            action: TrustAction::List,
        } => list_trust(&config),
        Commands::Demo { messages } => run_demo(&config, messages).await,
    }
}

#[allow(clippy::print_stdout)]
fn show_fingerprint(config: &Config) -> Result<()> {
    let path = config
        .identity_key_path()
        .context("No identity key path configured and no config directory available")?;
    let identity = Identity::load_or_generate(&path)
        .with_context(|| format!("Failed to load identity from {}", path.display()))?;
    let keys = identity.public_keys();

    println!("Fingerprint: {}", keys.fingerprint);
    println!("  Signing key:  {}", keys.signing);
    println!("  Exchange key: {}", keys.exchange);
    println!("  Key file:     {}", path.display());
    Ok(())
}

#[allow(clippy::print_stdout)]
fn list_trust(config: &Config) -> Result<()> {
    let path = config
        .trust_store_path()
        .context("No trust store path configured and no config directory available")?;
    let store = TrustStore::open(&path);
    if store.is_empty() {
        println!("No trusted keys in {}", path.display());
        return Ok(());
    }

    let mut entries = store.entries();
    entries.sort_by(|a, b| a.nickname.cmp(&b.nickname));
    for entry in entries {
        let first_seen = Local
            .timestamp_millis_opt(entry.first_seen)
            .single()
            .map_or_else(|| "?".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string());
        println!("{:<20} {}  first seen {first_seen}", entry.nickname, entry.fingerprint);
    }
    Ok(())
}

struct DemoClient {
    commands: mpsc::Sender<ChatCommand>,
    session: JoinHandle<()>,
}

/// Join `nickname` on `hub` and drive it on its own task.
fn spawn_client(
    hub: &MemoryHub,
    config: &Config,
    nickname: &str,
    shutdown: watch::Receiver<bool>,
) -> Result<(DemoClient, mpsc::UnboundedReceiver<ChatEvent>)> {
    // Demo identities are throwaway; keep their fingerprints out of the real trust store.
    let mut config = config.clone();
    config.trust.persist = false;
    let (transport, transport_events) = hub.connect();
    let (core, events) = ChatCore::new(&config, transport, transport_events);
    let mut core = core.with_identity_mode(IdentityMode::Ephemeral);
    core.join(nickname)
        .with_context(|| format!("{nickname} could not join"))?;

    let (commands, commands_rx) = mpsc::channel(32);
    let session = tokio::spawn(core.run(commands_rx, shutdown));
    Ok((DemoClient { commands, session }, events))
}

#[allow(clippy::print_stdout)]
async fn run_demo(config: &Config, messages: Vec<String>) -> Result<()> {
    let hub = MemoryHub::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (alice, mut alice_events) = spawn_client(&hub, config, "Alice", shutdown_rx.clone())?;
    let (bob, mut bob_events) = spawn_client(&hub, config, "Bob", shutdown_rx)?;

    let printer = tokio::spawn(async move {
        while let Some(event) = bob_events.recv().await {
            if let Some(line) = render::line(&event) {
                println!("bob | {line}");
            }
        }
    });
    // Alice's own view is not shown; keep her queue drained.
    let drain = tokio::spawn(async move { while alice_events.recv().await.is_some() {} });
    tokio::time::sleep(STEP).await;

    for text in messages {
        alice.commands.send(ChatCommand::Send(text)).await?;
    }
    tokio::time::sleep(STEP).await;

    alice
        .commands
        .send(ChatCommand::StartDm("Bob".into()))
        .await?;
    bob.commands
        .send(ChatCommand::StartDm("Alice".into()))
        .await?;
    tokio::time::sleep(STEP).await;
    alice
        .commands
        .send(ChatCommand::Send("this one is just for you".into()))
        .await?;
    tokio::time::sleep(STEP).await;

    println!(
        "hub | {} ciphertext payload(s) published on #{}",
        hub.published(&config.chat.default_channel).len(),
        config.chat.default_channel
    );

    shutdown_tx.send(true)?;
    alice.session.await?;
    bob.session.await?;
    printer.await?;
    drain.await?;
    Ok(())
}
