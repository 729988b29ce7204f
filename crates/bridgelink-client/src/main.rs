//! BridgeLink command-line client.
//!
//! Wires the settings file, the persistent state file, discovery, the trust
//! store, the config resolver and the pinned transport together, then runs
//! one subcommand.
//!
//! # Usage
//!
//! ```text
//! bridgelink discover [--timeout-ms <MS>]
//! bridgelink pair <NAME> [--yes]
//! bridgelink trust list
//! bridgelink trust remove <BRIDGE_ID>
//! bridgelink trust resolve <BRIDGE_ID> <retrust|reject|forget>
//! bridgelink config show
//! bridgelink config reset
//! bridgelink config apply-link <LINK> [--bridge <BRIDGE_ID>]
//! bridgelink call <METHOD> [KEY=VALUE]...
//! bridgelink events
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable              | Description                           |
//! |-----------------------|---------------------------------------|
//! | `BRIDGELINK_SETTINGS` | Settings file instead of the platform default |
//! | `BRIDGELINK_LOG`      | Log filter when `RUST_LOG` is unset    |
//!
//! Logs go to stderr so command output on stdout stays scriptable.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bridgelink_client::application::discover_bridge::DiscoveryEngine;
use bridgelink_client::application::pair_bridge::SecureLink;
use bridgelink_client::application::resolve_config::ConfigResolver;
use bridgelink_client::application::retry::RetryExecutor;
use bridgelink_client::application::trust_store::{ConflictResolution, TrustStore};
use bridgelink_client::infrastructure::discovery::{DiscoveryProvider, StaticHostsProvider};
use bridgelink_client::infrastructure::rpc::{ChannelEvent, PinnedConnector};
use bridgelink_client::infrastructure::storage::settings::{
    load_settings_from, save_settings_to, settings_file_path, ClientSettings, STATE_FILE_NAME,
};
use bridgelink_client::infrastructure::storage::{KeyValueStore, TomlFileStore};
use bridgelink_core::protocol::RpcParams;
use bridgelink_core::{Clock, DiscoveredCandidate, LinkEvent, SystemClock, TrustStatus};

// ── CLI argument definitions ──────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "bridgelink",
    about = "Find, pin and talk to a BridgeLink bridge on the local network",
    version
)]
struct Cli {
    /// Settings file to use instead of the platform default.
    #[arg(long, global = true, env = "BRIDGELINK_SETTINGS")]
    settings: Option<PathBuf>,

    /// Log filter used when `RUST_LOG` is unset.  Overrides the settings file.
    #[arg(long, global = true, env = "BRIDGELINK_LOG")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List bridges that answer before the deadline.
    Discover {
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Confirm a discovered bridge's certificate and make it active.
    Pair {
        /// Service instance name shown by `discover`.
        name: String,
        /// Trust the presented fingerprint without asking.
        #[arg(long)]
        yes: bool,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Inspect or change pinned bridge identities.
    Trust {
        #[command(subcommand)]
        action: TrustCommand,
    },
    /// Inspect or change the active server configuration.
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
    /// Call a JSON-RPC method on the active bridge.
    Call {
        method: String,
        /// Parameters as `key=value`; values that parse as JSON are sent as JSON.
        params: Vec<String>,
    },
    /// Print push events from the active bridge until interrupted.
    Events,
}

#[derive(Debug, Subcommand)]
enum TrustCommand {
    List,
    Remove { bridge_id: String },
    /// Answer a pending identity conflict.
    Resolve {
        bridge_id: String,
        #[arg(value_enum)]
        decision: Decision,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    Show,
    Reset,
    /// Apply a signed `armorclaw://config?d=...` provisioning link.
    ApplyLink {
        link: String,
        /// Bridge whose provisioning secret signs the link.  Defaults to the
        /// active bridge.
        #[arg(long)]
        bridge: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Decision {
    Retrust,
    Reject,
    Forget,
}

impl From<Decision> for ConflictResolution {
    fn from(d: Decision) -> Self {
        match d {
            Decision::Retrust => ConflictResolution::Retrust,
            Decision::Reject => ConflictResolution::Reject,
            Decision::Forget => ConflictResolution::Forget,
        }
    }
}

// ── Wiring ────────────────────────────────────────────────────────────────────

/// Every long-lived service, constructed once and passed down.
struct App {
    settings: ClientSettings,
    trust: Arc<TrustStore>,
    config: Arc<ConfigResolver>,
    link: SecureLink,
    events: broadcast::Sender<LinkEvent>,
}

impl App {
    fn build(settings: ClientSettings) -> anyhow::Result<Self> {
        let state_path = settings.state_file_path()?;
        let store: Arc<dyn KeyValueStore> = Arc::new(
            TomlFileStore::open(&state_path)
                .with_context(|| format!("opening state file {}", state_path.display()))?,
        );
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let (events, _) = broadcast::channel(64);

        let trust = Arc::new(TrustStore::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            events.clone(),
        ));
        let config = Arc::new(ConfigResolver::load(
            store,
            Arc::clone(&trust),
            clock,
            events.clone(),
        )?);
        let retry = RetryExecutor::new(settings.retry.backoff_policy())
            .with_operation_timeout(settings.retry.operation_timeout());
        let link = SecureLink::new(
            Arc::new(PinnedConnector::default()),
            Arc::clone(&trust),
            Arc::clone(&config),
            retry,
            settings.device.device_id.to_string(),
        );

        Ok(Self {
            settings,
            trust,
            config,
            link,
            events,
        })
    }

    fn discovery(&self) -> DiscoveryEngine {
        let hosts = StaticHostsProvider::new(self.settings.discovery.static_bridges.clone());
        if hosts.is_empty() {
            warn!("no [[discovery.static_bridges]] configured; nothing to discover");
        }
        let provider: Arc<dyn DiscoveryProvider> = Arc::new(hosts);
        DiscoveryEngine::with_service_type(provider, self.settings.discovery.service_type.clone())
    }

    fn discovery_timeout(&self, override_ms: Option<u64>) -> Duration {
        match override_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms),
            _ => self.settings.discovery.timeout(),
        }
    }

    /// Candidates seen before the browse ends or `timeout` passes.
    async fn candidates(&self, timeout: Duration) -> anyhow::Result<Vec<DiscoveredCandidate>> {
        let mut stream = self.discovery().watch();
        let mut latest = Vec::new();
        let collect = async {
            while let Some(snapshot) = stream.next().await {
                latest = snapshot?;
            }
            anyhow::Ok(())
        };
        match tokio::time::timeout(timeout, collect).await {
            Ok(result) => result?,
            Err(_) => info!(?timeout, "discovery deadline reached"),
        }
        Ok(latest)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings_path = match &cli.settings {
        Some(path) => path.clone(),
        None => settings_file_path().context("locating settings file")?,
    };
    let mut settings = load_settings_from(&settings_path)
        .with_context(|| format!("loading settings from {}", settings_path.display()))?;
    if !settings_path.exists() {
        // Persist the generated device id so the bridge sees a stable identity.
        save_settings_to(&settings_path, &settings)
            .with_context(|| format!("writing settings to {}", settings_path.display()))?;
    }
    if settings.storage.state_file.is_none() {
        if let Some(dir) = settings_path.parent() {
            settings.storage.state_file = Some(dir.join(STATE_FILE_NAME));
        }
    }

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| settings.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    let app = App::build(settings)?;
    spawn_alert_logger(app.events.subscribe());

    match cli.command {
        Command::Discover { timeout_ms } => discover(&app, timeout_ms).await,
        Command::Pair {
            name,
            yes,
            timeout_ms,
        } => pair(&app, &name, yes, timeout_ms).await,
        Command::Trust { action } => trust(&app, action).await,
        Command::Config { action } => config(&app, action).await,
        Command::Call { method, params } => call(&app, &method, &params).await,
        Command::Events => events(&app).await,
    }
}

/// Security alerts must never be missed, whatever the subcommand.
fn spawn_alert_logger(mut rx: broadcast::Receiver<LinkEvent>) {
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            if let LinkEvent::IdentityConflict {
                bridge_id,
                previous_fingerprint,
                new_fingerprint,
            } = event
            {
                eprintln!(
                    "SECURITY ALERT: bridge {bridge_id} changed identity\n  pinned:    {previous_fingerprint}\n  presented: {new_fingerprint}\n\
                     Traffic is blocked.  Run `bridgelink trust resolve {bridge_id} <retrust|reject|forget>`."
                );
            }
        }
    });
}

// ── Subcommands ───────────────────────────────────────────────────────────────

async fn discover(app: &App, timeout_ms: Option<u64>) -> anyhow::Result<()> {
    let timeout = app.discovery_timeout(timeout_ms);
    let found = app.candidates(timeout).await?;
    if found.is_empty() {
        println!("no bridge found within {} ms", timeout.as_millis());
        return Ok(());
    }
    for c in found {
        let fp = c
            .fingerprint
            .map(|f| f.short())
            .unwrap_or_else(|| "-".to_string());
        println!("{:<24} {:<32} fingerprint {}", c.name, c.rpc_url(), fp);
    }
    Ok(())
}

async fn pair(app: &App, name: &str, yes: bool, timeout_ms: Option<u64>) -> anyhow::Result<()> {
    let timeout = app.discovery_timeout(timeout_ms);
    let candidate = app
        .candidates(timeout)
        .await?
        .into_iter()
        .find(|c| c.name == name)
        .with_context(|| format!("bridge {name} was not discovered"))?;

    let fingerprint = app.link.first_contact(&candidate).await?;
    println!("{} at {}", candidate.name, candidate.rpc_url());
    println!("certificate fingerprint: {fingerprint}");

    if !yes && !confirm("Trust this bridge? [y/N] ").await? {
        bail!("pairing cancelled");
    }
    let record = app.link.pair(&candidate, fingerprint).await?;
    println!("paired with {} ({})", record.bridge_id, record.fingerprint.short());
    Ok(())
}

async fn confirm(prompt: &str) -> anyhow::Result<bool> {
    eprint!("{prompt}");
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("reading confirmation")?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}

async fn trust(app: &App, action: TrustCommand) -> anyhow::Result<()> {
    match action {
        TrustCommand::List => {
            let records = app.trust.list().await?;
            if records.is_empty() {
                println!("no trusted bridges");
            }
            for r in records {
                let state = match r.conflicting_fingerprint {
                    Some(presented) => format!("CONFLICT (presented {})", presented.short()),
                    None => "trusted".to_string(),
                };
                println!(
                    "{:<24} {} last seen {} {}",
                    r.bridge_id,
                    r.fingerprint.short(),
                    r.last_seen,
                    state
                );
            }
        }
        TrustCommand::Remove { bridge_id } => {
            if app.trust.remove(&bridge_id).await? {
                println!("removed {bridge_id}");
            } else {
                println!("{bridge_id} was not trusted");
            }
        }
        TrustCommand::Resolve {
            bridge_id,
            decision,
        } => match app.trust.resolve_conflict(&bridge_id, decision.into()).await? {
            TrustStatus::Trusted(r) => println!("{bridge_id} now pinned to {}", r.fingerprint),
            TrustStatus::IdentityConflict { .. } => {
                println!("{bridge_id} stays blocked")
            }
            TrustStatus::Unknown => println!("{bridge_id} forgotten"),
        },
    }
    Ok(())
}

async fn config(app: &App, action: ConfigCommand) -> anyhow::Result<()> {
    match action {
        ConfigCommand::Show => {
            let current = app.config.current().await;
            println!("{}", serde_json::to_string_pretty(&current)?);
        }
        ConfigCommand::Reset => {
            let change = app.config.reset().await?;
            println!("config reset (was {})", change.previous.source);
        }
        ConfigCommand::ApplyLink { link, bridge } => {
            let change = app.config.apply_signed_link(&link, bridge.as_deref()).await?;
            println!("config applied from signed link: {}", change.current.rpc_url);
        }
    }
    Ok(())
}

async fn call(app: &App, method: &str, params: &[String]) -> anyhow::Result<()> {
    let params = parse_params(params)?;
    let value = app.link.call(method, params).await?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn events(app: &App) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let channel = app.link.open_events(Arc::new(tx)).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; closing event channel");
                channel.close().await;
                return Ok(());
            }
            event = rx.recv() => match event {
                Some(ChannelEvent::Message(text)) => println!("{text}"),
                Some(ChannelEvent::Binary(bytes)) => println!("<binary {} bytes>", bytes.len()),
                Some(ChannelEvent::Closing { code, reason }) => info!(code, %reason, "event channel closing"),
                Some(ChannelEvent::Closed) | None => return Ok(()),
                Some(ChannelEvent::Failure(e)) => {
                    warn!(error = %e, "event channel failed");
                    return Err(e.into());
                }
                Some(ChannelEvent::Opened) => {}
            },
        }
    }
}

/// `key=value` pairs into a flat params object.
fn parse_params(pairs: &[String]) -> anyhow::Result<Option<RpcParams>> {
    if pairs.is_empty() {
        return Ok(None);
    }
    let mut params = RpcParams::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .with_context(|| format!("parameter {pair:?} is not key=value"))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        params.insert(key.to_string(), value);
    }
    Ok(Some(params))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
