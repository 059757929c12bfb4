//! cellbridge: command-line front end for the packet-tunnel bridge
//!
//! Initializes the global allocator, sets up logging, loads the bridge
//! configuration and runs one subcommand against it.

use anyhow::{Context, Result, bail};
use cellbridge::{
    BridgeConfig, BridgeController, BridgeEvent, CryptoProvider, FileKeyStore, FileProfileStore,
    KeyStore, MemoryHost, MemoryKeyStore, MemoryProfileStore, Packet, ProfileStore, ProtocolTag,
    handle_message,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// How long the demo waits for the tunnel to echo a batch
const DEMO_WAIT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "cellbridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Bridge configuration file (.toml or .json)
    #[arg(short, long, env = "CELLBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register the tunnel profile and provision the packet key
    Init,
    /// Show the registered profile, key and tunnel settings
    Status,
    /// Replace the persisted packet key
    RotateKey,
    /// Run a tunnel against an in-memory host and print its status
    Demo {
        /// Number of packets to push through the tunnel
        #[arg(short, long, default_value = "8")]
        packets: u8,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Init => init(config).await,
        Command::Status => status(config).await,
        Command::RotateKey => rotate_key(config),
        Command::Demo { packets } => demo(config, packets).await,
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<BridgeConfig> {
    match path {
        Some(path) => BridgeConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => {
            info!("No config file given, using defaults");
            Ok(BridgeConfig::default())
        }
    }
}

fn file_controller(config: BridgeConfig) -> BridgeController<MemoryHost> {
    let profiles = Arc::new(FileProfileStore::new(&config.profile_file));
    let keys = Arc::new(FileKeyStore::new(&config.key_file));
    BridgeController::new(config, Arc::new(MemoryHost::new()), profiles, keys)
}

async fn init(config: BridgeConfig) -> Result<()> {
    let keys = FileKeyStore::new(&config.key_file);
    CryptoProvider::initialize(&keys).context("failed to provision packet key")?;
    info!("Packet key ready at {}", keys.path().display());

    let mut bridge = file_controller(config);
    let profile = bridge
        .initialize()
        .await
        .context("failed to register tunnel profile")?;
    println!("{}", serde_json::to_string_pretty(profile)?);

    Ok(())
}

async fn status(config: BridgeConfig) -> Result<()> {
    let profiles = FileProfileStore::new(&config.profile_file)
        .load_all()
        .await
        .context("failed to read profile store")?;
    let profile = profiles
        .into_iter()
        .find(|p| p.identifier == config.profile.identifier);

    let key_present = FileKeyStore::new(&config.key_file)
        .retrieve()
        .context("failed to read key store")?
        .is_some();

    let report = serde_json::json!({
        "profile": profile,
        "keyPresent": key_present,
        "direction": config.direction,
        "tunnel": config.tunnel,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn rotate_key(config: BridgeConfig) -> Result<()> {
    let mut bridge = file_controller(config);
    bridge.rotate_key().context("failed to rotate packet key")?;

    println!("Packet key rotated");
    Ok(())
}

async fn demo(config: BridgeConfig, packets: u8) -> Result<()> {
    let host = Arc::new(MemoryHost::new());
    let profiles: Arc<dyn ProfileStore> = Arc::new(MemoryProfileStore::new());
    let keys: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new());
    let mut bridge = BridgeController::new(config, host.clone(), profiles, keys);
    let mut events = bridge.subscribe();

    bridge.initialize().await?;
    bridge.start().await?;

    let Some(mut handle) = host.take_handle() else {
        bail!("host did not hand out a packet channel");
    };

    let batch: Vec<Packet> = (0..packets)
        .map(|i| Packet::new(vec![0x45, 0, 0, 20, i], ProtocolTag::IPV4))
        .collect();
    handle.inject(batch).await?;

    match tokio::time::timeout(DEMO_WAIT, handle.written()).await {
        Ok(Some(written)) => info!("Tunnel wrote {} packets", written.len()),
        Ok(None) => warn!("Tunnel channel closed"),
        Err(_) => warn!("Tunnel did not write within {:?}", DEMO_WAIT),
    }

    for request in [r#"{"type":"statusRequest"}"#, r#"{"type":"metricsRequest"}"#] {
        if let Some(reply) = handle_message(&bridge, request.as_bytes()) {
            println!("{}", String::from_utf8_lossy(&reply));
        }
    }
    println!("{}", bridge.metrics().format());

    bridge.stop().await?;

    while let Ok(event) = events.try_recv() {
        match event {
            BridgeEvent::ConnectionStatusChanged(status) => {
                info!("Status event: connected={}", status.connected)
            }
            BridgeEvent::TunnelFailed { reason, .. } => warn!("Failure event: {}", reason),
        }
    }
    Ok(())
}
