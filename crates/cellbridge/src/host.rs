//! Host Collaborators
//!
//! The bridge never creates interfaces or touches system preferences
//! itself. Everything it needs from the host goes through the traits in
//! this module:
//!
//! - [`PacketChannel`]: duplex packet I/O on the virtual interface
//! - [`NetworkSettings`]: applies a [`TunnelConfiguration`] to the interface
//! - [`TunnelHost`]: starts/stops the tunnel and hands out its channel
//! - [`ProfileStore`]: persists registered [`TunnelProfile`]s
//!
//! In-memory implementations are provided for tests and demos.

use crate::config::{TunnelConfiguration, TunnelProfile};
use crate::packet::Packet;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::fs;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Duplex packet channel of the virtual interface.
///
/// The session keeps at most one `read_packets` call outstanding, and may
/// drop it mid-await when stopping, so implementations must be cancel-safe.
#[async_trait]
pub trait PacketChannel: Send + Sync + 'static {
    /// Wait for the next batch of packets
    async fn read_packets(&self) -> Result<Vec<Packet>, ChannelError>;

    /// Write a batch of packets with their tags
    async fn write_packets(&self, packets: Vec<Packet>) -> Result<(), ChannelError>;
}

/// Host networking stack that applies interface settings
#[async_trait]
pub trait NetworkSettings: Send + Sync {
    /// Apply `config` to the virtual interface
    async fn apply(&self, config: &TunnelConfiguration) -> Result<(), HostError>;
}

/// Host tunnel primitive
#[async_trait]
pub trait TunnelHost: NetworkSettings + 'static {
    /// Channel type handed out for a started tunnel
    type Channel: PacketChannel;

    /// Start the tunnel registered as `profile`
    async fn start_tunnel(&self, profile: &TunnelProfile) -> Result<Self::Channel, HostError>;

    /// Tear the tunnel down and release host resources
    async fn stop_tunnel(&self);
}

/// Host network-configuration store for tunnel profiles
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Load every registered profile
    async fn load_all(&self) -> Result<Vec<TunnelProfile>, StoreError>;

    /// Persist `profile`, replacing any profile with the same identifier
    async fn save(&self, profile: &TunnelProfile) -> Result<(), StoreError>;
}

/// Channel errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("Packet channel closed")]
    Closed,

    #[error("Packet channel I/O error: {0}")]
    Io(String),
}

/// Host errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    #[error("Host rejected network settings: {0}")]
    SettingsRejected(String),

    #[error("Host failed to start tunnel: {0}")]
    StartFailed(String),

    #[error("Host permission denied: {0}")]
    PermissionDenied(String),
}

/// Profile store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Profile store I/O error: {0}")]
    Io(String),

    #[error("Profile store parse error: {0}")]
    Parse(String),

    #[error("Profile store permission denied: {0}")]
    PermissionDenied(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::PermissionDenied => Self::PermissionDenied(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

/// In-memory packet channel.
///
/// Created in pairs with a [`ChannelHandle`] that plays the host side:
/// batches injected through the handle are returned by `read_packets`, and
/// batches written by the session show up on the handle.
pub struct MemoryChannel {
    inbound: tokio::sync::Mutex<mpsc::Receiver<Vec<Packet>>>,
    outbound: mpsc::UnboundedSender<Vec<Packet>>,
    reads: Arc<AtomicU64>,
}

/// Host side of a [`MemoryChannel`]
pub struct ChannelHandle {
    inject: Option<mpsc::Sender<Vec<Packet>>>,
    written: mpsc::UnboundedReceiver<Vec<Packet>>,
    reads: Arc<AtomicU64>,
}

/// Create a connected channel/handle pair buffering up to `capacity` batches
pub fn memory_channel(capacity: usize) -> (MemoryChannel, ChannelHandle) {
    let (inject_tx, inject_rx) = mpsc::channel(capacity.max(1));
    let (written_tx, written_rx) = mpsc::unbounded_channel();
    let reads = Arc::new(AtomicU64::new(0));

    let channel = MemoryChannel {
        inbound: tokio::sync::Mutex::new(inject_rx),
        outbound: written_tx,
        reads: reads.clone(),
    };
    let handle = ChannelHandle {
        inject: Some(inject_tx),
        written: written_rx,
        reads,
    };
    (channel, handle)
}

#[async_trait]
impl PacketChannel for MemoryChannel {
    async fn read_packets(&self) -> Result<Vec<Packet>, ChannelError> {
        let mut inbound = self.inbound.lock().await;
        let batch = inbound.recv().await.ok_or(ChannelError::Closed)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(batch)
    }

    async fn write_packets(&self, packets: Vec<Packet>) -> Result<(), ChannelError> {
        self.outbound.send(packets).map_err(|_| ChannelError::Closed)
    }
}

impl ChannelHandle {
    /// Deliver a batch to the next `read_packets` call
    pub async fn inject(&self, batch: Vec<Packet>) -> Result<(), ChannelError> {
        let inject = self.inject.as_ref().ok_or(ChannelError::Closed)?;
        inject.send(batch).await.map_err(|_| ChannelError::Closed)
    }

    /// Wait for the next batch the session wrote
    pub async fn written(&mut self) -> Option<Vec<Packet>> {
        self.written.recv().await
    }

    /// Take a written batch if one is already queued
    pub fn try_written(&mut self) -> Option<Vec<Packet>> {
        self.written.try_recv().ok()
    }

    /// Batches the channel has handed out so far
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Close the inbound side; pending and future reads fail with `Closed`
    /// once buffered batches are drained
    pub fn close(&mut self) {
        self.inject = None;
    }
}

/// In-memory tunnel host.
///
/// Accepts or rejects settings on demand and hands out a fresh
/// [`MemoryChannel`] per started tunnel; the matching handle can be taken
/// with [`MemoryHost::take_handle`].
#[derive(Default)]
pub struct MemoryHost {
    reject_settings: AtomicBool,
    fail_start: AtomicBool,
    applied: Mutex<Vec<TunnelConfiguration>>,
    handle: Mutex<Option<ChannelHandle>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl MemoryHost {
    /// Create a host that accepts everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `apply` reject (or accept) settings
    pub fn set_reject_settings(&self, reject: bool) {
        self.reject_settings.store(reject, Ordering::Relaxed);
    }

    /// Make `start_tunnel` fail (or succeed)
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::Relaxed);
    }

    /// Every configuration applied so far
    pub fn applied(&self) -> Vec<TunnelConfiguration> {
        self.applied.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Host side of the most recently started tunnel
    pub fn take_handle(&self) -> Option<ChannelHandle> {
        self.handle.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Number of successful `start_tunnel` calls
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::Relaxed)
    }

    /// Number of `stop_tunnel` calls
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl NetworkSettings for MemoryHost {
    async fn apply(&self, config: &TunnelConfiguration) -> Result<(), HostError> {
        if self.reject_settings.load(Ordering::Relaxed) {
            return Err(HostError::SettingsRejected("rejected by host".into()));
        }
        config
            .validate()
            .map_err(|e| HostError::SettingsRejected(e.to_string()))?;

        self.applied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(config.clone());
        Ok(())
    }
}

#[async_trait]
impl TunnelHost for MemoryHost {
    type Channel = MemoryChannel;

    async fn start_tunnel(&self, profile: &TunnelProfile) -> Result<MemoryChannel, HostError> {
        if self.fail_start.load(Ordering::Relaxed) {
            return Err(HostError::StartFailed(format!("{} unavailable", profile.identifier)));
        }

        let (channel, handle) = memory_channel(64);
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        self.starts.fetch_add(1, Ordering::Relaxed);

        debug!("Memory host started tunnel for {}", profile.identifier);
        Ok(channel)
    }

    async fn stop_tunnel(&self) {
        self.stops.fetch_add(1, Ordering::Relaxed);
    }
}

/// In-memory profile store
#[derive(Default)]
pub struct MemoryProfileStore {
    profiles: Mutex<Vec<TunnelProfile>>,
    fail_saves: AtomicBool,
}

impl MemoryProfileStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `save` fail (or succeed)
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::Relaxed);
    }

    /// Number of stored profiles
    pub fn len(&self) -> usize {
        self.profiles.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Is the store empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn load_all(&self) -> Result<Vec<TunnelProfile>, StoreError> {
        Ok(self.profiles.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn save(&self, profile: &TunnelProfile) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::Relaxed) {
            return Err(StoreError::PermissionDenied("store is read-only".into()));
        }

        let mut profiles = self.profiles.lock().unwrap_or_else(|e| e.into_inner());
        upsert(&mut profiles, profile);
        Ok(())
    }
}

/// Profile store backed by a JSON file
#[derive(Debug, Clone)]
pub struct FileProfileStore {
    path: PathBuf,
}

impl FileProfileStore {
    /// Create a store at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<Vec<TunnelProfile>, StoreError> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => {
                serde_json::from_str(&content).map_err(|e| StoreError::Parse(e.to_string()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ProfileStore for FileProfileStore {
    async fn load_all(&self) -> Result<Vec<TunnelProfile>, StoreError> {
        self.read().await
    }

    async fn save(&self, profile: &TunnelProfile) -> Result<(), StoreError> {
        let mut profiles = self.read().await?;
        upsert(&mut profiles, profile);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(&profiles)
            .map_err(|e| StoreError::Parse(e.to_string()))?;
        fs::write(&self.path, content).await?;

        info!("Saved profile {} to {}", profile.identifier, self.path.display());
        Ok(())
    }
}

fn upsert(profiles: &mut Vec<TunnelProfile>, profile: &TunnelProfile) {
    match profiles.iter_mut().find(|p| p.identifier == profile.identifier) {
        Some(existing) => *existing = profile.clone(),
        None => profiles.push(profile.clone()),
    }
}
