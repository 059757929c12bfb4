//! Bridge Controller
//!
//! Registers the tunnel profile with the host and owns the single active
//! [`TunnelSession`], publishing connection status as it changes.
//!
//! # Usage
//!
//! ```rust,ignore
//! let mut bridge = BridgeController::new(config, host, profiles, keys);
//! bridge.initialize().await?;
//! bridge.start().await?;
//!
//! if bridge.current_status().connected {
//!     println!("{}", bridge.metrics().format());
//! }
//!
//! bridge.stop().await?;
//! ```

use crate::config::{BridgeConfig, ConfigError, TunnelProfile};
use crate::control::ControlSource;
use crate::crypto::{CryptoError, CryptoProvider};
use crate::host::{HostError, ProfileStore, StoreError, TunnelHost};
use crate::keys::{KeyStore, KeyStoreError};
use crate::metrics::{TrafficMetrics, TunnelStats};
use crate::packet::PacketProcessor;
use crate::session::{SessionError, SessionState, TunnelSession};
use crate::status::{BridgeEvent, ConnectionStatus, ErrorCategory, StatusNotifier};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Bridge controller errors
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Bridge not initialized")]
    NotInitialized,

    #[error("Tunnel already running")]
    AlreadyRunning,

    #[error("{0}")]
    KeyUnavailable(CryptoError),

    #[error("Failed to save tunnel profile: {0}")]
    ProfileSaveFailed(StoreError),

    #[error("Failed to load tunnel profiles: {0}")]
    ProfileLoadFailed(StoreError),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl BridgeError {
    /// User-facing category for this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            BridgeError::KeyUnavailable(CryptoError::KeyUnavailable(KeyStoreError::AccessDenied(_)))
            | BridgeError::ProfileSaveFailed(StoreError::PermissionDenied(_))
            | BridgeError::ProfileLoadFailed(StoreError::PermissionDenied(_))
            | BridgeError::Host(HostError::PermissionDenied(_)) => ErrorCategory::PermissionDenied,

            BridgeError::NotInitialized
            | BridgeError::Config(_)
            | BridgeError::Host(HostError::SettingsRejected(_))
            | BridgeError::Session(SessionError::ChannelConfigurationRejected(_)) => {
                ErrorCategory::ConfigurationInvalid
            }

            _ => ErrorCategory::ConnectionFailed,
        }
    }
}

/// Initialization steps, run in this order on every `initialize()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitStep {
    /// Find the registered profile, or prepare a new one
    LoadProfile,
    /// Bring the profile in line with the configuration
    ConfigureProfile,
    /// Persist the profile if anything changed
    SaveProfile,
}

const INIT_STEPS: [InitStep; 3] = [
    InitStep::LoadProfile,
    InitStep::ConfigureProfile,
    InitStep::SaveProfile,
];

#[derive(Default)]
struct InitState {
    profile: Option<TunnelProfile>,
    dirty: bool,
}

/// Session plus the task mirroring its state into the notifier
struct ActiveSession<H: TunnelHost> {
    session: TunnelSession<H::Channel>,
    tracker: JoinHandle<()>,
}

/// Bridge Controller
///
/// One controller drives at most one tunnel at a time:
/// - Registers the tunnel profile with the host store
/// - Provisions the packet key
/// - Starts and stops the tunnel session
/// - Publishes connection status and failures
pub struct BridgeController<H: TunnelHost> {
    /// Configuration
    config: BridgeConfig,
    /// Host tunnel primitive and network settings
    host: Arc<H>,
    /// Host profile store
    profiles: Arc<dyn ProfileStore>,
    /// Packet key store
    keys: Arc<dyn KeyStore>,
    /// Status publisher
    notifier: StatusNotifier,
    /// Registered profile, set by `initialize()`
    profile: Option<TunnelProfile>,
    /// Active session, if any
    active: Option<ActiveSession<H>>,
    /// Last session ended on an exhausted key
    key_exhausted: bool,
}

impl<H: TunnelHost> BridgeController<H> {
    /// Create a controller. Nothing touches the host until `initialize()`.
    pub fn new(
        config: BridgeConfig,
        host: Arc<H>,
        profiles: Arc<dyn ProfileStore>,
        keys: Arc<dyn KeyStore>,
    ) -> Self {
        Self {
            config,
            host,
            profiles,
            keys,
            notifier: StatusNotifier::new(),
            profile: None,
            active: None,
            key_exhausted: false,
        }
    }

    /// Configuration
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Registered profile, once initialized
    pub fn profile(&self) -> Option<&TunnelProfile> {
        self.profile.as_ref()
    }

    /// Status publisher
    pub fn notifier(&self) -> &StatusNotifier {
        &self.notifier
    }

    /// Receive status-change and failure events
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.notifier.subscribe()
    }

    /// State of the active session, `Idle` when there is none
    pub fn state(&self) -> SessionState {
        self.active
            .as_ref()
            .map(|active| active.session.state())
            .unwrap_or(SessionState::Idle)
    }

    /// Is a session holding the tunnel?
    pub fn is_running(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| !active.session.state().is_terminal())
    }

    /// Load or register the tunnel profile.
    ///
    /// Safe to call repeatedly; an already registered profile is reused and
    /// never duplicated.
    pub async fn initialize(&mut self) -> Result<&TunnelProfile, BridgeError> {
        self.config.validate()?;

        let mut state = InitState::default();
        for step in INIT_STEPS {
            debug!("Init step: {:?}", step);
            self.run_init_step(step, &mut state).await?;
        }

        let profile = state.profile.ok_or(BridgeError::NotInitialized)?;
        info!("Bridge initialized with profile {}", profile.identifier);

        Ok(self.profile.insert(profile))
    }

    async fn run_init_step(
        &self,
        step: InitStep,
        state: &mut InitState,
    ) -> Result<(), BridgeError> {
        match step {
            InitStep::LoadProfile => {
                let wanted = &self.config.profile.identifier;
                let existing = self
                    .profiles
                    .load_all()
                    .await
                    .map_err(BridgeError::ProfileLoadFailed)?
                    .into_iter()
                    .find(|p| &p.identifier == wanted);

                state.profile = match existing {
                    Some(profile) => Some(profile),
                    None => {
                        info!("No profile registered for {}, creating one", wanted);
                        state.dirty = true;
                        Some(self.config.profile.clone())
                    }
                };
            }
            InitStep::ConfigureProfile => {
                let desired = TunnelProfile {
                    enabled: true,
                    ..self.config.profile.clone()
                };
                if let Some(profile) = state.profile.as_mut().filter(|p| **p != desired) {
                    *profile = desired;
                    state.dirty = true;
                }
            }
            InitStep::SaveProfile => {
                if let Some(profile) = state.profile.as_ref().filter(|_| state.dirty) {
                    self.profiles
                        .save(profile)
                        .await
                        .map_err(BridgeError::ProfileSaveFailed)?;
                }
            }
        }
        Ok(())
    }

    /// Start the tunnel.
    ///
    /// Failures are returned and also published as
    /// [`BridgeEvent::TunnelFailed`].
    pub async fn start(&mut self) -> Result<(), BridgeError> {
        let result = self.try_start().await;

        if let Err(e) = &result {
            error!("Failed to start tunnel: {}", e);
            if !matches!(e, BridgeError::AlreadyRunning) {
                self.notifier.publish_failure(e.category(), e.to_string());
            }
        }
        result
    }

    async fn try_start(&mut self) -> Result<(), BridgeError> {
        let profile = self.profile.clone().ok_or(BridgeError::NotInitialized)?;
        if self.is_running() {
            return Err(BridgeError::AlreadyRunning);
        }

        // A session that failed on its own still holds the host tunnel
        if let Some(previous) = self.active.take() {
            debug!("Releasing previous session");
            self.note_exit(&previous.session.state());
            self.host.stop_tunnel().await;
        }

        let crypto = if self.key_exhausted {
            info!("Packet key exhausted, rotating before start");
            CryptoProvider::rotate(&*self.keys)
        } else {
            CryptoProvider::initialize(&*self.keys)
        }
        .map_err(BridgeError::KeyUnavailable)?
        .with_message_limit(self.config.key_message_limit);
        self.key_exhausted = false;

        info!("Starting tunnel {}", profile.identifier);
        let channel = self.host.start_tunnel(&profile).await?;

        let processor = PacketProcessor::new(Arc::new(crypto), Arc::new(TunnelStats::new()));
        let session = TunnelSession::new(
            self.config.tunnel.clone(),
            channel,
            processor,
            self.config.direction,
        );

        if let Err(e) = session.start(&*self.host).await {
            self.host.stop_tunnel().await;
            return Err(e.into());
        }

        let tracker = self.notifier.track(session.subscribe());
        self.active = Some(ActiveSession { session, tracker });
        Ok(())
    }

    /// Stop the tunnel and release the session.
    ///
    /// Waits for the packet loop at most the configured teardown timeout; a
    /// loop that does not exit in time is logged and abandoned.
    pub async fn stop(&mut self) -> Result<(), BridgeError> {
        let Some(active) = self.active.take() else {
            debug!("stop() with no active session");
            return Ok(());
        };

        active.session.stop();

        let timeout = self.config.teardown_timeout();
        match tokio::time::timeout(timeout, active.session.wait_for_exit()).await {
            Ok(state) => {
                info!("Tunnel session ended: {}", state);
                self.note_exit(&state);
                let _ = active.tracker.await;
            }
            Err(_) => {
                warn!("Packet loop did not stop within {:?}", timeout);
                active.tracker.abort();
                self.notifier.apply(&active.session.state());
            }
        }

        self.host.stop_tunnel().await;
        info!("Tunnel stopped");
        Ok(())
    }

    /// Replace the persisted packet key. Only allowed while stopped.
    pub fn rotate_key(&mut self) -> Result<(), BridgeError> {
        if self.is_running() {
            return Err(BridgeError::AlreadyRunning);
        }

        CryptoProvider::rotate(&*self.keys).map_err(BridgeError::KeyUnavailable)?;
        self.key_exhausted = false;
        Ok(())
    }

    /// Remember a key exhaustion so the next start rotates the key
    fn note_exit(&mut self, state: &SessionState) {
        if matches!(state, SessionState::Failed(SessionError::KeyExhausted)) {
            warn!("Tunnel stopped on an exhausted packet key");
            self.key_exhausted = true;
        }
    }

    /// Current connection status
    pub fn current_status(&self) -> ConnectionStatus {
        self.notifier.current_status()
    }

    /// Traffic metrics of the active session
    pub fn metrics(&self) -> TrafficMetrics {
        self.active
            .as_ref()
            .map(|active| active.session.metrics())
            .unwrap_or_else(TrafficMetrics::zero)
    }
}

impl<H: TunnelHost> ControlSource for BridgeController<H> {
    fn current_status(&self) -> ConnectionStatus {
        BridgeController::current_status(self)
    }

    fn metrics(&self) -> TrafficMetrics {
        BridgeController::metrics(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::handle_message;
    use crate::host::{MemoryHost, MemoryProfileStore};
    use crate::keys::MemoryKeyStore;
    use crate::packet::{Packet, ProtocolTag};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    struct Fixture {
        bridge: BridgeController<MemoryHost>,
        host: Arc<MemoryHost>,
        profiles: Arc<MemoryProfileStore>,
        keys: Arc<MemoryKeyStore>,
    }

    fn fixture_with_config(config: BridgeConfig, keys: MemoryKeyStore) -> Fixture {
        let host = Arc::new(MemoryHost::new());
        let profiles = Arc::new(MemoryProfileStore::new());
        let keys = Arc::new(keys);
        let bridge = BridgeController::new(
            config,
            host.clone(),
            profiles.clone(),
            keys.clone(),
        );

        Fixture {
            bridge,
            host,
            profiles,
            keys,
        }
    }

    fn fixture_with(keys: MemoryKeyStore) -> Fixture {
        fixture_with_config(BridgeConfig::default(), keys)
    }

    fn fixture() -> Fixture {
        fixture_with(MemoryKeyStore::new())
    }

    async fn next_event(events: &mut broadcast::Receiver<BridgeEvent>) -> BridgeEvent {
        tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("no event published")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let mut f = fixture();

        let first = f.bridge.initialize().await.unwrap().clone();
        let second = f.bridge.initialize().await.unwrap().clone();

        assert_eq!(first, second);
        assert_eq!(f.profiles.len(), 1);
        assert!(first.enabled);
    }

    #[tokio::test]
    async fn test_initialize_reuses_stored_profile() {
        let mut f = fixture();
        let stored = TunnelProfile {
            enabled: false,
            ..TunnelProfile::default()
        };
        f.profiles.save(&stored).await.unwrap();

        let profile = f.bridge.initialize().await.unwrap();

        assert!(profile.enabled);
        assert_eq!(f.profiles.len(), 1);
    }

    #[tokio::test]
    async fn test_profile_save_failure() {
        let mut f = fixture();
        f.profiles.set_fail_saves(true);

        let err = f.bridge.initialize().await.unwrap_err();

        assert!(matches!(err, BridgeError::ProfileSaveFailed(_)));
        assert_eq!(err.category(), ErrorCategory::PermissionDenied);
        assert!(f.bridge.profile().is_none());
    }

    #[tokio::test]
    async fn test_start_requires_initialize() {
        let mut f = fixture();
        let mut events = f.bridge.subscribe();

        assert!(matches!(f.bridge.start().await, Err(BridgeError::NotInitialized)));
        assert_eq!(f.host.starts(), 0);

        assert!(matches!(
            next_event(&mut events).await,
            BridgeEvent::TunnelFailed {
                category: ErrorCategory::ConfigurationInvalid,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_start_without_key_access() {
        let mut f = fixture_with(MemoryKeyStore::inaccessible());
        f.bridge.initialize().await.unwrap();

        let err = f.bridge.start().await.unwrap_err();

        assert!(matches!(err, BridgeError::KeyUnavailable(_)));
        assert_eq!(err.category(), ErrorCategory::PermissionDenied);
        assert_eq!(f.host.starts(), 0);
        assert_eq!(
            f.bridge.current_status().last_error,
            Some(ErrorCategory::PermissionDenied)
        );
    }

    #[tokio::test]
    async fn test_host_start_failure_surfaces() {
        let mut f = fixture();
        f.bridge.initialize().await.unwrap();
        f.host.set_fail_start(true);

        let err = f.bridge.start().await.unwrap_err();

        assert!(matches!(err, BridgeError::Host(HostError::StartFailed(_))));
        assert!(!f.bridge.is_running());
    }

    #[tokio::test]
    async fn test_rejected_settings_release_tunnel() {
        let mut f = fixture();
        f.bridge.initialize().await.unwrap();
        f.host.set_reject_settings(true);

        let err = f.bridge.start().await.unwrap_err();

        assert!(matches!(
            err,
            BridgeError::Session(SessionError::ChannelConfigurationRejected(_))
        ));
        assert_eq!(err.category(), ErrorCategory::ConfigurationInvalid);
        assert_eq!(f.host.stops(), 1);
        assert_eq!(f.bridge.state(), SessionState::Idle);

        // A later start with accepted settings works
        f.host.set_reject_settings(false);
        f.bridge.start().await.unwrap();
        assert_eq!(f.bridge.state(), SessionState::Running);
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let mut f = fixture();
        let mut events = f.bridge.subscribe();
        f.bridge.initialize().await.unwrap();

        f.bridge.start().await.unwrap();
        assert_eq!(f.bridge.state(), SessionState::Running);
        assert_eq!(f.keys.store_calls(), 1);

        match next_event(&mut events).await {
            BridgeEvent::ConnectionStatusChanged(status) => assert!(status.connected),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(f.bridge.current_status().connected);

        let mut handle = f.host.take_handle().unwrap();
        handle
            .inject(vec![Packet::new(vec![0x45; 20], ProtocolTag::IPV4)])
            .await
            .unwrap();
        let written = tokio::time::timeout(WAIT, handle.written()).await.unwrap().unwrap();
        assert_eq!(written[0].len(), 48);
        assert_eq!(f.bridge.metrics().packets_sent, 1);

        f.bridge.stop().await.unwrap();

        match next_event(&mut events).await {
            BridgeEvent::ConnectionStatusChanged(status) => assert!(!status.connected),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(f.host.stops(), 1);
        assert_eq!(f.bridge.state(), SessionState::Idle);
        assert_eq!(f.bridge.metrics().packets_sent, 0);

        // Stopping again is a no-op
        f.bridge.stop().await.unwrap();
        assert_eq!(f.host.stops(), 1);
    }

    #[tokio::test]
    async fn test_single_active_tunnel() {
        let mut f = fixture();
        f.bridge.initialize().await.unwrap();
        f.bridge.start().await.unwrap();

        assert!(matches!(f.bridge.start().await, Err(BridgeError::AlreadyRunning)));
        assert_eq!(f.host.starts(), 1);
    }

    #[tokio::test]
    async fn test_restart_after_channel_failure() {
        let mut f = fixture();
        let mut events = f.bridge.subscribe();
        f.bridge.initialize().await.unwrap();
        f.bridge.start().await.unwrap();

        f.host.take_handle().unwrap().close();

        let failed = tokio::time::timeout(WAIT, async {
            loop {
                if let Ok(BridgeEvent::TunnelFailed { .. }) = events.recv().await {
                    break;
                }
            }
        })
        .await;
        assert!(failed.is_ok());
        assert!(!f.bridge.is_running());

        f.bridge.start().await.unwrap();
        assert_eq!(f.host.starts(), 2);
        assert_eq!(f.host.stops(), 1);
        assert_eq!(f.keys.store_calls(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_key_is_rotated_on_restart() {
        let config = BridgeConfig {
            key_message_limit: 2,
            ..BridgeConfig::default()
        };
        let mut f = fixture_with_config(config, MemoryKeyStore::new());
        f.bridge.initialize().await.unwrap();
        f.bridge.start().await.unwrap();
        let first_key = f.keys.retrieve().unwrap().unwrap();

        let batch = (0..3u8)
            .map(|i| Packet::new(vec![i; 16], ProtocolTag::IPV4))
            .collect();
        let handle = f.host.take_handle().unwrap();
        handle.inject(batch).await.unwrap();

        let exhausted = tokio::time::timeout(WAIT, async {
            while f.bridge.state() != SessionState::Failed(SessionError::KeyExhausted) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(exhausted.is_ok());

        f.bridge.start().await.unwrap();
        assert_eq!(f.bridge.state(), SessionState::Running);
        assert_eq!(f.keys.store_calls(), 2);
        assert!(f.keys.retrieve().unwrap().unwrap() != first_key);
    }

    #[tokio::test]
    async fn test_rotate_key_only_when_stopped() {
        let mut f = fixture();
        f.bridge.initialize().await.unwrap();
        f.bridge.start().await.unwrap();

        assert!(matches!(f.bridge.rotate_key(), Err(BridgeError::AlreadyRunning)));

        f.bridge.stop().await.unwrap();
        f.bridge.rotate_key().unwrap();
        assert_eq!(f.keys.store_calls(), 2);
    }

    #[tokio::test]
    async fn test_control_messages() {
        let mut f = fixture();
        f.bridge.initialize().await.unwrap();

        let reply = handle_message(&f.bridge, br#"{"type":"statusRequest"}"#).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(json["isConnected"], false);

        f.bridge.start().await.unwrap();

        let reply = handle_message(&f.bridge, br#"{"type":"metricsRequest"}"#).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(json["packetsSent"], 0);
    }
}
