//! Tunnel Session
//!
//! Owns the packet channel of one tunnel and drives the
//! read → process → write loop while the session is running.
//!
//! # State Machine
//!
//! ```text
//!            start()           settings ok
//!   Idle ───────────▶ Starting ───────────▶ Running
//!    │                   │                     │ stop()
//!    │ stop()            │ stop()              ▼
//!    │                   └──────────────▶ Stopping ──▶ Stopped
//!    └──────────────────────────────────────────────────▲
//!
//!   any non-terminal state ──(rejected settings / channel error)──▶ Failed
//! ```
//!
//! `Stopped` and `Failed` are terminal; a new session must be built to
//! run the tunnel again.

use crate::config::TunnelConfiguration;
use crate::host::{ChannelError, NetworkSettings, PacketChannel};
use crate::metrics::{TrafficMetrics, TunnelStats};
use crate::packet::{Direction, Packet, PacketProcessor};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

/// Session lifecycle state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not started
    Idle,
    /// Applying interface settings
    Starting,
    /// Packet loop active
    Running,
    /// Stop requested, loop winding down
    Stopping,
    /// Loop ended, resources released
    Stopped,
    /// Unrecoverable failure
    Failed(SessionError),
}

impl SessionState {
    /// Is the packet loop allowed to move packets?
    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Running)
    }

    /// Is this a final state?
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed(_))
    }

    /// Check if the session is in an error state
    pub fn is_failed(&self) -> bool {
        matches!(self, SessionState::Failed(_))
    }

    fn can_transition_to(&self, next: &SessionState) -> bool {
        use SessionState::*;

        match (self, next) {
            (Stopped, _) | (Failed(_), _) => false,
            (_, Failed(_)) => true,
            (Idle, Starting) | (Idle, Stopped) => true,
            (Starting, Running) | (Starting, Stopping) => true,
            (Running, Stopping) => true,
            (Stopping, Stopped) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Starting => write!(f, "starting"),
            SessionState::Running => write!(f, "running"),
            SessionState::Stopping => write!(f, "stopping"),
            SessionState::Stopped => write!(f, "stopped"),
            SessionState::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

/// Session errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Operation not allowed while {0}")]
    InvalidState(String),

    #[error("Host rejected channel configuration: {0}")]
    ChannelConfigurationRejected(String),

    #[error("Packet channel closed")]
    ChannelClosed,

    #[error("Packet channel error: {0}")]
    ChannelIo(String),

    #[error("Packet key exhausted, rotation required")]
    KeyExhausted,

    #[error("Session stopped before it started")]
    Cancelled,
}

impl From<ChannelError> for SessionError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Closed => SessionError::ChannelClosed,
            ChannelError::Io(msg) => SessionError::ChannelIo(msg),
        }
    }
}

/// Apply `next` if the state machine allows it
fn transition(state: &watch::Sender<SessionState>, next: SessionState) -> bool {
    state.send_if_modified(|current| {
        if current.can_transition_to(&next) {
            debug!("Session {} -> {}", current, next);
            *current = next;
            true
        } else {
            false
        }
    })
}

/// One tunnel session over a host packet channel
pub struct TunnelSession<C: PacketChannel> {
    /// Interface settings, fixed for the session's lifetime
    config: TunnelConfiguration,
    /// Transform applied by the loop
    direction: Direction,
    /// Host packet channel
    channel: Arc<C>,
    /// Per-packet pipeline
    processor: PacketProcessor,
    /// Current state
    state: Arc<watch::Sender<SessionState>>,
    /// Stop signal for the packet loop
    shutdown: watch::Sender<bool>,
    /// When the session reached Running
    running_since: Mutex<Option<Instant>>,
}

impl<C: PacketChannel> TunnelSession<C> {
    /// Create an idle session
    pub fn new(
        config: TunnelConfiguration,
        channel: C,
        processor: PacketProcessor,
        direction: Direction,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            direction,
            channel: Arc::new(channel),
            processor,
            state: Arc::new(state),
            shutdown,
            running_since: Mutex::new(None),
        }
    }

    /// Get current state
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Interface settings of this session
    pub fn config(&self) -> &TunnelConfiguration {
        &self.config
    }

    /// Transform applied by the packet loop
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Live counters
    pub fn stats(&self) -> &Arc<TunnelStats> {
        self.processor.stats()
    }

    /// When the session reached Running, if it did
    pub fn running_since(&self) -> Option<Instant> {
        *self.running_since.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Traffic metrics snapshot
    pub fn metrics(&self) -> TrafficMetrics {
        TrafficMetrics::snapshot(self.stats(), self.running_since())
    }

    /// Apply the interface settings and arm the packet loop.
    ///
    /// Only valid from `Idle`. A rejected configuration moves the session
    /// to `Failed` and is returned as `ChannelConfigurationRejected`.
    pub async fn start(&self, settings: &dyn NetworkSettings) -> Result<(), SessionError> {
        if !transition(&self.state, SessionState::Starting) {
            return Err(SessionError::InvalidState(self.state().to_string()));
        }

        info!(
            "Starting tunnel session towards {} (mtu {}, {:?})",
            self.config.remote_address, self.config.mtu, self.direction
        );

        if let Err(e) = settings.apply(&self.config).await {
            let err = SessionError::ChannelConfigurationRejected(e.to_string());
            error!("Tunnel settings rejected: {}", e);
            transition(&self.state, SessionState::Failed(err.clone()));
            return Err(err);
        }

        if !transition(&self.state, SessionState::Running) {
            // stop() arrived while settings were being applied
            transition(&self.state, SessionState::Stopped);
            return Err(SessionError::Cancelled);
        }

        *self.running_since.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());

        // The loop owns the Stopping -> Stopped transition
        tokio::spawn(run_packet_loop(
            self.channel.clone(),
            self.processor.clone(),
            self.direction,
            self.state.clone(),
            self.shutdown.subscribe(),
        ));

        info!("Tunnel session running");
        Ok(())
    }

    /// Request the session to stop. Safe to call from any state.
    ///
    /// A pending read is cancelled and no further reads are armed. Use
    /// [`TunnelSession::wait_for_exit`] to observe the final state.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);

        let current = self.state();
        match current {
            SessionState::Idle => {
                transition(&self.state, SessionState::Stopped);
            }
            SessionState::Starting | SessionState::Running => {
                info!("Stopping tunnel session");
                transition(&self.state, SessionState::Stopping);
            }
            _ => debug!("stop() ignored while {}", current),
        }
    }

    /// Wait until the session reaches `Stopped` or `Failed`
    pub async fn wait_for_exit(&self) -> SessionState {
        let mut rx = self.state.subscribe();

        loop {
            let current = rx.borrow_and_update().clone();
            if current.is_terminal() {
                return current;
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }
}

impl<C: PacketChannel> Drop for TunnelSession<C> {
    fn drop(&mut self) {
        // Never leave a loop running without an owner
        self.shutdown.send_replace(true);
    }
}

/// Why the packet loop ended
enum LoopExit {
    Stopped,
    Failed(SessionError),
}

async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let stop = *shutdown.borrow_and_update();
        if stop || shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Write queued batches in order while the session is running
async fn run_writer<C: PacketChannel>(
    channel: Arc<C>,
    state: Arc<watch::Sender<SessionState>>,
    mut queue: mpsc::UnboundedReceiver<Vec<Packet>>,
) -> Result<(), SessionError> {
    while let Some(batch) = queue.recv().await {
        let running = state.borrow().is_running();
        if !running {
            // Batches still queued at stop() are discarded whole
            debug!("Discarding {} packets queued after stop", batch.len());
            break;
        }
        channel.write_packets(batch).await?;
    }
    Ok(())
}

fn writer_result(joined: Result<Result<(), SessionError>, JoinError>) -> Result<(), SessionError> {
    joined.unwrap_or_else(|e| Err(SessionError::ChannelIo(e.to_string())))
}

async fn run_packet_loop<C: PacketChannel>(
    channel: Arc<C>,
    processor: PacketProcessor,
    direction: Direction,
    state: Arc<watch::Sender<SessionState>>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("Packet loop armed ({:?})", direction);

    // Writes run on their own task so a slow write never delays the next read
    let (batches, queue) = mpsc::unbounded_channel();
    let mut writer = tokio::spawn(run_writer(channel.clone(), state.clone(), queue));
    let mut written = None;

    let exit = loop {
        let running = state.borrow().is_running();
        if !running {
            break LoopExit::Stopped;
        }

        // The read is the only suspension point; stop() cancels it
        let read = tokio::select! {
            biased;
            _ = stop_requested(&mut shutdown) => break LoopExit::Stopped,
            joined = &mut writer => {
                written = Some(writer_result(joined));
                break LoopExit::Stopped;
            }
            read = channel.read_packets() => read,
        };

        let packets = match read {
            Ok(packets) => packets,
            Err(e) => break LoopExit::Failed(e.into()),
        };
        processor.stats().record_batch();

        let survivors = processor.process_batch(direction, packets);
        if !survivors.is_empty() {
            // A batch finished after stop() is discarded whole
            let running = state.borrow().is_running();
            if !running {
                debug!("Discarding {} packets processed after stop", survivors.len());
                break LoopExit::Stopped;
            }
            if batches.send(survivors).is_err() {
                // The writer only drops its queue once it has returned
                break LoopExit::Stopped;
            }
        }

        if processor.key_exhausted() {
            break LoopExit::Failed(SessionError::KeyExhausted);
        }
    };

    // Let the writer flush what was queued while running
    drop(batches);
    let written = match written {
        Some(result) => result,
        None => writer_result(writer.await),
    };

    let exit = match (exit, written) {
        (LoopExit::Failed(err), _) | (LoopExit::Stopped, Err(err)) => LoopExit::Failed(err),
        (LoopExit::Stopped, Ok(())) => LoopExit::Stopped,
    };

    match exit {
        LoopExit::Stopped => {
            transition(&state, SessionState::Stopping);
            transition(&state, SessionState::Stopped);
            info!("Packet loop stopped");
        }
        LoopExit::Failed(err) => {
            warn!("Packet loop failed: {}", err);
            transition(&state, SessionState::Failed(err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CryptoProvider, SEAL_OVERHEAD};
    use crate::host::{ChannelHandle, HostError, MemoryChannel, MemoryHost, memory_channel};
    use crate::keys::SymmetricKey;
    use crate::packet::ProtocolTag;
    use async_trait::async_trait;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::sync::Notify;

    const WAIT: Duration = Duration::from_secs(2);

    fn session_with(
        direction: Direction,
        crypto: Arc<CryptoProvider>,
    ) -> (TunnelSession<MemoryChannel>, ChannelHandle) {
        let (channel, handle) = memory_channel(8);
        let processor = PacketProcessor::new(crypto, Arc::new(TunnelStats::new()));
        let session =
            TunnelSession::new(TunnelConfiguration::default(), channel, processor, direction);
        (session, handle)
    }

    fn crypto() -> Arc<CryptoProvider> {
        Arc::new(CryptoProvider::from_key(&SymmetricKey::generate()))
    }

    async fn wait_terminal(session: &TunnelSession<MemoryChannel>) -> SessionState {
        tokio::time::timeout(WAIT, session.wait_for_exit())
            .await
            .expect("session did not reach a terminal state")
    }

    #[test]
    fn test_transition_table() {
        use SessionState::*;

        assert!(Idle.can_transition_to(&Starting));
        assert!(Starting.can_transition_to(&Running));
        assert!(Running.can_transition_to(&Stopping));
        assert!(Stopping.can_transition_to(&Stopped));
        assert!(Running.can_transition_to(&Failed(SessionError::ChannelClosed)));

        assert!(!Idle.can_transition_to(&Running));
        assert!(!Stopped.can_transition_to(&Starting));
        assert!(!Failed(SessionError::ChannelClosed).can_transition_to(&Stopped));
    }

    #[tokio::test]
    async fn test_start_reaches_running() {
        let host = MemoryHost::new();
        let (session, _handle) = session_with(Direction::Egress, crypto());

        session.start(&host).await.unwrap();

        assert_eq!(session.state(), SessionState::Running);
        assert!(session.running_since().is_some());
        assert_eq!(host.applied(), vec![TunnelConfiguration::default()]);
    }

    #[tokio::test]
    async fn test_rejected_settings_fail_session() {
        let host = MemoryHost::new();
        host.set_reject_settings(true);
        let (session, handle) = session_with(Direction::Egress, crypto());

        let err = session.start(&host).await.unwrap_err();

        assert!(matches!(err, SessionError::ChannelConfigurationRejected(_)));
        assert!(session.state().is_failed());
        assert_eq!(handle.reads(), 0);

        // Failed is terminal
        assert!(matches!(
            session.start(&host).await,
            Err(SessionError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_inbound_packet_scenario() {
        let host = MemoryHost::new();
        let crypto = crypto();
        let (channel, mut handle) = memory_channel(8);
        let processor = PacketProcessor::new(crypto.clone(), Arc::new(TunnelStats::new()));

        let config = TunnelConfiguration::ipv4(
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(192, 168, 1, 2),
            24,
        )
        .with_dns(vec![
            IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)),
        ])
        .with_mtu(1500);
        let session = TunnelSession::new(config, channel, processor, Direction::Ingress);

        session.start(&host).await.unwrap();
        assert_eq!(session.state(), SessionState::Running);

        let plaintext = vec![0x45u8; 128 - SEAL_OVERHEAD];
        let sealed = crypto.encrypt(&plaintext).unwrap();
        assert_eq!(sealed.len(), 128);

        handle
            .inject(vec![Packet::new(sealed, ProtocolTag::IPV4)])
            .await
            .unwrap();

        let written = tokio::time::timeout(WAIT, handle.written()).await.unwrap().unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].protocol, ProtocolTag::IPV4);
        assert_eq!(written[0].len(), 128 - SEAL_OVERHEAD);
        assert_eq!(written[0].data, plaintext);
    }

    #[tokio::test]
    async fn test_empty_and_dropped_batches_rearm() {
        let host = MemoryHost::new();
        let crypto = crypto();
        let (session, mut handle) = session_with(Direction::Ingress, crypto.clone());
        session.start(&host).await.unwrap();

        handle.inject(Vec::new()).await.unwrap();
        handle
            .inject(vec![Packet::new(vec![0u8; 5], ProtocolTag::IPV4)])
            .await
            .unwrap();

        let good = Packet::new(crypto.encrypt(b"after").unwrap(), ProtocolTag::IPV6);
        handle.inject(vec![good]).await.unwrap();

        let written = tokio::time::timeout(WAIT, handle.written()).await.unwrap().unwrap();
        assert_eq!(written, vec![Packet::new(b"after".to_vec(), ProtocolTag::IPV6)]);
        assert_eq!(handle.reads(), 3);
        assert_eq!(session.stats().dropped(), 1);
    }

    #[tokio::test]
    async fn test_batch_order_preserved() {
        let host = MemoryHost::new();
        let crypto = crypto();
        let (session, mut handle) = session_with(Direction::Egress, crypto.clone());
        session.start(&host).await.unwrap();

        let batch: Vec<Packet> = (0..10u8)
            .map(|i| Packet::new(vec![0x45, i], ProtocolTag::IPV4))
            .collect();
        handle.inject(batch.clone()).await.unwrap();

        let written = tokio::time::timeout(WAIT, handle.written()).await.unwrap().unwrap();
        let opened: Vec<Vec<u8>> = written
            .iter()
            .map(|p| crypto.decrypt(&p.data).unwrap())
            .collect();
        let expected: Vec<Vec<u8>> = batch.into_iter().map(|p| p.data).collect();
        assert_eq!(opened, expected);
    }

    #[tokio::test]
    async fn test_stop_from_running() {
        let host = MemoryHost::new();
        let (session, mut handle) = session_with(Direction::Egress, crypto());
        session.start(&host).await.unwrap();

        session.stop();
        assert_eq!(wait_terminal(&session).await, SessionState::Stopped);

        // No reads or writes happen once stopped
        let reads = handle.reads();
        handle
            .inject(vec![Packet::new(vec![0x45; 20], ProtocolTag::IPV4)])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(handle.reads(), reads);
        assert!(handle.try_written().is_none());
    }

    #[tokio::test]
    async fn test_stop_from_idle() {
        let host = MemoryHost::new();
        let (session, handle) = session_with(Direction::Egress, crypto());

        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);

        // Stopping twice is harmless
        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);

        assert!(matches!(
            session.start(&host).await,
            Err(SessionError::InvalidState(_))
        ));
        assert_eq!(handle.reads(), 0);
        assert!(host.applied().is_empty());
    }

    #[tokio::test]
    async fn test_channel_close_fails_session() {
        let host = MemoryHost::new();
        let (session, mut handle) = session_with(Direction::Egress, crypto());
        session.start(&host).await.unwrap();

        handle.close();

        assert_eq!(
            wait_terminal(&session).await,
            SessionState::Failed(SessionError::ChannelClosed)
        );
    }

    #[tokio::test]
    async fn test_key_exhaustion_fails_session() {
        let host = MemoryHost::new();
        let crypto =
            Arc::new(CryptoProvider::from_key(&SymmetricKey::generate()).with_message_limit(2));
        let (session, mut handle) = session_with(Direction::Egress, crypto);
        session.start(&host).await.unwrap();

        let batch: Vec<Packet> = (0..3u8)
            .map(|i| Packet::new(vec![0x45, i], ProtocolTag::IPV4))
            .collect();
        handle.inject(batch).await.unwrap();

        assert_eq!(
            wait_terminal(&session).await,
            SessionState::Failed(SessionError::KeyExhausted)
        );

        // The two packets sealed before exhaustion were still delivered
        let written = handle.try_written().unwrap();
        assert_eq!(written.len(), 2);
    }

    /// Reads from a memory channel, never finishes a write
    struct StalledWrites {
        inner: MemoryChannel,
    }

    #[async_trait]
    impl PacketChannel for StalledWrites {
        async fn read_packets(&self) -> Result<Vec<Packet>, ChannelError> {
            self.inner.read_packets().await
        }

        async fn write_packets(&self, _packets: Vec<Packet>) -> Result<(), ChannelError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_slow_write_does_not_block_reads() {
        let host = MemoryHost::new();
        let (inner, handle) = memory_channel(8);
        let processor = PacketProcessor::new(crypto(), Arc::new(TunnelStats::new()));
        let session = TunnelSession::new(
            TunnelConfiguration::default(),
            StalledWrites { inner },
            processor,
            Direction::Egress,
        );
        session.start(&host).await.unwrap();

        for i in 0..2u8 {
            handle
                .inject(vec![Packet::new(vec![0x45, i], ProtocolTag::IPV4)])
                .await
                .unwrap();
        }

        tokio::time::timeout(WAIT, async {
            while handle.reads() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("second batch was not read while the first write was pending");

        assert_eq!(session.state(), SessionState::Running);
    }

    #[tokio::test]
    async fn test_batches_written_in_order() {
        let host = MemoryHost::new();
        let crypto = crypto();
        let (session, mut handle) = session_with(Direction::Egress, crypto.clone());
        session.start(&host).await.unwrap();

        for i in 0..5u8 {
            handle
                .inject(vec![Packet::new(vec![0x45, i], ProtocolTag::IPV4)])
                .await
                .unwrap();
        }

        for i in 0..5u8 {
            let written = tokio::time::timeout(WAIT, handle.written()).await.unwrap().unwrap();
            assert_eq!(crypto.decrypt(&written[0].data).unwrap(), vec![0x45, i]);
        }
        assert_eq!(session.metrics().batches, 5);
    }

    /// Settings that block in `apply` until released
    struct GatedSettings {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl NetworkSettings for GatedSettings {
        async fn apply(&self, _config: &TunnelConfiguration) -> Result<(), HostError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stop_while_starting() {
        let settings = GatedSettings {
            entered: Notify::new(),
            release: Notify::new(),
        };
        let (session, handle) = session_with(Direction::Egress, crypto());

        let stop_midway = async {
            settings.entered.notified().await;
            session.stop();
            assert_eq!(session.state(), SessionState::Stopping);
            settings.release.notify_one();
        };
        let (started, ()) = tokio::join!(session.start(&settings), stop_midway);

        assert_eq!(started, Err(SessionError::Cancelled));
        assert_eq!(wait_terminal(&session).await, SessionState::Stopped);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.reads(), 0);
    }
}
