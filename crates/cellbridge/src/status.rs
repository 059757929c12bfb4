//! Connection status for external observers.
//!
//! The notifier mirrors session state; it never owns tunnel internals and
//! has no failure modes of its own.

use crate::metrics::unix_now;
use crate::session::{SessionError, SessionState};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Capacity of the event broadcast buffer
const EVENT_CAPACITY: usize = 32;

/// User-facing error categories.
///
/// Raw crypto and channel errors are never shown to users verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCategory {
    ConnectionFailed,
    ConfigurationInvalid,
    PermissionDenied,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::ConnectionFailed => write!(f, "Connection failed"),
            ErrorCategory::ConfigurationInvalid => write!(f, "Configuration invalid"),
            ErrorCategory::PermissionDenied => write!(f, "Permission denied"),
        }
    }
}

impl From<&SessionError> for ErrorCategory {
    fn from(err: &SessionError) -> Self {
        match err {
            SessionError::ChannelConfigurationRejected(_) => ErrorCategory::ConfigurationInvalid,
            _ => ErrorCategory::ConnectionFailed,
        }
    }
}

/// Snapshot of the tunnel's connection as seen from outside
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    /// Is the packet loop running?
    pub connected: bool,
    /// When `connected` last changed (seconds since the Unix epoch)
    pub since: Option<u64>,
    /// Category of the most recent failure
    pub last_error: Option<ErrorCategory>,
}

impl ConnectionStatus {
    /// Status before any session ran
    pub fn disconnected() -> Self {
        Self {
            connected: false,
            since: None,
            last_error: None,
        }
    }

    /// Derive the status for `state`, given the previous status.
    ///
    /// `since` only moves when `connected` flips; a successful connection
    /// clears the last error.
    pub fn derive(state: &SessionState, previous: &ConnectionStatus, now: u64) -> Self {
        let connected = state.is_running();

        let since = if connected != previous.connected {
            Some(now)
        } else {
            previous.since
        };

        let last_error = match state {
            SessionState::Failed(err) => Some(ErrorCategory::from(err)),
            _ if connected => None,
            _ => previous.last_error,
        };

        Self {
            connected,
            since,
            last_error,
        }
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::disconnected()
    }
}

/// Notifications pushed to observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// The tunnel connected or disconnected
    ConnectionStatusChanged(ConnectionStatus),
    /// A session or start attempt failed
    TunnelFailed {
        category: ErrorCategory,
        reason: String,
    },
}

/// Publishes [`ConnectionStatus`] by pull (`current_status`) and push
/// (`subscribe`).
#[derive(Clone)]
pub struct StatusNotifier {
    status: Arc<watch::Sender<ConnectionStatus>>,
    events: broadcast::Sender<BridgeEvent>,
}

impl StatusNotifier {
    /// Create a notifier reporting "disconnected"
    pub fn new() -> Self {
        let (status, _) = watch::channel(ConnectionStatus::disconnected());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            status: Arc::new(status),
            events,
        }
    }

    /// Current connection status
    pub fn current_status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// Receive status-change and failure events
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    /// Watch the status value itself
    pub fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Recompute the status for a session state and publish changes
    pub fn apply(&self, state: &SessionState) {
        let now = unix_now();
        let mut changed = None;

        self.status.send_if_modified(|status| {
            let next = ConnectionStatus::derive(state, status, now);
            if next == *status {
                return false;
            }
            if next.connected != status.connected {
                changed = Some(next.clone());
            }
            *status = next;
            true
        });

        if let Some(status) = changed {
            info!("Connection status changed: connected={}", status.connected);
            let _ = self.events.send(BridgeEvent::ConnectionStatusChanged(status));
        }

        if let SessionState::Failed(err) = state {
            self.publish_failure(ErrorCategory::from(err), err.to_string());
        }
    }

    /// Publish a lifecycle failure that happened outside a running session
    pub fn publish_failure(&self, category: ErrorCategory, reason: String) {
        self.status.send_if_modified(|status| {
            let modified = status.last_error != Some(category);
            status.last_error = Some(category);
            modified
        });

        debug!("Publishing tunnel failure: {}", reason);
        let _ = self.events.send(BridgeEvent::TunnelFailed { category, reason });
    }

    /// Mirror a session's state channel until it reaches a terminal state
    pub fn track(&self, mut states: watch::Receiver<SessionState>) -> JoinHandle<()> {
        let notifier = self.clone();

        tokio::spawn(async move {
            loop {
                let state = states.borrow_and_update().clone();
                notifier.apply(&state);

                if state.is_terminal() || states.changed().await.is_err() {
                    break;
                }
            }
        })
    }
}

impl Default for StatusNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_tracks_connection() {
        let idle = ConnectionStatus::disconnected();

        let up = ConnectionStatus::derive(&SessionState::Running, &idle, 100);
        assert!(up.connected);
        assert_eq!(up.since, Some(100));

        // Same connectivity keeps the original timestamp
        let still_up = ConnectionStatus::derive(&SessionState::Running, &up, 200);
        assert_eq!(still_up.since, Some(100));

        let failed = ConnectionStatus::derive(
            &SessionState::Failed(SessionError::ChannelClosed),
            &still_up,
            300,
        );
        assert!(!failed.connected);
        assert_eq!(failed.since, Some(300));
        assert_eq!(failed.last_error, Some(ErrorCategory::ConnectionFailed));

        let again = ConnectionStatus::derive(&SessionState::Running, &failed, 400);
        assert_eq!(again.last_error, None);
    }

    #[test]
    fn test_rejected_config_category() {
        let err = SessionError::ChannelConfigurationRejected("bad mtu".into());
        assert_eq!(ErrorCategory::from(&err), ErrorCategory::ConfigurationInvalid);
    }

    #[tokio::test]
    async fn test_apply_emits_on_flip_only() {
        let notifier = StatusNotifier::new();
        let mut events = notifier.subscribe();

        notifier.apply(&SessionState::Starting);
        notifier.apply(&SessionState::Running);
        notifier.apply(&SessionState::Running);
        notifier.apply(&SessionState::Stopping);
        notifier.apply(&SessionState::Stopped);

        let first = events.try_recv().unwrap();
        assert!(matches!(first, BridgeEvent::ConnectionStatusChanged(ref s) if s.connected));

        let second = events.try_recv().unwrap();
        assert!(matches!(second, BridgeEvent::ConnectionStatusChanged(ref s) if !s.connected));

        assert!(events.try_recv().is_err());
        assert!(!notifier.current_status().connected);
    }

    #[tokio::test]
    async fn test_failure_is_published() {
        let notifier = StatusNotifier::new();
        let mut events = notifier.subscribe();

        notifier.apply(&SessionState::Failed(SessionError::KeyExhausted));

        match events.try_recv().unwrap() {
            BridgeEvent::TunnelFailed { category, reason } => {
                assert_eq!(category, ErrorCategory::ConnectionFailed);
                assert!(reason.contains("exhausted"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            notifier.current_status().last_error,
            Some(ErrorCategory::ConnectionFailed)
        );
    }

    #[test]
    fn test_status_json() {
        let status = ConnectionStatus {
            connected: true,
            since: Some(5),
            last_error: Some(ErrorCategory::PermissionDenied),
        };
        let json = serde_json::to_value(&status).unwrap();

        assert_eq!(json["connected"], true);
        assert_eq!(json["lastError"], "permissionDenied");
    }
}
