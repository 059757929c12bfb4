//! cellbridge - Userspace Packet-Tunnel Bridge
//!
//! Sits between a host-provided virtual interface and the real network:
//! every packet read from the interface is sealed (or opened) with
//! ChaCha20-Poly1305 and written back, while the bridge coordinates the
//! tunnel lifecycle and reports connection status and traffic.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    BridgeController                       │
//! │  profile store ─┐          ┌──▶ StatusNotifier ──▶ events │
//! │  key store ─────┤          │                              │
//! │                 ▼          │                              │
//! │  ┌─────────────────────────┴──────────────────────────┐  │
//! │  │                   TunnelSession                     │  │
//! │  │  read_packets ──▶ PacketProcessor ──▶ write_packets │  │
//! │  │                   (CryptoProvider)                  │  │
//! │  └──────────────────────────┬──────────────────────────┘  │
//! └─────────────────────────────│─────────────────────────────┘
//!                               ▼
//!                   ┌──────────────────────┐
//!                   │  Host packet channel │
//!                   │  (virtual interface) │
//!                   └──────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Authenticated encryption**: random-nonce ChaCha20-Poly1305 per packet
//! - **Pluggable host**: channel, settings, profile and key stores are traits
//! - **Status and metrics**: pull queries, push events, JSON control messages
//!
//! # Security
//!
//! - Keys are generated from the OS RNG and never logged
//! - Decryption failures are indistinguishable from one another
//! - A key that reaches its message limit stops the tunnel until rotated

mod config;
mod control;
mod controller;
mod crypto;
mod host;
mod keys;
mod metrics;
mod packet;
mod session;
mod status;

pub use config::{
    BridgeConfig, ConfigError, DEFAULT_DESCRIPTION, DEFAULT_PROVIDER_ID, DEFAULT_SERVER_ADDRESS,
    Ipv4Settings, Ipv6Settings, Route, TunnelConfiguration, TunnelProfile,
};
pub use control::{ControlMessage, ControlSource, MessageType, StatusResponse, handle_message};
pub use controller::{BridgeController, BridgeError};
pub use crypto::{
    CryptoError, CryptoProvider, DEFAULT_MESSAGE_LIMIT, NONCE_LEN, SEAL_OVERHEAD, TAG_LEN,
};
pub use host::{
    ChannelError, ChannelHandle, FileProfileStore, HostError, MemoryChannel, MemoryHost,
    MemoryProfileStore, NetworkSettings, PacketChannel, ProfileStore, StoreError, TunnelHost,
    memory_channel,
};
pub use keys::{FileKeyStore, KEY_LEN, KeyStore, KeyStoreError, MemoryKeyStore, SymmetricKey};
pub use metrics::{TrafficMetrics, TunnelStats};
pub use packet::{Direction, Packet, PacketProcessor, ProtocolTag};
pub use session::{SessionError, SessionState, TunnelSession};
pub use status::{BridgeEvent, ConnectionStatus, ErrorCategory, StatusNotifier};
