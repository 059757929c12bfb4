//! Packets and the per-packet transform pipeline.

use crate::crypto::CryptoProvider;
use crate::metrics::TunnelStats;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Host protocol tag attached to every packet.
///
/// Values are host-defined and passed through unchanged; the constants
/// cover the address families packet-tunnel hosts normally report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolTag(pub i32);

impl ProtocolTag {
    /// AF_INET
    pub const IPV4: ProtocolTag = ProtocolTag(2);
    /// AF_INET6 (Darwin numbering)
    pub const IPV6: ProtocolTag = ProtocolTag(30);
}

impl fmt::Display for ProtocolTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::IPV4 => write!(f, "IPv4"),
            Self::IPV6 => write!(f, "IPv6"),
            Self(other) => write!(f, "proto({})", other),
        }
    }
}

/// A raw packet plus its protocol tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet bytes
    pub data: Vec<u8>,
    /// Protocol tag reported by the host
    pub protocol: ProtocolTag,
}

impl Packet {
    /// Create a new packet
    pub fn new(data: Vec<u8>, protocol: ProtocolTag) -> Self {
        Self { data, protocol }
    }

    /// Packet length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Is the packet empty?
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Which transform the packet loop applies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Packets leaving the device are sealed
    #[default]
    Egress,
    /// Packets entering the device are opened
    Ingress,
}

/// Per-packet transform pipeline.
///
/// One packet in yields at most one packet out; failures drop the packet
/// and are only visible through the shared [`TunnelStats`].
#[derive(Debug, Clone)]
pub struct PacketProcessor {
    crypto: Arc<CryptoProvider>,
    stats: Arc<TunnelStats>,
}

impl PacketProcessor {
    /// Create a processor over `crypto`, counting into `stats`
    pub fn new(crypto: Arc<CryptoProvider>, stats: Arc<TunnelStats>) -> Self {
        Self { crypto, stats }
    }

    /// Shared counters
    pub fn stats(&self) -> &Arc<TunnelStats> {
        &self.stats
    }

    /// Has the key run out of nonces?
    pub fn key_exhausted(&self) -> bool {
        self.crypto.is_exhausted()
    }

    /// Seal a packet, `None` means drop
    pub fn process_outbound(&self, packet: Packet) -> Option<Packet> {
        match self.crypto.encrypt(&packet.data) {
            Ok(sealed) => {
                self.stats.record_sent(sealed.len());
                Some(Packet::new(sealed, packet.protocol))
            }
            Err(_) => {
                self.stats.record_encrypt_failure();
                trace!("Dropped outbound {} packet ({} bytes)", packet.protocol, packet.len());
                None
            }
        }
    }

    /// Open a packet, `None` means drop
    pub fn process_inbound(&self, packet: Packet) -> Option<Packet> {
        match self.crypto.decrypt(&packet.data) {
            Ok(plain) => {
                self.stats.record_received(plain.len());
                Some(Packet::new(plain, packet.protocol))
            }
            Err(_) => {
                self.stats.record_decrypt_failure();
                trace!("Dropped inbound {} packet ({} bytes)", packet.protocol, packet.len());
                None
            }
        }
    }

    /// Transform one packet in `direction`
    pub fn process(&self, direction: Direction, packet: Packet) -> Option<Packet> {
        match direction {
            Direction::Egress => self.process_outbound(packet),
            Direction::Ingress => self.process_inbound(packet),
        }
    }

    /// Transform a batch, keeping survivors in input order
    pub fn process_batch(&self, direction: Direction, packets: Vec<Packet>) -> Vec<Packet> {
        packets
            .into_iter()
            .filter_map(|packet| self.process(direction, packet))
            .collect()
    }
}
