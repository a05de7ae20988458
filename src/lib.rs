//! Kapua — a peer-to-peer LAN mesh node.
//!
//! Each running node announces itself by periodic UDP broadcast, reacts to
//! newly seen peers by exchanging public keys, and bootstraps a pair of
//! per-direction AES-256-CBC session keys wrapped under RSA. Once a peer is
//! `Connected`, every further datagram between the two nodes travels inside
//! an encrypted envelope.

pub mod actions;
pub mod config;
pub mod core;
pub mod crypto;
pub mod net;
pub mod types;

// Re-exports
pub use crate::actions::{Action, ActionQueue};
pub use crate::config::{Config, ConfigError, LogLevel, ParseError, DEFAULT_PORT};
pub use crate::core::Core;
pub use crate::crypto::{CryptoError, KeyPair, SessionKey};
pub use crate::net::{NetError, Packet, PacketError, PacketType, PeerInfo, PeerRegistry, PeerState};
pub use crate::types::*;
