//! P2P networking layer

pub mod handshake;
pub mod packet;
pub mod peer;
pub mod registry;
pub mod udp;

// Re-exports
pub use handshake::{HandshakeError, Transition, HANDSHAKE_RETRY};
pub use packet::{
    Packet, PacketError, PacketType, DEFAULT_TTL, HEADER_LEN, MAGIC, MAX_PACKET_LEN,
    MAX_PAYLOAD_LEN,
};
pub use peer::{Peer, PeerInfo, PeerState};
pub use registry::PeerRegistry;
pub use udp::{NetError, UdpNetwork};
