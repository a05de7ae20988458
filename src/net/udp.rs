//! The datagram loop: one bound, broadcast-enabled UDP socket driving the
//! handshake state machine.
//!
//! The receive side lives on a single thread (`run`); the send side is
//! shared with the action worker. The registry lock is never held across a
//! socket call: packet processing snapshots what the send path needs and
//! releases the lock before any I/O.

use super::handshake::{self, HandshakeError, HANDSHAKE_RETRY};
use super::packet::{Packet, PacketError, PacketType};
use super::peer::{PeerInfo, PeerState};
use super::registry::PeerRegistry;
use crate::actions::{Action, ActionQueue};
use crate::config::Config;
use crate::crypto::{self, KeyPair};
use crate::types::{fmt_id, NodeId};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Receive timeout; bounds the loop's reaction time to the stop flag and
/// the broadcast timer.
const RECV_TIMEOUT: Duration = Duration::from_micros(100);

/// Receive buffer: the 1450-byte plaintext ceiling plus the encrypted
/// envelope overhead (32 IV bytes + CBC padding), rounded up.
const RECV_BUFFER_LEN: usize = 2048;

/// Cadence of the eviction / handshake-retry sweep.
const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum NetError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error(transparent)]
    Crypto(#[from] crate::crypto::CryptoError),
}

/// Shared networking state: the socket plus everything packet processing
/// needs. The datagram thread owns `run`; the action worker uses the send
/// path only.
pub struct UdpNetwork {
    socket: UdpSocket,
    my_id: NodeId,
    keys: Arc<KeyPair>,
    registry: Arc<PeerRegistry>,
    actions: Arc<ActionQueue>,
    running: Arc<AtomicBool>,
    port: u16,
    discovery_enabled: bool,
    discovery_interval: Duration,
    peer_expiry: Duration,
    seeds: Vec<SocketAddrV4>,
}

impl UdpNetwork {
    /// Bind the socket and assemble the shared state. The socket is
    /// broadcast-enabled and uses a short read timeout instead of blocking.
    pub fn bind(
        config: &Config,
        my_id: NodeId,
        keys: Arc<KeyPair>,
        registry: Arc<PeerRegistry>,
        actions: Arc<ActionQueue>,
        running: Arc<AtomicBool>,
    ) -> Result<Self, NetError> {
        let socket = UdpSocket::bind(config.bind_addr())?;
        socket.set_broadcast(true)?;
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;

        // With port 0 the kernel picked one; broadcasts must carry the real
        // port so other nodes can answer.
        let port = socket.local_addr()?.port();

        Ok(Self {
            socket,
            my_id,
            keys,
            registry,
            actions,
            running,
            port,
            discovery_enabled: config.local_discovery_enable,
            discovery_interval: Duration::from_millis(config.local_discovery_interval_ms),
            peer_expiry: Duration::from_millis(config.peer_expiry_ms),
            seeds: config.seeds.clone(),
        })
    }

    /// Address the socket actually bound to (useful with port 0 in tests).
    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        Ok(self.socket.local_addr()?)
    }

    /// The datagram loop. Returns when the running flag clears; the socket
    /// drops with the owning [`UdpNetwork`].
    pub fn run(&self) {
        debug!("Starting...");
        let mut buf = [0u8; RECV_BUFFER_LEN];

        // None means "never sent", so the first broadcast goes out
        // immediately.
        let mut last_broadcast: Option<Instant> = None;
        let mut last_maintenance = Instant::now();

        while self.running.load(Ordering::SeqCst) {
            match self.socket.recv_from(&mut buf) {
                Ok((len, SocketAddr::V4(from))) => self.handle_datagram(&buf[..len], from),
                Ok((_, SocketAddr::V6(from))) => {
                    debug!("Dropping datagram from non-IPv4 source {}", from);
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    // Transient; expected when the socket closes on shutdown.
                    if self.running.load(Ordering::SeqCst) {
                        error!("Receive error: {}", e);
                    }
                }
            }

            let broadcast_due = last_broadcast
                .map(|at| at.elapsed() >= self.discovery_interval)
                .unwrap_or(true);
            if self.discovery_enabled && broadcast_due {
                self.discover();
                last_broadcast = Some(Instant::now());
            }

            if last_maintenance.elapsed() >= MAINTENANCE_INTERVAL {
                self.maintain();
                last_maintenance = Instant::now();
            }
        }

        debug!("Stopped");
    }

    /// Classify, gate, and dispatch one received datagram.
    fn handle_datagram(&self, data: &[u8], from: SocketAddrV4) {
        let pkt = match Packet::deserialize(data) {
            Ok(pkt) => pkt,
            Err(PacketError::BadVersion(major, minor, patch)) => {
                debug!(
                    "Packet received with incompatible version ({}.{}.{})",
                    major, minor, patch
                );
                return;
            }
            Err(err @ (PacketError::TooShort(_) | PacketError::BadMagic(_))) => {
                // Not a plaintext Kapua frame; it may be session traffic
                // from a peer we already share keys with.
                match self.open_from_peer(data, from) {
                    Some(pkt) => pkt,
                    None => {
                        debug!("Non-Kapua packet received ({})", err);
                        return;
                    }
                }
            }
            Err(e) => {
                debug!("Undecodable packet from {}: {}", from, e);
                return;
            }
        };

        // Our own broadcasts come back to us; drop them silently.
        if pkt.from_id == self.my_id {
            return;
        }

        if self.registry.add(pkt.from_id, from) {
            info!("New node detected, ID: {} ({})", fmt_id(pkt.from_id), from);
            if !self.actions.push(Action::RequestPublicKey {
                node_id: pkt.from_id,
            }) {
                warn!("Action queue full, dropping key request for {}", fmt_id(pkt.from_id));
            }
        }

        let outcome = self.registry.with_peer(pkt.from_id, |peer| {
            let result = handshake::on_packet(self.my_id, &self.keys, peer, &pkt);
            (result, PeerInfo::from(&*peer))
        });

        let (result, info) = match outcome {
            Some(v) => v,
            None => {
                warn!("Unknown peer {} for {}", fmt_id(pkt.from_id), pkt.packet_type.command());
                return;
            }
        };

        match result {
            Ok(transition) => {
                if transition.request_key {
                    self.actions.push(Action::RequestPublicKey {
                        node_id: pkt.from_id,
                    });
                }
                // Lock released; send with the post-transition snapshot.
                for reply in transition.replies {
                    if let Err(e) = self.send_to(&reply, from, Some(&info)) {
                        warn!("Send to {} failed: {}", from, e);
                    }
                }
            }
            Err(HandshakeError::StateMismatch { state, packet }) => {
                warn!(
                    "Dropping {} from {} in state {:?}",
                    packet.command(),
                    fmt_id(pkt.from_id),
                    state
                );
            }
            Err(HandshakeError::EarlyContext) => {
                error!(
                    "Encryption context from {} before key exchange",
                    fmt_id(pkt.from_id)
                );
            }
            Err(HandshakeError::Packet(e)) => {
                warn!("Bad {} payload from {}: {}", pkt.packet_type.command(), from, e);
            }
            Err(HandshakeError::Crypto(e)) => {
                error!("Crypto failure handling {} from {}: {}", pkt.packet_type.command(), from, e);
            }
        }
    }

    /// Try to treat a non-Kapua frame as session traffic: decrypt under the
    /// source peer's receive key and re-parse. Anything that does not come
    /// out with a valid header is not ours.
    fn open_from_peer(&self, data: &[u8], from: SocketAddrV4) -> Option<Packet> {
        let info = self.registry.info_by_addr(from)?;
        if info.state < PeerState::CheckEncryption {
            return None;
        }
        let key = info.session_key_rx?;
        let plain = crypto::open(&key, data).ok()?;
        match Packet::deserialize(&plain) {
            Ok(pkt) => Some(pkt),
            Err(e) => {
                debug!("Decrypted datagram from {} is not a packet: {}", from, e);
                None
            }
        }
    }

    /// Serialize and send one packet. Traffic to a peer at or past
    /// `CheckEncryption` is sealed under `session_key_tx`; everything else
    /// goes in clear.
    fn send_to(
        &self,
        pkt: &Packet,
        addr: SocketAddrV4,
        info: Option<&PeerInfo>,
    ) -> Result<(), NetError> {
        let bytes = pkt.serialize()?;
        let wire = match info {
            Some(info) if info.state >= PeerState::CheckEncryption => {
                let key = info.session_key_tx.ok_or(crate::crypto::CryptoError::Cipher)?;
                crypto::seal(&key, &bytes)?
            }
            _ => bytes,
        };
        self.socket.send_to(&wire, SocketAddr::V4(addr))?;
        Ok(())
    }

    /// Send `PublicKeyRequest` to a registered node. Called from the action
    /// worker.
    pub fn request_public_key(&self, node_id: NodeId) {
        let Some(info) = self.registry.info(node_id) else {
            debug!("Key request for unregistered node {}", fmt_id(node_id));
            return;
        };
        if info.state >= PeerState::CheckEncryption {
            // Keys are already exchanged; nothing to ask for.
            return;
        }
        let pkt = Packet::unicast(PacketType::PublicKeyRequest, self.my_id, node_id);
        if let Err(e) = self.send_to(&pkt, info.addr, None) {
            warn!("Public key request to {} failed: {}", info.addr, e);
        }
    }

    /// Emit one Discovery round: the IPv4 broadcast address plus every
    /// configured seed. Discovery always travels in clear.
    fn discover(&self) {
        let pkt = Packet::new(PacketType::Discovery, self.my_id);
        let broadcast = SocketAddrV4::new(Ipv4Addr::BROADCAST, self.port);

        if let Err(e) = self.send_to(&pkt, broadcast, None) {
            error!("Discovery broadcast error: {}", e);
        }
        for seed in &self.seeds {
            if let Err(e) = self.send_to(&pkt, *seed, None) {
                warn!("Discovery to seed {} failed: {}", seed, e);
            }
        }
    }

    /// Evict peers silent past the grace period; restart handshakes stuck
    /// below `Connected`.
    fn maintain(&self) {
        let mut restarted = Vec::new();

        self.registry.sweep(|peer| {
            if peer.last_contact.elapsed() >= self.peer_expiry {
                info!("Peer {} silent for too long, evicting", fmt_id(peer.id));
                return false;
            }
            if !peer.is_connected() && peer.last_change.elapsed() >= HANDSHAKE_RETRY {
                debug!("Handshake with {} stalled, restarting", fmt_id(peer.id));
                peer.reset();
                restarted.push(peer.id);
            }
            true
        });

        for node_id in restarted {
            self.actions.push(Action::RequestPublicKey { node_id });
        }
    }
}
