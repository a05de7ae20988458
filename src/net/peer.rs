//! Per-peer handshake state and session keys.

use crate::crypto::SessionKey;
use crate::types::{fmt_id, NodeId};
use rsa::RsaPublicKey;
use std::net::SocketAddrV4;
use std::time::Instant;

/// Handshake progression for one peer, monotone forward.
///
/// ```text
/// Initialised ──PublicKeyRequest──► KeyExchange ──PublicKeyReply──► Handshake
///      Handshake ──EncryptionContext──► CheckEncryption ──Ready──► Connected
/// ```
///
/// From `CheckEncryption` on, every datagram to and from the peer travels
/// encrypted; only `Discovery` is still honored in plaintext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeerState {
    /// Registered, no key material yet.
    Initialised,
    /// We answered a `PublicKeyRequest`; waiting on the peer's key.
    KeyExchange,
    /// Peer key stored, our `EncryptionContext` sent; waiting on theirs.
    Handshake,
    /// Both directions keyed; waiting for the encrypted `Ready` proof.
    CheckEncryption,
    /// Fully bidirectionally usable.
    Connected,
}

/// One known peer. Owned by the registry; only accessed under its lock.
pub struct Peer {
    pub id: NodeId,
    pub addr: SocketAddrV4,
    pub state: PeerState,
    /// Peer's asymmetric key, once received.
    pub public_key: Option<RsaPublicKey>,
    /// Key we generated; encrypts traffic we send.
    pub session_key_tx: Option<SessionKey>,
    /// Key the peer generated; decrypts traffic we receive.
    pub session_key_rx: Option<SessionKey>,
    /// Updated on every accepted packet.
    pub last_contact: Instant,
    /// Updated on every state transition; drives handshake retry.
    pub last_change: Instant,
}

impl Peer {
    pub fn new(id: NodeId, addr: SocketAddrV4) -> Self {
        let now = Instant::now();
        Self {
            id,
            addr,
            state: PeerState::Initialised,
            public_key: None,
            session_key_tx: None,
            session_key_rx: None,
            last_contact: now,
            last_change: now,
        }
    }

    /// Record an accepted packet.
    pub fn touch(&mut self) {
        self.last_contact = Instant::now();
    }

    pub fn set_state(&mut self, next: PeerState) {
        if next != self.state {
            tracing::debug!(
                "Peer {} {:?} -> {:?}",
                fmt_id(self.id),
                self.state,
                next
            );
            self.state = next;
            self.last_change = Instant::now();
        }
    }

    /// Whether datagrams to/from this peer are expected to be encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.state >= PeerState::CheckEncryption
    }

    pub fn is_connected(&self) -> bool {
        self.state == PeerState::Connected
    }

    /// Restart the handshake from scratch: all key material is discarded.
    /// Always counts as a state change so retry timers restart too.
    pub fn reset(&mut self) {
        self.public_key = None;
        self.session_key_tx = None;
        self.session_key_rx = None;
        self.set_state(PeerState::Initialised);
        self.last_change = Instant::now();
    }
}

/// Copy-out view for callers outside the registry lock.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: NodeId,
    pub addr: SocketAddrV4,
    pub state: PeerState,
    pub session_key_tx: Option<SessionKey>,
    pub session_key_rx: Option<SessionKey>,
}

impl From<&Peer> for PeerInfo {
    fn from(peer: &Peer) -> Self {
        Self {
            id: peer.id,
            addr: peer.addr,
            state: peer.state,
            session_key_tx: peer.session_key_tx,
            session_key_rx: peer.session_key_rx,
        }
    }
}
