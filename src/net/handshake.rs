//! The per-peer handshake state machine.
//!
//! Pure packet-in, packets-out transitions over a [`Peer`] record; all I/O
//! stays in the datagram loop. The protocol is symmetric: both sides request
//! the other's public key, both wrap a fresh session key for the other, and
//! both prove their receive direction with an encrypted `Ready`.
//!
//! Because both progressions run at once over UDP, the steps of one side can
//! interleave with the other's in either order. Two rules keep the machine
//! convergent under every interleaving:
//!
//! 1. A `PublicKeyReply` is accepted in `Initialised` as well as
//!    `KeyExchange`, and an `EncryptionContext` arriving in `KeyExchange` is
//!    absorbed (the receive key is stored, the `Ready` deferred until our own
//!    transmit key exists).
//! 2. A plaintext `PublicKeyRequest` from a peer we consider fully keyed
//!    means that peer lost its session state; we regress to `Initialised`
//!    and re-run the exchange.
//!
//! Otherwise state only moves forward, and on any failure the peer is left
//! in its pre-transition state; recovery is the maintenance pass's job
//! (reset to `Initialised` after [`HANDSHAKE_RETRY`]).

use super::packet::{Packet, PacketError, PacketType};
use super::peer::{Peer, PeerState};
use crate::crypto::{
    decrypt_session_key, encrypt_session_key, generate_session_key, CryptoError, KeyPair,
};
use crate::types::{fmt_id, NodeId};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// How long a peer may sit below `Connected` before its handshake is
/// restarted from `Initialised`. UDP gives no delivery guarantee, so a
/// dropped step would otherwise stall the peer forever.
pub const HANDSHAKE_RETRY: Duration = Duration::from_millis(300);

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("{packet:?} not valid in state {state:?}")]
    StateMismatch {
        state: PeerState,
        packet: PacketType,
    },

    #[error("encryption context received before key exchange started")]
    EarlyContext,

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Result of one state-machine step.
#[derive(Debug, Default)]
pub struct Transition {
    /// Packets to send to `peer.addr`; the caller serializes and (if the
    /// peer has crossed the encryption threshold) encrypts them.
    pub replies: Vec<Packet>,
    /// The caller should enqueue a fresh `PublicKeyRequest` for this peer
    /// (set when a restarted peer forced us back to the key exchange).
    pub request_key: bool,
}

impl Transition {
    fn none() -> Self {
        Self::default()
    }

    fn reply(pkt: Packet) -> Self {
        Self {
            replies: vec![pkt],
            request_key: false,
        }
    }
}

/// Drive one inbound packet through the state machine.
pub fn on_packet(
    my_id: NodeId,
    keys: &KeyPair,
    peer: &mut Peer,
    pkt: &Packet,
) -> Result<Transition, HandshakeError> {
    peer.touch();

    match pkt.packet_type {
        // Harmless in every state; last_contact is already refreshed.
        PacketType::Discovery | PacketType::Ping => Ok(Transition::none()),

        PacketType::PublicKeyRequest => {
            // A fully keyed peer sending a plaintext request has restarted
            // and lost its session; regress and re-exchange.
            let restarted = peer.state >= PeerState::CheckEncryption;
            if restarted {
                debug!(
                    "Peer {} re-requested our key, restarting handshake",
                    fmt_id(peer.id)
                );
                peer.reset();
            }

            let mut reply =
                Packet::reply(PacketType::PublicKeyReply, my_id, peer.id, pkt.packet_id);
            reply.write_public_key(keys)?;
            if peer.state == PeerState::Initialised {
                peer.set_state(PeerState::KeyExchange);
            }
            Ok(Transition {
                replies: vec![reply],
                request_key: restarted,
            })
        }

        PacketType::PublicKeyReply => {
            // Normally arrives in KeyExchange; accepted from Initialised as
            // well so simultaneous discovery converges in either arrival
            // order.
            if peer.state > PeerState::KeyExchange {
                return Err(HandshakeError::StateMismatch {
                    state: peer.state,
                    packet: pkt.packet_type,
                });
            }

            let public = pkt.read_public_key()?;
            let session_key = generate_session_key();
            let wrapped = encrypt_session_key(&session_key, &public)?;

            peer.public_key = Some(public);
            peer.session_key_tx = Some(session_key);

            let mut ctx =
                Packet::reply(PacketType::EncryptionContext, my_id, peer.id, pkt.packet_id);
            ctx.payload = wrapped;
            let mut replies = vec![ctx];

            if peer.session_key_rx.is_some() {
                // The peer's context arrived ahead of its reply; both
                // directions are now keyed, so prove ours immediately.
                peer.set_state(PeerState::CheckEncryption);
                replies.push(Packet::unicast(PacketType::Ready, my_id, peer.id));
            } else {
                peer.set_state(PeerState::Handshake);
            }
            Ok(Transition {
                replies,
                request_key: false,
            })
        }

        PacketType::EncryptionContext => match peer.state {
            // Before any exchange there is nothing this could belong to.
            PeerState::Initialised => Err(HandshakeError::EarlyContext),

            // Our own request is still unanswered; keep the peer's key and
            // send the Ready once our transmit direction exists.
            PeerState::KeyExchange => {
                let session_key = decrypt_session_key(&pkt.payload, keys)?;
                peer.session_key_rx = Some(session_key);
                Ok(Transition::none())
            }

            PeerState::Handshake => {
                let session_key = decrypt_session_key(&pkt.payload, keys)?;
                peer.session_key_rx = Some(session_key);

                // Transition before replying: Ready must travel encrypted
                // under session_key_tx so the peer can verify its receive
                // direction.
                peer.set_state(PeerState::CheckEncryption);
                Ok(Transition::reply(Packet::reply(
                    PacketType::Ready,
                    my_id,
                    peer.id,
                    pkt.packet_id,
                )))
            }

            // Already keyed; a late duplicate is dropped without comment.
            _ => Ok(Transition::none()),
        },

        PacketType::Ready => {
            if peer.state != PeerState::CheckEncryption {
                return Err(HandshakeError::StateMismatch {
                    state: peer.state,
                    packet: pkt.packet_type,
                });
            }
            peer.set_state(PeerState::Connected);
            info!("Peer {} connected ({})", fmt_id(peer.id), peer.addr);
            Ok(Transition::none())
        }
    }
}
