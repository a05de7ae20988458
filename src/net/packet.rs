//! Wire codec: fixed-layout 46-byte header plus opaque payload.
//!
//! All multi-byte fields are little-endian at fixed offsets. Layout:
//!
//! | offset | width | field      |
//! |--------|-------|------------|
//! | 0      | 5     | magic `Kapua` |
//! | 5      | 3     | version {major, minor, patch} |
//! | 8      | 2     | type       |
//! | 10     | 8     | packet_id  |
//! | 18     | 8     | from_id    |
//! | 26     | 8     | to_id      |
//! | 34     | 2     | ttl        |
//! | 36     | 8     | request_id |
//! | 44     | 2     | length     |
//! | 46     | ≤1404 | payload    |

use crate::crypto::KeyPair;
use crate::types::{NodeId, Version, BROADCAST_ID, KAPUA_VERSION};
use rsa::pkcs8::DecodePublicKey;
use rsa::RsaPublicKey;
use thiserror::Error;

/// Magic bytes prefixing every packet: `Kapua`.
pub const MAGIC: [u8; 5] = [0x4B, 0x61, 0x70, 0x75, 0x61];

/// Fixed header width.
pub const HEADER_LEN: usize = 46;

/// Plaintext packet ceiling; fits a non-fragmenting IPv4 UDP datagram.
pub const MAX_PACKET_LEN: usize = 1450;

/// Payload capacity.
pub const MAX_PAYLOAD_LEN: usize = MAX_PACKET_LEN - HEADER_LEN;

/// Initial time-to-live. Carried for a future forwarding extension;
/// never decremented today.
pub const DEFAULT_TTL: u16 = 32;

/// When set, an incompatible minor version is also rejected on receive.
pub const STRICT_MINOR_VERSION: bool = false;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 5;
const OFF_TYPE: usize = 8;
const OFF_PACKET_ID: usize = 10;
const OFF_FROM_ID: usize = 18;
const OFF_TO_ID: usize = 26;
const OFF_TTL: usize = 34;
const OFF_REQUEST_ID: usize = 36;
const OFF_LENGTH: usize = 44;

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("datagram too short: {0} bytes")]
    TooShort(usize),

    #[error("bad magic number {0}")]
    BadMagic(String),

    #[error("incompatible version {0}.{1}.{2}")]
    BadVersion(u8, u8, u8),

    #[error("unknown packet type {0:#06x}")]
    BadType(u16),

    #[error("payload length {length} exceeds datagram ({available} available)")]
    BadLength { length: usize, available: usize },

    #[error("payload of {0} bytes exceeds capacity")]
    PayloadTooLarge(usize),

    #[error("malformed public key payload")]
    BadPublicKey,
}

/// Enumerated packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PacketType {
    Ping = 0,
    PublicKeyRequest = 1,
    PublicKeyReply = 2,
    EncryptionContext = 3,
    Ready = 4,
    Discovery = 0xFFFF,
}

impl PacketType {
    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(Self::Ping),
            1 => Some(Self::PublicKeyRequest),
            2 => Some(Self::PublicKeyReply),
            3 => Some(Self::EncryptionContext),
            4 => Some(Self::Ready),
            0xFFFF => Some(Self::Discovery),
            _ => None,
        }
    }

    pub fn command(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::PublicKeyRequest => "pubkeyrequest",
            Self::PublicKeyReply => "pubkeyreply",
            Self::EncryptionContext => "encryptioncontext",
            Self::Ready => "ready",
            Self::Discovery => "discovery",
        }
    }
}

/// One parsed (or to-be-serialized) datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: Version,
    pub packet_type: PacketType,
    /// Unique per packet.
    pub packet_id: u64,
    pub from_id: NodeId,
    pub to_id: NodeId,
    pub ttl: u16,
    /// `packet_id` being answered, or 0 if unsolicited.
    pub request_id: u64,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Broadcast packet: `to_id` defaults to [`BROADCAST_ID`].
    pub fn new(packet_type: PacketType, from_id: NodeId) -> Self {
        Self::unicast(packet_type, from_id, BROADCAST_ID)
    }

    /// Packet addressed to one node.
    pub fn unicast(packet_type: PacketType, from_id: NodeId, to_id: NodeId) -> Self {
        Self::reply(packet_type, from_id, to_id, 0)
    }

    /// Packet answering `request_id`.
    pub fn reply(packet_type: PacketType, from_id: NodeId, to_id: NodeId, request_id: u64) -> Self {
        Self {
            version: KAPUA_VERSION,
            packet_type,
            packet_id: rand::random(),
            from_id,
            to_id,
            ttl: DEFAULT_TTL,
            request_id,
            payload: Vec::new(),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.to_id == BROADCAST_ID
    }

    /// Serialize header + payload into a fresh buffer.
    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(PacketError::PayloadTooLarge(self.payload.len()));
        }

        let mut buf = vec![0u8; HEADER_LEN + self.payload.len()];
        buf[OFF_MAGIC..OFF_MAGIC + 5].copy_from_slice(&MAGIC);
        buf[OFF_VERSION] = self.version.major;
        buf[OFF_VERSION + 1] = self.version.minor;
        buf[OFF_VERSION + 2] = self.version.patch;
        buf[OFF_TYPE..OFF_TYPE + 2].copy_from_slice(&(self.packet_type as u16).to_le_bytes());
        buf[OFF_PACKET_ID..OFF_PACKET_ID + 8].copy_from_slice(&self.packet_id.to_le_bytes());
        buf[OFF_FROM_ID..OFF_FROM_ID + 8].copy_from_slice(&self.from_id.to_le_bytes());
        buf[OFF_TO_ID..OFF_TO_ID + 8].copy_from_slice(&self.to_id.to_le_bytes());
        buf[OFF_TTL..OFF_TTL + 2].copy_from_slice(&self.ttl.to_le_bytes());
        buf[OFF_REQUEST_ID..OFF_REQUEST_ID + 8].copy_from_slice(&self.request_id.to_le_bytes());
        buf[OFF_LENGTH..OFF_LENGTH + 2]
            .copy_from_slice(&(self.payload.len() as u16).to_le_bytes());
        buf[HEADER_LEN..].copy_from_slice(&self.payload);
        Ok(buf)
    }

    /// Parse a received buffer. Checks, in order: minimum length, magic,
    /// version, type, payload length.
    pub fn deserialize(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::TooShort(buf.len()));
        }

        if buf[OFF_MAGIC..OFF_MAGIC + 5] != MAGIC {
            return Err(PacketError::BadMagic(format!(
                "0x{}",
                hex::encode(&buf[OFF_MAGIC..OFF_MAGIC + 5])
            )));
        }

        let version = Version {
            major: buf[OFF_VERSION],
            minor: buf[OFF_VERSION + 1],
            patch: buf[OFF_VERSION + 2],
        };
        if version.major != KAPUA_VERSION.major
            || (STRICT_MINOR_VERSION && version.minor != KAPUA_VERSION.minor)
        {
            return Err(PacketError::BadVersion(
                version.major,
                version.minor,
                version.patch,
            ));
        }

        let raw_type = u16::from_le_bytes([buf[OFF_TYPE], buf[OFF_TYPE + 1]]);
        let packet_type = PacketType::from_u16(raw_type).ok_or(PacketError::BadType(raw_type))?;

        let length = u16::from_le_bytes([buf[OFF_LENGTH], buf[OFF_LENGTH + 1]]) as usize;
        if length > buf.len() - HEADER_LEN {
            return Err(PacketError::BadLength {
                length,
                available: buf.len() - HEADER_LEN,
            });
        }

        Ok(Self {
            version,
            packet_type,
            packet_id: u64::from_le_bytes(buf[OFF_PACKET_ID..OFF_PACKET_ID + 8].try_into().unwrap()),
            from_id: u64::from_le_bytes(buf[OFF_FROM_ID..OFF_FROM_ID + 8].try_into().unwrap()),
            to_id: u64::from_le_bytes(buf[OFF_TO_ID..OFF_TO_ID + 8].try_into().unwrap()),
            ttl: u16::from_le_bytes([buf[OFF_TTL], buf[OFF_TTL + 1]]),
            request_id: u64::from_le_bytes(
                buf[OFF_REQUEST_ID..OFF_REQUEST_ID + 8].try_into().unwrap(),
            ),
            payload: buf[HEADER_LEN..HEADER_LEN + length].to_vec(),
        })
    }

    /// Fill the payload with the DER form of the local public key.
    pub fn write_public_key(&mut self, pair: &KeyPair) -> Result<(), PacketError> {
        let der = pair.public_key_der().map_err(|_| PacketError::BadPublicKey)?;
        if der.len() > MAX_PAYLOAD_LEN {
            return Err(PacketError::PayloadTooLarge(der.len()));
        }
        self.payload = der;
        Ok(())
    }

    /// Recover a peer public key from the payload.
    pub fn read_public_key(&self) -> Result<RsaPublicKey, PacketError> {
        RsaPublicKey::from_public_key_der(&self.payload).map_err(|_| PacketError::BadPublicKey)
    }
}
