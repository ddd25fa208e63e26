//! Device Pairing
//!
//! Trust between two devices is established by pairing and kept by pinning
//! the peer's certificate fingerprint.
//!
//! ## Pairing Protocol
//!
//! 1. **Pairing Request**: Device A sends `kdeconnect.pair` with `pair: true`
//! 2. **User Verification**: Users compare SHA256 fingerprints on both devices
//! 3. **Pairing Response**: Device B responds with `pair: true` (accept) or `pair: false` (reject)
//! 4. **Fingerprint Storage**: The accepted peer certificate is persisted
//!
//! A peer that later presents a different certificate for the same device id
//! loses its paired status and must pair again.

pub mod certificate;

pub use certificate::{common_name, CertificateInfo};

use crate::packet::PACKET_TYPE_PAIR;
use crate::{Packet, ProtocolError, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

/// Outgoing pairing requests expire after this long
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(30);

/// Pairing status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PairingStatus {
    /// Not paired
    #[default]
    Unpaired,
    /// Pairing request sent, awaiting response
    Requested,
    /// Pairing request received, awaiting user confirmation
    RequestedByPeer,
    /// Successfully paired
    Paired,
}

/// Which side initiated a pending pairing request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairDirection {
    /// We asked the peer
    Outgoing,
    /// The peer asked us
    Incoming,
}

impl PairingStatus {
    /// Direction of a pending request, if any
    pub fn direction(&self) -> Option<PairDirection> {
        match self {
            PairingStatus::Requested => Some(PairDirection::Outgoing),
            PairingStatus::RequestedByPeer => Some(PairDirection::Incoming),
            _ => None,
        }
    }

    /// Apply an incoming `kdeconnect.pair` packet
    ///
    /// Returns the new status and what the device has to do about it.
    pub fn on_pair_packet(self, pair: bool) -> (PairingStatus, PairAction) {
        match (self, pair) {
            (PairingStatus::Unpaired, true) => {
                (PairingStatus::RequestedByPeer, PairAction::AwaitUser)
            }
            (PairingStatus::Requested, true) => (PairingStatus::Paired, PairAction::Commit),
            (PairingStatus::RequestedByPeer, true) => {
                (PairingStatus::RequestedByPeer, PairAction::None)
            }
            (PairingStatus::Paired, true) => (PairingStatus::Paired, PairAction::ConfirmPaired),
            (PairingStatus::Paired, false) => (PairingStatus::Unpaired, PairAction::Revoke),
            (_, false) => (PairingStatus::Unpaired, PairAction::None),
        }
    }
}

/// Follow-up required after a pairing state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairAction {
    /// Nothing besides recording the new status
    None,
    /// Surface the request and wait for `accept_pair` / `reject_pair`
    AwaitUser,
    /// Pin the peer certificate and persist
    Commit,
    /// Already paired; answer with `pair: true`
    ConfirmPaired,
    /// Forget the pinned certificate and persist
    Revoke,
}

/// Pairing request/response packet
#[derive(Debug, Clone)]
pub struct PairingPacket {
    /// Whether pairing is requested (true) or rejected/unpaired (false)
    pub pair: bool,
}

impl PairingPacket {
    /// Create a pairing request packet
    pub fn request() -> Packet {
        Packet::new(PACKET_TYPE_PAIR, json!({ "pair": true }))
    }

    /// Create a pairing accept response packet
    pub fn accept() -> Packet {
        Self::request()
    }

    /// Create a pairing reject response packet
    pub fn reject() -> Packet {
        Packet::new(PACKET_TYPE_PAIR, json!({ "pair": false }))
    }

    /// Create an unpair packet
    pub fn unpair() -> Packet {
        Self::reject()
    }

    /// Parse a pairing packet
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        if !packet.is_type(PACKET_TYPE_PAIR) {
            return Err(ProtocolError::InvalidPacket(
                "Not a pairing packet".to_string(),
            ));
        }

        let pair = packet
            .get_body_field::<bool>("pair")
            .ok_or_else(|| ProtocolError::InvalidPacket("Missing pair field".to_string()))?;

        Ok(Self { pair })
    }
}
