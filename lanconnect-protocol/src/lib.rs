//! KDE Connect Protocol Core
//!
//! This library implements the LAN side of the KDE Connect protocol: identity
//! discovery over UDP, fingerprint-pinned TLS channels, pairing, payload
//! transfers and capability-based packet dispatch to plugins.
//!
//! The [`Manager`] ties it together: channel services produce [`Channel`]s,
//! the manager resolves them to [`Device`]s, and devices hand packets to
//! their active plugins.

pub mod device;
pub mod events;
pub mod identity;
pub mod manager;
pub mod packet;
pub mod pairing;
pub mod plugins;
pub mod recovery;
pub mod transfer;
pub mod transport;

mod error;
pub use device::{Device, DeviceContext, DeviceRecord, DeviceStore};
pub use error::{ProtocolError, Result};
pub use events::ManagerEvent;
pub use identity::{generate_device_id, DeviceInfo, DeviceType};
pub use manager::{Manager, ManagerConfig};
pub use packet::{current_timestamp, Packet};
pub use pairing::{CertificateInfo, PairingPacket, PairingStatus};
pub use plugins::{Plugin, PluginFactory, PluginRegistry};
pub use transfer::{Transfer, TransferState};
pub use transport::{
    AcceptancePolicy, Channel, ChannelService, ChannelState, LanConfig, LanService,
};

/// Protocol version we implement
pub const PROTOCOL_VERSION: u32 = 7;
