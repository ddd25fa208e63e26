//! Manager Events
//!
//! Events emitted by the manager and its devices. Subscribers get them through
//! [`crate::Manager::subscribe`]; nothing waits for delivery.

/// Device and manager state changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    /// A device entered the registry
    DeviceAdded {
        /// Device ID
        device_id: String,
    },

    /// A device was pruned or forgotten
    DeviceRemoved {
        /// Device ID
        device_id: String,
    },

    /// A channel was attached to a device
    Connected {
        /// Device ID
        device_id: String,
        /// Channel address, `lan://host:port`
        address: String,
    },

    /// A device lost its channel
    Disconnected {
        /// Device ID
        device_id: String,
    },

    /// The peer asked to pair; answer with accept or reject
    PairingRequested {
        /// Device ID
        device_id: String,
    },

    /// Pairing completed and the certificate is pinned
    Paired {
        /// Device ID
        device_id: String,
        /// Pinned certificate fingerprint
        fingerprint: String,
    },

    /// Trust was revoked, rejected or timed out
    Unpaired {
        /// Device ID
        device_id: String,
    },

    /// Discoverability changed
    DiscoverableChanged {
        /// New value
        discoverable: bool,
    },

    /// A user-visible, device-scoped failure
    Error {
        /// Device ID
        device_id: String,
        /// Message for the user
        message: String,
    },
}

impl ManagerEvent {
    /// Device the event is about, if any
    pub fn device_id(&self) -> Option<&str> {
        match self {
            ManagerEvent::DeviceAdded { device_id }
            | ManagerEvent::DeviceRemoved { device_id }
            | ManagerEvent::Connected { device_id, .. }
            | ManagerEvent::Disconnected { device_id }
            | ManagerEvent::PairingRequested { device_id }
            | ManagerEvent::Paired { device_id, .. }
            | ManagerEvent::Unpaired { device_id }
            | ManagerEvent::Error { device_id, .. } => Some(device_id),
            ManagerEvent::DiscoverableChanged { .. } => None,
        }
    }
}
