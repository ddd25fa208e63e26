//! Device identity
//!
//! Every connection starts with one cleartext identity packet
//! (`kdeconnect.identity`) describing the sender:
//! - `deviceId`: UUIDv4 with underscores (e.g. `740bd4b9_b418_4ee4_97d6_caf1da8151be`)
//! - `deviceName`: human-readable name
//! - `deviceType`: desktop, laptop, phone, tablet or tv
//! - `protocolVersion`: protocol version (currently 7)
//! - `incomingCapabilities`: packet types this device accepts
//! - `outgoingCapabilities`: packet types this device emits
//! - `tcpPort`: port the sender accepts connections on
//!
//! The same packet is broadcast as a UDP datagram for discovery.

use crate::packet::PACKET_TYPE_IDENTITY;
use crate::{Packet, ProtocolError, Result, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use tracing::{debug, warn};
use uuid::Uuid;

/// DMI chassis type file on Linux
const CHASSIS_TYPE_PATH: &str = "/sys/class/dmi/id/chassis_type";

/// Device types advertised in the identity packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Desktop,
    Laptop,
    Phone,
    Tablet,
    Tv,
}

impl DeviceType {
    /// Convert device type to string
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Laptop => "laptop",
            DeviceType::Phone => "phone",
            DeviceType::Tablet => "tablet",
            DeviceType::Tv => "tv",
        }
    }

    /// Parse a wire string; anything unknown is treated as a desktop
    pub fn parse(value: &str) -> Self {
        match value {
            "laptop" => DeviceType::Laptop,
            "phone" | "smartphone" => DeviceType::Phone,
            "tablet" => DeviceType::Tablet,
            "tv" => DeviceType::Tv,
            _ => DeviceType::Desktop,
        }
    }

    /// Detect the type of this machine from its DMI chassis type
    pub fn detect() -> Self {
        Self::detect_from(Path::new(CHASSIS_TYPE_PATH))
    }

    fn detect_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_chassis_type(content.trim()),
            Err(e) => {
                debug!("Could not read chassis type from {:?}: {}", path, e);
                DeviceType::Desktop
            }
        }
    }

    /// Map an SMBIOS chassis type code to a device type
    ///
    /// Portable (8), laptop (9), notebook (10) and sub-notebook (14) are
    /// laptops. Everything else reports as a desktop.
    pub fn from_chassis_type(code: &str) -> Self {
        match code.parse::<u32>() {
            Ok(8 | 9 | 10 | 14) => DeviceType::Laptop,
            _ => DeviceType::Desktop,
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device identity information
///
/// Describes our own device (sent on every connection) or a peer (parsed
/// from its identity packet).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Unique device identifier (UUIDv4 with underscores)
    pub device_id: String,

    /// Human-readable device name
    pub device_name: String,

    /// Type of device
    pub device_type: DeviceType,

    /// Protocol version
    pub protocol_version: u32,

    /// Packet types this device can receive
    pub incoming_capabilities: Vec<String>,

    /// Packet types this device can send
    pub outgoing_capabilities: Vec<String>,

    /// TCP port for connections
    pub tcp_port: u16,
}

impl DeviceInfo {
    /// Create a DeviceInfo with a fresh random device id
    pub fn new(device_name: impl Into<String>, device_type: DeviceType, tcp_port: u16) -> Self {
        Self::with_id(generate_device_id(), device_name, device_type, tcp_port)
    }

    /// Create a DeviceInfo with explicit device ID
    ///
    /// # Examples
    ///
    /// ```
    /// use lanconnect_protocol::{DeviceInfo, DeviceType};
    ///
    /// let info = DeviceInfo::with_id("abc", "My Computer", DeviceType::Desktop, 1716)
    ///     .with_incoming_capability("kdeconnect.ping");
    /// assert_eq!(info.incoming_capabilities, vec!["kdeconnect.ping"]);
    /// ```
    pub fn with_id(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        device_type: DeviceType,
        tcp_port: u16,
    ) -> Self {
        let device_name = device_name.into();
        if device_name.is_empty() || device_name.chars().count() > 32 {
            warn!(
                "Device name should be 1-32 characters, got: {:?}",
                device_name
            );
        }

        Self {
            device_id: device_id.into(),
            device_name,
            device_type,
            protocol_version: PROTOCOL_VERSION,
            incoming_capabilities: Vec::new(),
            outgoing_capabilities: Vec::new(),
            tcp_port,
        }
    }

    /// Add an incoming capability
    pub fn with_incoming_capability(mut self, capability: impl Into<String>) -> Self {
        self.incoming_capabilities.push(capability.into());
        self
    }

    /// Add an outgoing capability
    pub fn with_outgoing_capability(mut self, capability: impl Into<String>) -> Self {
        self.outgoing_capabilities.push(capability.into());
        self
    }

    /// Set all incoming capabilities at once
    pub fn with_incoming_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.incoming_capabilities = capabilities;
        self
    }

    /// Set all outgoing capabilities at once
    pub fn with_outgoing_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.outgoing_capabilities = capabilities;
        self
    }

    /// Convert DeviceInfo to an identity packet
    pub fn to_identity_packet(&self) -> Packet {
        Packet::new(
            PACKET_TYPE_IDENTITY,
            json!({
                "deviceId": self.device_id,
                "deviceName": self.device_name,
                "deviceType": self.device_type.as_str(),
                "protocolVersion": self.protocol_version,
                "incomingCapabilities": self.incoming_capabilities,
                "outgoingCapabilities": self.outgoing_capabilities,
                "tcpPort": self.tcp_port,
            }),
        )
    }

    /// Parse DeviceInfo from an identity packet
    ///
    /// A missing or empty `deviceId` is a protocol error. Other fields fall
    /// back to defaults so that older or partial peers are still usable.
    pub fn from_identity_packet(packet: &Packet) -> Result<Self> {
        if !packet.is_type(PACKET_TYPE_IDENTITY) {
            return Err(ProtocolError::InvalidPacket(format!(
                "Expected identity packet, got {}",
                packet.packet_type
            )));
        }

        let device_id = packet
            .get_body_field::<String>("deviceId")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ProtocolError::InvalidPacket("Missing deviceId".to_string()))?;

        let device_name = packet
            .get_body_field::<String>("deviceName")
            .unwrap_or_else(|| device_id.clone());

        let device_type = packet
            .get_body_field::<String>("deviceType")
            .map(|t| DeviceType::parse(&t))
            .unwrap_or_default();

        Ok(Self {
            device_id,
            device_name,
            device_type,
            protocol_version: packet
                .get_body_field::<u32>("protocolVersion")
                .unwrap_or(PROTOCOL_VERSION),
            incoming_capabilities: packet
                .get_body_field::<Vec<String>>("incomingCapabilities")
                .unwrap_or_default(),
            outgoing_capabilities: packet
                .get_body_field::<Vec<String>>("outgoingCapabilities")
                .unwrap_or_default(),
            tcp_port: packet
                .get_body_field::<u16>("tcpPort")
                .unwrap_or(crate::transport::DEFAULT_PORT),
        })
    }
}

/// Generate a UUIDv4 device ID with underscores
pub fn generate_device_id() -> String {
    Uuid::new_v4().to_string().replace('-', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_generate_device_id() {
        let id = generate_device_id();
        assert_eq!(id.len(), 36);
        assert!(!id.contains('-'));
        assert_eq!(id.matches('_').count(), 4);
    }

    #[test]
    fn test_identity_packet_roundtrip() {
        let info = DeviceInfo::with_id("device_a", "Laptop A", DeviceType::Laptop, 1716)
            .with_incoming_capability("kdeconnect.ping")
            .with_outgoing_capability("kdeconnect.ping");

        let packet = info.to_identity_packet();
        assert_eq!(packet.packet_type, PACKET_TYPE_IDENTITY);

        let parsed = DeviceInfo::from_identity_packet(&packet).unwrap();
        assert_eq!(parsed, info);
    }

    #[test]
    fn test_missing_device_id_is_rejected() {
        let packet = Packet::new(PACKET_TYPE_IDENTITY, json!({"deviceName": "x"}));
        assert!(DeviceInfo::from_identity_packet(&packet).is_err());

        let packet = Packet::new(PACKET_TYPE_IDENTITY, json!({"deviceId": ""}));
        assert!(DeviceInfo::from_identity_packet(&packet).is_err());
    }

    #[test]
    fn test_wrong_type_is_rejected() {
        let packet = Packet::new("kdeconnect.ping", json!({"deviceId": "a"}));
        assert!(DeviceInfo::from_identity_packet(&packet).is_err());
    }

    #[test]
    fn test_defaults_for_partial_identity() {
        let packet = Packet::new(
            PACKET_TYPE_IDENTITY,
            json!({"deviceId": "a", "deviceType": "fridge"}),
        );
        let info = DeviceInfo::from_identity_packet(&packet).unwrap();

        assert_eq!(info.device_name, "a");
        assert_eq!(info.device_type, DeviceType::Desktop);
        assert_eq!(info.protocol_version, PROTOCOL_VERSION);
        assert!(info.incoming_capabilities.is_empty());
    }

    #[test]
    fn test_chassis_type_mapping() {
        assert_eq!(DeviceType::from_chassis_type("10"), DeviceType::Laptop);
        assert_eq!(DeviceType::from_chassis_type("14"), DeviceType::Laptop);
        assert_eq!(DeviceType::from_chassis_type("31"), DeviceType::Desktop);
        assert_eq!(DeviceType::from_chassis_type("3"), DeviceType::Desktop);
        assert_eq!(DeviceType::from_chassis_type("garbage"), DeviceType::Desktop);
    }

    #[test]
    fn test_detect_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "9").unwrap();
        assert_eq!(DeviceType::detect_from(file.path()), DeviceType::Laptop);

        let missing = Path::new("/nonexistent/chassis_type");
        assert_eq!(DeviceType::detect_from(missing), DeviceType::Desktop);
    }
}
