//! Network Packet
//!
//! This module implements the packet structure and line framing of the
//! protocol. Packets are JSON-formatted messages with a newline terminator.
//!
//! ## Packet Structure
//!
//! Each packet contains:
//! - `id`: UNIX epoch timestamp in milliseconds, regenerated when serialized
//! - `type`: Packet type in format `kdeconnect.<plugin>[.<action>]`
//! - `body`: JSON dictionary of plugin-specific parameters
//! - `payloadSize`: (optional) Size of payload data in bytes
//! - `payloadTransferInfo`: (optional) Transfer negotiation parameters
//!
//! The core never looks inside `body` beyond requiring well-formed JSON.
//!
//! ## References
//! - [Valent Protocol Reference](https://valent.andyholmes.ca/documentation/protocol.html)

use crate::{ProtocolError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Packet type of the identity packet exchanged first on every connection
pub const PACKET_TYPE_IDENTITY: &str = "kdeconnect.identity";

/// Packet type of pairing requests and responses
pub const PACKET_TYPE_PAIR: &str = "kdeconnect.pair";

/// Upper bound for a single packet line
pub const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;

/// Represents a network packet
///
/// # Examples
///
/// ```
/// use lanconnect_protocol::Packet;
/// use serde_json::json;
///
/// let mut packet = Packet::new(
///     "kdeconnect.identity",
///     json!({
///         "deviceId": "my_device_id",
///         "deviceName": "My Computer",
///         "protocolVersion": 7,
///         "deviceType": "desktop"
///     })
/// );
///
/// let bytes = packet.to_bytes().unwrap();
/// let parsed = Packet::from_bytes(&bytes).unwrap();
/// assert_eq!(parsed.packet_type, "kdeconnect.identity");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Packet {
    /// UNIX timestamp in milliseconds
    ///
    /// Some clients send this as a string.
    #[serde(deserialize_with = "deserialize_id", serialize_with = "serialize_id")]
    pub id: i64,

    /// Packet type, e.g. "kdeconnect.ping"
    #[serde(rename = "type")]
    pub packet_type: String,

    /// Plugin-specific parameters
    #[serde(default = "empty_body")]
    pub body: Value,

    /// Optional payload size in bytes
    #[serde(rename = "payloadSize", skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<i64>,

    /// Optional payload transfer negotiation info
    #[serde(
        rename = "payloadTransferInfo",
        skip_serializing_if = "Option::is_none"
    )]
    pub payload_transfer_info: Option<HashMap<String, Value>>,
}

impl Packet {
    /// Creates a new packet with the specified type and body
    ///
    /// The packet ID is set to the current timestamp in milliseconds.
    pub fn new(packet_type: impl Into<String>, body: Value) -> Self {
        Self::with_id(current_timestamp(), packet_type, body)
    }

    /// Create a new packet with an explicit timestamp
    pub fn with_id(id: i64, packet_type: impl Into<String>, body: Value) -> Self {
        Self {
            id,
            packet_type: packet_type.into(),
            body,
            payload_size: None,
            payload_transfer_info: None,
        }
    }

    /// Serialize packet to bytes with newline terminator
    ///
    /// The `id` is regenerated at this moment, so a packet that is sent twice
    /// carries two different ids.
    ///
    /// # Examples
    ///
    /// ```
    /// use lanconnect_protocol::Packet;
    /// use serde_json::json;
    ///
    /// let mut packet = Packet::with_id(1, "kdeconnect.ping", json!({}));
    /// let bytes = packet.to_bytes().unwrap();
    ///
    /// assert_eq!(bytes.last(), Some(&b'\n'));
    /// assert!(packet.id > 1);
    /// ```
    pub fn to_bytes(&mut self) -> Result<Vec<u8>> {
        self.id = current_timestamp();
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Deserialize a packet from bytes
    ///
    /// Accepts both `\n` and `\r\n` terminated input, or none at all.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::InvalidPacket` if the data is not valid JSON
    /// or doesn't conform to the packet structure.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let trimmed = data
            .strip_suffix(b"\r\n")
            .or_else(|| data.strip_suffix(b"\n"))
            .unwrap_or(data);

        serde_json::from_slice(trimmed).map_err(|e| {
            ProtocolError::InvalidPacket(format!("Failed to deserialize packet: {}", e))
        })
    }

    /// Builder pattern: Set payload size
    pub fn with_payload_size(mut self, size: i64) -> Self {
        self.payload_size = Some(size);
        self
    }

    /// Builder pattern: Set payload transfer info
    pub fn with_payload_transfer_info(mut self, info: HashMap<String, Value>) -> Self {
        self.payload_transfer_info = Some(info);
        self
    }

    /// Builder pattern: Add a key-value pair to the body
    pub fn with_body_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if let Value::Object(ref mut map) = self.body {
            map.insert(key.into(), value.into());
        }
        self
    }

    /// Check if packet is of a specific type
    pub fn is_type(&self, packet_type: &str) -> bool {
        self.packet_type == packet_type
    }

    /// True when the packet references a payload to be fetched
    ///
    /// Both `payloadSize` and a non-empty `payloadTransferInfo` are required.
    pub fn has_payload(&self) -> bool {
        self.payload_size.is_some()
            && self
                .payload_transfer_info
                .as_ref()
                .is_some_and(|info| !info.is_empty())
    }

    /// Port advertised in `payloadTransferInfo`
    pub fn payload_port(&self) -> Option<u16> {
        self.payload_transfer_info
            .as_ref()?
            .get("port")?
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
    }

    /// Get a field from the body as a specific type
    pub fn get_body_field<T>(&self, key: &str) -> Option<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.body
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Read one newline-terminated line from a stream
///
/// Reads byte by byte so nothing past the newline is consumed; whatever
/// follows (a TLS handshake, raw payload) stays in the stream. Returns `None`
/// on EOF before any byte. The returned line excludes the terminator.
pub async fn read_line<R>(reader: &mut R, max: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(1024);
    let mut byte = [0u8; 1];

    loop {
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            if line.is_empty() {
                return Ok(None);
            }
            return Err(ProtocolError::InvalidPacket(
                "Connection closed mid-packet".to_string(),
            ));
        }
        if byte[0] == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(Some(line));
        }
        line.push(byte[0]);
        if line.len() > max {
            return Err(ProtocolError::PacketSizeExceeded(line.len(), max));
        }
    }
}

fn empty_body() -> Value {
    Value::Object(serde_json::Map::new())
}

fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let value: Value = Deserialize::deserialize(deserializer)?;
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| Error::custom("Invalid number for id")),
        Value::String(s) => s
            .parse::<i64>()
            .map_err(|_| Error::custom("Invalid string for id")),
        _ => Err(Error::custom("id must be a number or string")),
    }
}

fn serialize_id<S>(id: &i64, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_i64(*id)
}

/// Generate current UNIX timestamp in milliseconds
pub fn current_timestamp() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_packet() {
        let packet = Packet::new("kdeconnect.ping", json!({}));
        assert_eq!(packet.packet_type, "kdeconnect.ping");
        assert!(packet.body.is_object());
        assert!(packet.id > 0);
    }

    #[test]
    fn test_serialization_is_one_line() {
        let mut packet = Packet::new(
            PACKET_TYPE_IDENTITY,
            json!({
                "deviceId": "test_device",
                "deviceName": "Test\nDevice",
                "protocolVersion": 7
            }),
        );

        let bytes = packet.to_bytes().unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
        // Embedded newlines in strings are escaped by JSON
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[test]
    fn test_to_bytes_regenerates_id() {
        let mut packet = Packet::with_id(42, "kdeconnect.ping", json!({}));
        let bytes = packet.to_bytes().unwrap();
        assert_ne!(packet.id, 42);

        let parsed = Packet::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.id, packet.id);
    }

    #[test]
    fn test_roundtrip_preserves_type_and_body() {
        let body = json!({
            "isCharging": true,
            "currentCharge": 85,
            "nested": {"list": [1, 2, 3], "empty": {}}
        });
        let mut original = Packet::new("kdeconnect.battery", body.clone());

        let bytes = original.to_bytes().unwrap();
        let parsed = Packet::from_bytes(&bytes).unwrap();

        assert_eq!(parsed.packet_type, "kdeconnect.battery");
        assert_eq!(parsed.body, body);
    }

    #[test]
    fn test_deserialization_with_crlf() {
        let json_data =
            r#"{"id":1234567890,"type":"kdeconnect.ping","body":{}}"#.to_string() + "\r\n";
        let packet = Packet::from_bytes(json_data.as_bytes()).unwrap();

        assert_eq!(packet.id, 1234567890);
        assert_eq!(packet.packet_type, "kdeconnect.ping");
    }

    #[test]
    fn test_missing_body_defaults_to_object() {
        let packet = Packet::from_bytes(br#"{"id":1,"type":"kdeconnect.ping"}"#).unwrap();
        assert_eq!(packet.body, json!({}));
    }

    #[test]
    fn test_id_as_string() {
        let json_data = r#"{"id":"1234567890","type":"kdeconnect.ping","body":{}}"#;
        let packet = Packet::from_bytes(json_data.as_bytes()).unwrap();

        assert_eq!(packet.id, 1234567890);
    }

    #[test]
    fn test_invalid_packet() {
        assert!(matches!(
            Packet::from_bytes(b"not json data"),
            Err(ProtocolError::InvalidPacket(_))
        ));
        // Missing type
        assert!(Packet::from_bytes(br#"{"id":1,"body":{}}"#).is_err());
    }

    #[test]
    fn test_has_payload() {
        let mut info = HashMap::new();
        info.insert("port".to_string(), json!(1739));

        let packet = Packet::new("kdeconnect.share.request", json!({}))
            .with_payload_size(1024)
            .with_payload_transfer_info(info);
        assert!(packet.has_payload());
        assert_eq!(packet.payload_port(), Some(1739));

        let sized_only = Packet::new("kdeconnect.share.request", json!({})).with_payload_size(1);
        assert!(!sized_only.has_payload());

        let empty_info = Packet::new("kdeconnect.share.request", json!({}))
            .with_payload_size(1)
            .with_payload_transfer_info(HashMap::new());
        assert!(!empty_info.has_payload());
        assert_eq!(empty_info.payload_port(), None);
    }

    #[test]
    fn test_builder_pattern() {
        let packet = Packet::new(PACKET_TYPE_IDENTITY, json!({}))
            .with_body_field("deviceId", "test_device")
            .with_body_field("protocolVersion", 7);

        assert_eq!(
            packet.get_body_field::<String>("deviceId"),
            Some("test_device".to_string())
        );
        assert_eq!(packet.get_body_field::<i64>("protocolVersion"), Some(7));
        assert_eq!(packet.get_body_field::<String>("nonexistent"), None);
        assert!(packet.is_type(PACKET_TYPE_IDENTITY));
    }

    #[tokio::test]
    async fn test_read_line_stops_at_newline() {
        let data = b"{\"a\":1}\nTRAILING".to_vec();
        let mut reader = std::io::Cursor::new(data);

        let line = read_line(&mut reader, MAX_PACKET_SIZE).await.unwrap();
        assert_eq!(line.as_deref(), Some(&b"{\"a\":1}"[..]));

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"TRAILING");
    }

    #[tokio::test]
    async fn test_read_line_eof_and_limit() {
        let mut empty = std::io::Cursor::new(Vec::new());
        assert!(read_line(&mut empty, 16).await.unwrap().is_none());

        let mut partial = std::io::Cursor::new(b"abc".to_vec());
        assert!(read_line(&mut partial, 16).await.is_err());

        let mut long = std::io::Cursor::new(vec![b'x'; 64]);
        assert!(matches!(
            read_line(&mut long, 16).await,
            Err(ProtocolError::PacketSizeExceeded(_, 16))
        ));
    }

    #[tokio::test]
    async fn test_read_line_across_segments() {
        let mut reader = tokio_test::io::Builder::new()
            .read(b"{\"type\":\"kdeconnect.")
            .read(b"ping\"}\r")
            .read(b"\n")
            .build();

        let line = read_line(&mut reader, MAX_PACKET_SIZE).await.unwrap().unwrap();
        assert_eq!(line, b"{\"type\":\"kdeconnect.ping\"}");
    }
}
