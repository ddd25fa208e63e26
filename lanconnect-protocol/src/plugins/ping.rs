//! Ping Plugin
//!
//! Simple connectivity testing plugin that sends and receives ping packets.
//!
//! ## Protocol
//!
//! **Packet Type**: `kdeconnect.ping`
//!
//! **Capabilities**:
//! - Incoming: `kdeconnect.ping` - Can receive pings
//! - Outgoing: `kdeconnect.ping` - Can send pings
//!
//! ## Packet Format
//!
//! ```json
//! {
//!     "id": 1234567890,
//!     "type": "kdeconnect.ping",
//!     "body": {
//!         "message": "Optional message"
//!     }
//! }
//! ```
//!
//! The `message` field is optional. If omitted, the packet body is empty.
//! No response is expected.
//!
//! ## Example
//!
//! ```rust,ignore
//! use lanconnect_protocol::plugins::ping::PingPlugin;
//!
//! if let Some(plugin) = device.plugin("ping") {
//!     if let Some(ping) = plugin.as_any().downcast_ref::<PingPlugin>() {
//!         ping.send_ping(&device, Some("Hello!".to_string())).await?;
//!     }
//! }
//! ```

use crate::{Device, Packet, Result};
use async_trait::async_trait;
use serde_json::json;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use super::{Plugin, PluginFactory};

/// Packet type for pings
pub const PING_PACKET_TYPE: &str = "kdeconnect.ping";

/// Ping plugin for connectivity testing
///
/// One instance per device; counters live as long as the device keeps the
/// plugin active.
#[derive(Debug)]
pub struct PingPlugin {
    /// Device ID this plugin is attached to
    device_id: String,

    /// Count of pings received
    pings_received: AtomicU64,

    /// Count of pings sent
    pings_sent: AtomicU64,

    /// Message of the last ping that carried one
    last_message: Mutex<Option<String>>,
}

impl PingPlugin {
    /// Create a ping plugin for a device
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            pings_received: AtomicU64::new(0),
            pings_sent: AtomicU64::new(0),
            last_message: Mutex::new(None),
        }
    }

    /// Device this instance belongs to
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Get the number of pings received
    pub fn pings_received(&self) -> u64 {
        self.pings_received.load(Ordering::Relaxed)
    }

    /// Get the number of pings sent
    pub fn pings_sent(&self) -> u64 {
        self.pings_sent.load(Ordering::Relaxed)
    }

    /// Message of the most recent ping that had one
    pub fn last_message(&self) -> Option<String> {
        self.last_message
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Create a ping packet
    pub fn create_ping(message: Option<String>) -> Packet {
        let body = match message {
            Some(msg) => json!({ "message": msg }),
            None => json!({}),
        };
        Packet::new(PING_PACKET_TYPE, body)
    }

    /// Send a ping to the device
    pub async fn send_ping(&self, device: &Device, message: Option<String>) -> Result<()> {
        device.send_packet(Self::create_ping(message)).await?;
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
        debug!("Ping sent to {}", device.id());
        Ok(())
    }

    fn handle_ping(&self, packet: &Packet, device: &Device) {
        let count = self.pings_received.fetch_add(1, Ordering::Relaxed) + 1;
        let message: Option<String> = packet.get_body_field("message");

        match &message {
            Some(msg) => info!(
                "Received ping from {} ({}) with message: {}",
                device.name(),
                device.id(),
                msg
            ),
            None => info!("Received ping from {} ({})", device.name(), device.id()),
        }
        debug!("Total pings received from {}: {}", device.id(), count);

        if message.is_some() {
            *self
                .last_message
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = message;
        }
    }
}

#[async_trait]
impl Plugin for PingPlugin {
    fn name(&self) -> &str {
        "ping"
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        vec![PING_PACKET_TYPE.to_string()]
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        vec![PING_PACKET_TYPE.to_string()]
    }

    async fn handle_packet(&self, packet: &Packet, device: &Device) -> Result<()> {
        if packet.is_type(PING_PACKET_TYPE) {
            self.handle_ping(packet, device);
        }
        Ok(())
    }

    async fn destroy(&self) {
        info!(
            "Ping plugin for {} destroyed (received: {}, sent: {})",
            self.device_id,
            self.pings_received(),
            self.pings_sent()
        );
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Factory for creating PingPlugin instances
#[derive(Debug, Clone, Copy)]
pub struct PingPluginFactory;

impl PluginFactory for PingPluginFactory {
    fn name(&self) -> &str {
        "ping"
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        vec![PING_PACKET_TYPE.to_string()]
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        vec![PING_PACKET_TYPE.to_string()]
    }

    fn create(&self, device: &Device) -> Arc<dyn Plugin> {
        Arc::new(PingPlugin::new(device.id()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceContext, DeviceStore};
    use crate::plugins::PluginRegistry;
    use crate::{DeviceInfo, DeviceType, ProtocolError};

    fn create_test_device() -> Device {
        let info = DeviceInfo::with_id("phone", "Test Phone", DeviceType::Phone, 1716);
        let context = DeviceContext::new(
            Arc::new(PluginRegistry::new()),
            Arc::new(DeviceStore::in_memory()),
        );
        Device::from_identity(info, context)
    }

    #[test]
    fn test_factory_creates_plugin_for_device() {
        let device = create_test_device();
        let plugin = PingPluginFactory.create(&device);

        assert_eq!(plugin.name(), "ping");
        assert_eq!(plugin.incoming_capabilities(), vec![PING_PACKET_TYPE]);
        assert_eq!(plugin.outgoing_capabilities(), vec![PING_PACKET_TYPE]);

        let ping = plugin.as_any().downcast_ref::<PingPlugin>().unwrap();
        assert_eq!(ping.device_id(), "phone");
        assert_eq!(ping.pings_received(), 0);
        assert_eq!(ping.pings_sent(), 0);
    }

    #[test]
    fn test_create_ping() {
        let packet = PingPlugin::create_ping(Some("Hello!".to_string()));
        assert_eq!(packet.packet_type, PING_PACKET_TYPE);
        assert_eq!(
            packet.body.get("message").and_then(|v| v.as_str()),
            Some("Hello!")
        );

        let packet = PingPlugin::create_ping(None);
        assert!(packet.body.get("message").is_none());
    }

    #[tokio::test]
    async fn test_handle_pings() {
        let device = create_test_device();
        let plugin = PingPlugin::new(device.id());

        plugin
            .handle_packet(&Packet::new(PING_PACKET_TYPE, json!({})), &device)
            .await
            .unwrap();
        assert_eq!(plugin.pings_received(), 1);
        assert_eq!(plugin.last_message(), None);

        for i in 0..4 {
            let packet = Packet::new(PING_PACKET_TYPE, json!({ "message": format!("Ping {}", i) }));
            plugin.handle_packet(&packet, &device).await.unwrap();
        }
        assert_eq!(plugin.pings_received(), 5);
        assert_eq!(plugin.last_message().as_deref(), Some("Ping 3"));
    }

    #[tokio::test]
    async fn test_ignore_non_ping_packets() {
        let device = create_test_device();
        let plugin = PingPlugin::new(device.id());

        let packet = Packet::new("kdeconnect.battery", json!({}));
        plugin.handle_packet(&packet, &device).await.unwrap();

        assert_eq!(plugin.pings_received(), 0);
    }

    #[tokio::test]
    async fn test_send_requires_paired_device() {
        let device = create_test_device();
        let plugin = PingPlugin::new(device.id());

        let result = plugin.send_ping(&device, None).await;
        assert!(matches!(result, Err(ProtocolError::NotPaired)));
        assert_eq!(plugin.pings_sent(), 0);
    }
}
