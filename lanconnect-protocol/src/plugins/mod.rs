//! Capability handlers
//!
//! The core does not interpret packet bodies. Everything beyond identity and
//! pairing is handed to plugins, matched by packet `type`.
//!
//! ## Capabilities
//!
//! Devices advertise the packet types they can receive (`incomingCapabilities`)
//! and send (`outgoingCapabilities`) in their identity packet. A plugin is
//! activated for a device when one of its incoming types is something the
//! peer sends, or one of its outgoing types is something the peer receives.
//!
//! Each device builds an explicit dispatch table `type -> [plugin]` from its
//! active plugins, limited to types the peer actually sends. A plugin whose
//! incoming capabilities do not intersect the peer's outgoing ones is never
//! handed a packet.
//!
//! ## Lifecycle
//!
//! ```text
//! create ─→ connected ─→ handle_packet* ─→ disconnected ─→ ... ─→ destroy
//!              ↑                               │
//!              └───────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use lanconnect_protocol::plugins::{ping::PingPluginFactory, PluginRegistry};
//! use std::sync::Arc;
//!
//! let mut registry = PluginRegistry::new();
//! registry.register_factory(Arc::new(PingPluginFactory))?;
//! let identity = identity
//!     .with_incoming_capabilities(registry.get_all_incoming_capabilities())
//!     .with_outgoing_capabilities(registry.get_all_outgoing_capabilities());
//! ```

pub mod ping;

use crate::{Device, DeviceInfo, Packet, ProtocolError, Result};
use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Per-device dispatch table: packet type to the handlers registered for it
pub type DispatchMap = HashMap<String, Vec<Arc<dyn Plugin>>>;

/// Creates one plugin instance per device
pub trait PluginFactory: Send + Sync {
    /// Plugin name, unique within a registry
    fn name(&self) -> &str;

    /// Packet types instances can receive
    fn incoming_capabilities(&self) -> Vec<String>;

    /// Packet types instances can send
    fn outgoing_capabilities(&self) -> Vec<String>;

    /// Create the instance for `device`
    fn create(&self, device: &Device) -> Arc<dyn Plugin>;
}

/// A capability handler bound to one device
///
/// Instances are shared between the dispatch task and the device, so every
/// method takes `&self`; keep mutable state behind atomics or locks.
///
/// `handle_packet` must tolerate repeated and unexpected packets. Errors are
/// logged by the device and never close the channel.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Plugin name
    fn name(&self) -> &str;

    /// Packet types this plugin receives
    fn incoming_capabilities(&self) -> Vec<String>;

    /// Packet types this plugin sends
    fn outgoing_capabilities(&self) -> Vec<String>;

    /// Handle a packet of one of the incoming types
    async fn handle_packet(&self, packet: &Packet, device: &Device) -> Result<()>;

    /// A channel was attached to the device
    async fn connected(&self, _device: &Device) {}

    /// The device lost its channel
    async fn disconnected(&self, _device: &Device) {}

    /// The plugin is being dropped for good
    async fn destroy(&self) {}

    /// Downcast support
    fn as_any(&self) -> &dyn Any;
}

fn intersects(ours: &[String], theirs: &[String]) -> bool {
    ours.iter().any(|capability| theirs.contains(capability))
}

/// Whether a handler with these capabilities is useful for `peer`
pub fn is_active(incoming: &[String], outgoing: &[String], peer: &DeviceInfo) -> bool {
    intersects(incoming, &peer.outgoing_capabilities)
        || intersects(outgoing, &peer.incoming_capabilities)
}

/// Build the dispatch table for `peer` from its active plugins
///
/// Only types the peer declares as outgoing are routed.
pub fn build_dispatch(plugins: &[Arc<dyn Plugin>], peer: &DeviceInfo) -> DispatchMap {
    let mut dispatch = DispatchMap::new();
    for plugin in plugins {
        for packet_type in plugin.incoming_capabilities() {
            if !peer.outgoing_capabilities.contains(&packet_type) {
                continue;
            }
            dispatch
                .entry(packet_type)
                .or_default()
                .push(plugin.clone());
        }
    }
    dispatch
}

/// Registered plugin factories
///
/// Factories are kept in registration order, which is also the order
/// handlers for the same type are called in.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: Vec<Arc<dyn PluginFactory>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("factories", &self.list_plugins())
            .finish()
    }
}

impl PluginRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin factory
    ///
    /// # Errors
    ///
    /// Returns an error if a factory with the same name is already registered.
    pub fn register_factory(&mut self, factory: Arc<dyn PluginFactory>) -> Result<()> {
        let name = factory.name();
        if self.get_factory(name).is_some() {
            return Err(ProtocolError::Plugin(format!(
                "Plugin factory '{}' is already registered",
                name
            )));
        }

        info!("Registered plugin factory: {}", name);
        self.factories.push(factory);
        Ok(())
    }

    /// Look up a factory by name
    pub fn get_factory(&self, name: &str) -> Option<&Arc<dyn PluginFactory>> {
        self.factories.iter().find(|f| f.name() == name)
    }

    /// Names of registered factories
    pub fn list_plugins(&self) -> Vec<String> {
        self.factories.iter().map(|f| f.name().to_string()).collect()
    }

    /// Number of registered factories
    pub fn factory_count(&self) -> usize {
        self.factories.len()
    }

    /// Union of incoming capabilities, for our identity packet
    pub fn get_all_incoming_capabilities(&self) -> Vec<String> {
        self.collect(|f| f.incoming_capabilities())
    }

    /// Union of outgoing capabilities, for our identity packet
    pub fn get_all_outgoing_capabilities(&self) -> Vec<String> {
        self.collect(|f| f.outgoing_capabilities())
    }

    fn collect(&self, capabilities: impl Fn(&dyn PluginFactory) -> Vec<String>) -> Vec<String> {
        let mut all: Vec<String> = self
            .factories
            .iter()
            .flat_map(|f| capabilities(f.as_ref()))
            .collect();
        all.sort();
        all.dedup();
        all
    }

    /// Whether `factory` should be active for `peer`
    pub fn is_active(factory: &dyn PluginFactory, peer: &DeviceInfo) -> bool {
        is_active(
            &factory.incoming_capabilities(),
            &factory.outgoing_capabilities(),
            peer,
        )
    }

    /// Factories that should be active for `peer`
    pub fn active_factories(&self, peer: &DeviceInfo) -> Vec<Arc<dyn PluginFactory>> {
        self.factories
            .iter()
            .filter(|f| Self::is_active(f.as_ref(), peer))
            .cloned()
            .collect()
    }
}
