//! Device Manager
//!
//! Owns every [`Device`] by id and the running [`ChannelService`]s. Channels
//! produced by the services are resolved to devices here; a periodic sweep
//! re-dials paired devices that went away and prunes the ones nobody trusts.
//!
//! ```text
//! ChannelService ──channel──→ Manager ──set_channel──→ Device ──packets──→ Plugin
//!       ↑                         │
//!       └──── broadcast(addr) ────┘  (identify, reconnection sweep)
//! ```

use crate::device::{Device, DeviceContext, DeviceStore};
use crate::events::ManagerEvent;
use crate::plugins::PluginRegistry;
use crate::transport::{AcceptancePolicy, Channel, ChannelService};
use crate::{ProtocolError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Period of the reconnection sweep
    pub reconnect_interval: Duration,

    /// Initial discoverability
    pub discoverable: bool,

    /// Discoverability turns itself off once this many unpaired devices exist
    pub max_unpaired_devices: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(5),
            discoverable: true,
            max_unpaired_devices: 3,
        }
    }
}

struct ManagerInner {
    config: ManagerConfig,
    context: DeviceContext,
    policy: AcceptancePolicy,
    devices: RwLock<HashMap<String, Device>>,
    /// Held while a channel is resolved and attached, and during a sweep
    membership: tokio::sync::Mutex<()>,
    services: RwLock<Vec<Arc<dyn ChannelService>>>,
    token: Mutex<CancellationToken>,
}

/// Registry of devices and channel services
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Manager {
    /// Create a stopped manager
    pub fn new(config: ManagerConfig, registry: PluginRegistry, store: DeviceStore) -> Self {
        let context = DeviceContext::new(Arc::new(registry), Arc::new(store));
        Self::with_context(config, context)
    }

    /// Create a stopped manager around an existing device context
    pub fn with_context(config: ManagerConfig, context: DeviceContext) -> Self {
        let policy = AcceptancePolicy::new(config.discoverable);
        Self {
            inner: Arc::new(ManagerInner {
                config,
                context,
                policy,
                devices: RwLock::new(HashMap::new()),
                membership: tokio::sync::Mutex::new(()),
                services: RwLock::new(Vec::new()),
                token: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Acceptance policy to hand to channel services
    pub fn policy(&self) -> AcceptancePolicy {
        self.inner.policy.clone()
    }

    /// Plugin factories
    pub fn registry(&self) -> &PluginRegistry {
        &self.inner.context.registry
    }

    /// Register a channel service; started with the manager
    pub async fn add_service(&self, service: Arc<dyn ChannelService>) {
        info!("Adding channel service {}", service.name());
        self.inner.services.write().await.push(service);
    }

    /// Load persisted devices, start services and background tasks
    pub async fn start(&self) -> Result<()> {
        let token = {
            let mut token = self.inner.token.lock().unwrap_or_else(PoisonError::into_inner);
            if !token.is_cancelled() {
                token.cancel();
            }
            *token = CancellationToken::new();
            token.clone()
        };

        self.inner.load_devices().await;

        let (sink, channels) = mpsc::unbounded_channel();
        let services = self.inner.services.read().await.clone();
        for (index, service) in services.iter().enumerate() {
            if let Err(e) = service.start(sink.clone()).await {
                error!("Failed to start channel service {}: {}", service.name(), e);
                for started in &services[..index] {
                    started.stop().await;
                }
                token.cancel();
                return Err(e);
            }
            info!(
                "Channel service {} listening on port {:?}",
                service.name(),
                service.local_port()
            );
        }
        drop(sink);

        tokio::spawn(self.inner.clone().channel_loop(channels, token.clone()));
        tokio::spawn(self.inner.clone().sweep_loop(token));

        info!("Device manager started");
        Ok(())
    }

    /// Stop services and detach every device; devices stay registered
    pub async fn stop(&self) {
        self.inner
            .token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();

        let services = self.inner.services.read().await.clone();
        for service in services {
            service.stop().await;
        }

        let devices: Vec<Device> = self.inner.devices.read().await.values().cloned().collect();
        for device in devices {
            device.set_channel(None).await;
        }

        info!("Device manager stopped");
    }

    /// Resolve a channel to its device and attach it
    pub async fn on_channel(&self, channel: Channel) {
        self.inner.on_channel(channel).await;
    }

    /// Re-dial paired devices and prune untrusted disconnected ones
    pub async fn reconnect(&self) {
        self.inner.reconnect().await;
    }

    /// Ask backends to (re)establish channels
    ///
    /// `Some("scheme://address")` targets one address through the backend
    /// named by the scheme. `None` broadcasts to the network when
    /// discoverable, otherwise only known devices are retried.
    pub async fn identify(&self, target: Option<&str>) -> Result<()> {
        match target {
            Some(uri) => self.inner.broadcast_to(uri).await,
            None if self.is_discoverable() => {
                let services = self.inner.services.read().await.clone();
                for service in services {
                    service.broadcast(None).await;
                }
                Ok(())
            }
            None => {
                self.inner.reconnect().await;
                Ok(())
            }
        }
    }

    /// Delete a device and its persisted state
    pub async fn forget_device(&self, device_id: &str) -> Result<()> {
        let device = self
            .inner
            .devices
            .read()
            .await
            .get(device_id)
            .cloned()
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;

        if device.is_paired() {
            device.unpair().await?;
        }
        let _membership = self.inner.membership.lock().await;
        self.inner.remove_device(&device).await;
        info!("Forgot device {}", device_id);
        Ok(())
    }

    /// Change discoverability
    pub fn set_discoverable(&self, discoverable: bool) {
        self.inner.set_discoverable(discoverable);
    }

    /// Whether unknown, untargeted peers are accepted
    pub fn is_discoverable(&self) -> bool {
        self.inner.policy.is_discoverable()
    }

    /// All registered devices
    pub async fn devices(&self) -> Vec<Device> {
        self.inner.devices.read().await.values().cloned().collect()
    }

    /// Device by id
    pub async fn device(&self, device_id: &str) -> Option<Device> {
        self.inner.devices.read().await.get(device_id).cloned()
    }

    /// Receive device and manager events
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.context.events.subscribe()
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.inner
            .token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }
}

impl ManagerInner {
    async fn load_devices(&self) {
        let records = self.context.store.records();
        let mut devices = self.devices.write().await;
        for record in records {
            let id = record.info.device_id.clone();
            if devices.contains_key(&id) {
                continue;
            }
            debug!("Restoring device {} ({})", record.info.device_name, id);
            self.policy.add_known(&id).await;
            devices.insert(id, Device::new(record, self.context.clone()));
        }
    }

    async fn channel_loop(
        self: Arc<Self>,
        mut channels: mpsc::UnboundedReceiver<Channel>,
        token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                channel = channels.recv() => match channel {
                    Some(channel) => self.on_channel(channel).await,
                    None => break,
                },
            }
        }
        debug!("Channel loop stopped");
    }

    async fn sweep_loop(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.reconnect_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let wake = self.context.reconnect.clone();

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
                _ = wake.notified() => {}
            }
            self.reconnect().await;
        }
        debug!("Reconnection sweep stopped");
    }

    async fn on_channel(&self, channel: Channel) {
        let _membership = self.membership.lock().await;
        let device_id = channel.device_id().to_string();
        let existing = self.devices.read().await.get(&device_id).cloned();

        let device = match existing {
            Some(device) => {
                if let Err(e) = device.authenticate(&channel) {
                    warn!("Refusing channel from {}: {}", channel.address(), e);
                    channel.close();
                    self.emit(ManagerEvent::Error {
                        device_id,
                        message: e.user_message(),
                    });
                    return;
                }
                device
            }
            None => {
                if !channel.is_allowed() && !self.policy.is_discoverable() {
                    debug!(
                        "Dropping channel from unknown device {} at {}",
                        device_id,
                        channel.address()
                    );
                    channel.close();
                    return;
                }
                self.add_device(&channel).await
            }
        };

        device.set_channel(Some(channel)).await;
    }

    async fn add_device(&self, channel: &Channel) -> Device {
        let device = {
            let mut devices = self.devices.write().await;
            devices
                .entry(channel.device_id().to_string())
                .or_insert_with(|| {
                    Device::from_identity(channel.identity().clone(), self.context.clone())
                })
                .clone()
        };
        self.policy.add_known(device.id()).await;

        info!(
            "New device {} ({}) at {}",
            device.name(),
            device.id(),
            channel.address()
        );
        self.emit(ManagerEvent::DeviceAdded {
            device_id: device.id().to_string(),
        });

        let unpaired = self
            .devices
            .read()
            .await
            .values()
            .filter(|d| !d.is_paired())
            .count();
        if unpaired >= self.config.max_unpaired_devices && self.policy.is_discoverable() {
            info!(
                "{} unpaired devices known, turning discoverability off",
                unpaired
            );
            self.set_discoverable(false);
        }

        device
    }

    async fn reconnect(&self) {
        let _membership = self.membership.lock().await;
        let devices: Vec<Device> = self.devices.read().await.values().cloned().collect();

        for device in devices {
            if device.is_connected() {
                continue;
            }

            if device.is_paired() {
                match device.last_connection() {
                    Some(uri) => {
                        if let Err(e) = self.broadcast_to(&uri).await {
                            debug!("Cannot reconnect {} via {}: {}", device.id(), uri, e);
                        }
                    }
                    None => debug!("No known address for paired device {}", device.id()),
                }
            } else {
                debug!("Pruning unpaired device {}", device.id());
                self.remove_device(&device).await;
            }
        }
    }

    async fn broadcast_to(&self, uri: &str) -> Result<()> {
        let (scheme, address) = uri.split_once("://").ok_or_else(|| {
            ProtocolError::Configuration(format!("expected scheme://address, got {:?}", uri))
        })?;

        let services = self.services.read().await.clone();
        let service = services
            .into_iter()
            .find(|s| s.name() == scheme)
            .ok_or_else(|| {
                ProtocolError::Configuration(format!("no channel service for {:?}", scheme))
            })?;

        debug!("Identifying to {} via {}", address, scheme);
        service.broadcast(Some(address)).await;
        Ok(())
    }

    async fn remove_device(&self, device: &Device) {
        let removed = {
            let mut devices = self.devices.write().await;
            let current = devices
                .get(device.id())
                .is_some_and(|current| current.ptr_eq(device));
            if current {
                devices.remove(device.id())
            } else {
                None
            }
        };
        let Some(device) = removed else {
            return;
        };

        device.destroy().await;
        self.policy.remove_known(device.id()).await;
        if let Err(e) = self.context.store.remove(device.id()) {
            warn!("Failed to delete stored state of {}: {}", device.id(), e);
        }
        self.emit(ManagerEvent::DeviceRemoved {
            device_id: device.id().to_string(),
        });
    }

    fn set_discoverable(&self, discoverable: bool) {
        if self.policy.set_discoverable(discoverable) != discoverable {
            info!("Discoverable: {}", discoverable);
            self.emit(ManagerEvent::DiscoverableChanged { discoverable });
        }
    }

    fn emit(&self, event: ManagerEvent) {
        let _ = self.context.events.send(event);
    }
}
