//! Device State Management
//!
//! A [`Device`] is the long-lived representation of one peer. It outlives
//! channels: a channel is attached while the peer is reachable and detached
//! when it goes away, while trust (pairing status and the pinned certificate)
//! persists in the [`DeviceStore`].
//!
//! ## Trust
//!
//! ```text
//! Unpaired ──request──→ Requested / RequestedByPeer ──accept──→ Paired
//!    ↑                          │ reject, timeout,                 │
//!    └──────────────────────────┘ disconnect                       │
//!    └──────────── unpair, certificate change ─────────────────────┘
//! ```
//!
//! Pairing pins the certificate fingerprint the peer presented on the channel.
//! A later channel for a paired device must present the same certificate;
//! otherwise the device falls back to unpaired and the channel is refused.
//!
//! ## Dispatch
//!
//! Packets arriving on the attached channel are routed by type through a
//! table rebuilt whenever the peer's capabilities change. Pair packets always
//! go to the pairing state machine. Anything else from an unpaired device is
//! dropped.

use crate::events::ManagerEvent;
use crate::packet::PACKET_TYPE_PAIR;
use crate::pairing::certificate::{certificate_from_pem, certificate_to_pem};
use crate::pairing::{PairAction, PairingPacket, PairingStatus, PAIRING_TIMEOUT};
use crate::plugins::{build_dispatch, DispatchMap, Plugin, PluginRegistry};
use crate::transport::Channel;
use crate::{CertificateInfo, DeviceInfo, Packet, ProtocolError, Result};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// File name of the device registry
pub const REGISTRY_FILE_NAME: &str = "devices.json";

/// Capacity of the event channel
const EVENT_CAPACITY: usize = 256;

/// Persisted state of one device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Identity as last announced by the peer
    #[serde(flatten)]
    pub info: DeviceInfo,

    /// Trust state
    #[serde(default)]
    pub pairing_status: PairingStatus,

    /// Pinned certificate fingerprint (SHA256), set while paired
    #[serde(default)]
    pub certificate_fingerprint: Option<String>,

    /// Pinned certificate, PEM
    #[serde(default)]
    pub certificate_pem: Option<String>,

    /// Address of the last channel, `lan://host:port`
    #[serde(default)]
    pub last_connection: Option<String>,

    /// Last time the device was seen (UNIX timestamp)
    #[serde(default)]
    pub last_seen: u64,
}

impl DeviceRecord {
    /// Fresh unpaired record
    pub fn new(info: DeviceInfo) -> Self {
        Self {
            info,
            pairing_status: PairingStatus::Unpaired,
            certificate_fingerprint: None,
            certificate_pem: None,
            last_connection: None,
            last_seen: now_secs(),
        }
    }

    /// Check if device is paired
    pub fn is_paired(&self) -> bool {
        self.pairing_status == PairingStatus::Paired
    }

    /// Fingerprint of the pinned certificate
    ///
    /// Records carrying only the PEM are fingerprinted from it.
    pub fn pinned_fingerprint(&self) -> Option<String> {
        if let Some(fingerprint) = &self.certificate_fingerprint {
            return Some(fingerprint.clone());
        }
        let pem = self.certificate_pem.as_deref()?;
        match certificate_from_pem(pem) {
            Ok(der) => Some(CertificateInfo::calculate_fingerprint(&der)),
            Err(e) => {
                warn!("Stored certificate of {} unreadable: {}", self.info.device_id, e);
                None
            }
        }
    }

    /// Pending requests do not survive a restart
    fn restored(mut self) -> Self {
        if self.pairing_status.direction().is_some() {
            self.pairing_status = PairingStatus::Unpaired;
        }
        self
    }
}

/// JSON registry of known devices, keyed by device id
///
/// Every write rewrites the whole file.
#[derive(Debug)]
pub struct DeviceStore {
    path: Option<PathBuf>,
    records: Mutex<HashMap<String, DeviceRecord>>,
}

impl DeviceStore {
    /// Open `devices.json` inside `dir`, creating the directory if needed
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_file(dir.as_ref().join(REGISTRY_FILE_NAME))
    }

    /// Open a registry file
    pub fn open_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let records: HashMap<String, DeviceRecord> = if path.exists() {
            let json = fs::read_to_string(&path)?;
            serde_json::from_str(&json)?
        } else {
            debug!("No existing registry file at {:?}", path);
            HashMap::new()
        };
        info!("Loaded {} devices from registry", records.len());

        Ok(Self {
            path: Some(path),
            records: Mutex::new(records),
        })
    }

    /// Registry that is never written to disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// All stored records
    pub fn records(&self) -> Vec<DeviceRecord> {
        lock(&self.records)
            .values()
            .cloned()
            .map(DeviceRecord::restored)
            .collect()
    }

    /// Stored record for a device
    pub fn get(&self, device_id: &str) -> Option<DeviceRecord> {
        lock(&self.records)
            .get(device_id)
            .cloned()
            .map(DeviceRecord::restored)
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    /// True if nothing is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace a record and write the registry
    pub fn save(&self, record: &DeviceRecord) -> Result<()> {
        let mut records = lock(&self.records);
        records.insert(record.info.device_id.clone(), record.clone());
        self.flush(&records)
    }

    /// Delete a record; returns whether it existed
    pub fn remove(&self, device_id: &str) -> Result<bool> {
        let mut records = lock(&self.records);
        if records.remove(device_id).is_none() {
            return Ok(false);
        }
        self.flush(&records)?;
        Ok(true)
    }

    fn flush(&self, records: &HashMap<String, DeviceRecord>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let json = serde_json::to_string_pretty(records)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        debug!("Saved device registry to {:?}", path);
        Ok(())
    }
}

/// Shared collaborators of every device, owned by the manager
#[derive(Clone)]
pub struct DeviceContext {
    /// Plugin factories
    pub registry: Arc<PluginRegistry>,
    /// Persistence
    pub store: Arc<DeviceStore>,
    /// Event fan-out
    pub events: broadcast::Sender<ManagerEvent>,
    /// Wakes the manager's reconnection sweep
    pub reconnect: Arc<Notify>,
    /// Expiry of pending pairing requests
    pub pair_timeout: Duration,
}

impl DeviceContext {
    /// Context with a fresh event channel
    pub fn new(registry: Arc<PluginRegistry>, store: Arc<DeviceStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            registry,
            store,
            events,
            reconnect: Arc::new(Notify::new()),
            pair_timeout: PAIRING_TIMEOUT,
        }
    }
}

struct DeviceInner {
    id: String,
    context: DeviceContext,
    record: RwLock<DeviceRecord>,
    channel: Mutex<Option<Channel>>,
    plugins: RwLock<Vec<Arc<dyn Plugin>>>,
    dispatch: RwLock<DispatchMap>,
    pair_timer: Mutex<Option<CancellationToken>>,
}

/// Handle to a known peer
///
/// Cheap to clone; all clones refer to the same device.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.inner.id)
            .field("pairing_status", &self.pairing_status())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Device {
    /// Create a device from a (possibly restored) record
    pub fn new(record: DeviceRecord, context: DeviceContext) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                id: record.info.device_id.clone(),
                context,
                record: RwLock::new(record.restored()),
                channel: Mutex::new(None),
                plugins: RwLock::new(Vec::new()),
                dispatch: RwLock::new(DispatchMap::new()),
                pair_timer: Mutex::new(None),
            }),
        }
    }

    /// Create an unpaired device from a peer identity
    pub fn from_identity(info: DeviceInfo, context: DeviceContext) -> Self {
        Self::new(DeviceRecord::new(info), context)
    }

    /// Get device ID
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Get device name
    pub fn name(&self) -> String {
        read(&self.inner.record).info.device_name.clone()
    }

    /// Last identity announced by the peer
    pub fn identity(&self) -> DeviceInfo {
        read(&self.inner.record).info.clone()
    }

    /// Snapshot of the persisted state
    pub fn record(&self) -> DeviceRecord {
        read(&self.inner.record).clone()
    }

    /// Current trust state
    pub fn pairing_status(&self) -> PairingStatus {
        read(&self.inner.record).pairing_status
    }

    /// Check if device is paired
    pub fn is_paired(&self) -> bool {
        self.pairing_status() == PairingStatus::Paired
    }

    /// Pinned certificate fingerprint
    pub fn certificate_fingerprint(&self) -> Option<String> {
        read(&self.inner.record).certificate_fingerprint.clone()
    }

    /// Address of the last channel
    pub fn last_connection(&self) -> Option<String> {
        read(&self.inner.record).last_connection.clone()
    }

    /// Attached channel, unless it already closed
    pub fn channel(&self) -> Option<Channel> {
        lock(&self.inner.channel)
            .as_ref()
            .filter(|c| !c.is_closed())
            .cloned()
    }

    /// Check if a live channel is attached
    pub fn is_connected(&self) -> bool {
        self.channel().is_some()
    }

    /// Active plugin instances
    pub fn plugins(&self) -> Vec<Arc<dyn Plugin>> {
        read(&self.inner.plugins).clone()
    }

    /// Active plugin instance by name
    pub fn plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        read(&self.inner.plugins)
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }

    /// Packet types that currently have a handler
    pub fn handled_types(&self) -> Vec<String> {
        let mut types: Vec<String> = read(&self.inner.dispatch).keys().cloned().collect();
        types.sort();
        types
    }

    /// True when both handles refer to the same device
    pub fn ptr_eq(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Check a new channel against the pinned certificate
    ///
    /// A paired device presenting a different certificate loses its pairing
    /// (persisted) and the channel must be refused.
    pub fn authenticate(&self, channel: &Channel) -> Result<()> {
        let fingerprint = &channel.certificate().fingerprint;

        let reset = {
            let mut record = write(&self.inner.record);
            if !record.is_paired() {
                None
            } else {
                match record.pinned_fingerprint() {
                    Some(pinned) if &pinned == fingerprint => {
                        if record.certificate_fingerprint.is_none() {
                            record.certificate_fingerprint = Some(pinned);
                            self.persist(&record);
                        }
                        None
                    }
                    Some(_) => {
                        record.pairing_status = PairingStatus::Unpaired;
                        record.certificate_fingerprint = None;
                        record.certificate_pem = None;
                        Some(record.clone())
                    }
                    None => {
                        record.certificate_fingerprint = Some(fingerprint.clone());
                        record.certificate_pem = Some(certificate_to_pem(&channel.certificate().der));
                        self.persist(&record);
                        None
                    }
                }
            }
        };

        if let Some(record) = reset {
            warn!(
                "Certificate of {} ({}) changed, pairing reset",
                record.info.device_name,
                self.id()
            );
            self.persist(&record);
            self.emit(ManagerEvent::Unpaired {
                device_id: self.id().to_string(),
            });
            return Err(ProtocolError::CertificateValidation(format!(
                "Authentication failure: {} presented a certificate that does not match the paired one",
                self.id()
            )));
        }

        Ok(())
    }

    /// Attach a channel, or detach with `None`
    ///
    /// Attaching replaces (and closes) any previous channel, refreshes the
    /// identity and plugins, fires `connected` hooks and starts dispatching.
    /// Detaching fires `disconnected` hooks and, for a paired device, wakes
    /// the reconnection sweep.
    pub async fn set_channel(&self, channel: Option<Channel>) {
        match channel {
            Some(channel) => self.attach(channel).await,
            None => {
                let previous = lock(&self.inner.channel).take();
                if let Some(previous) = previous {
                    previous.close();
                    self.on_disconnected().await;
                }
            }
        }
    }

    async fn attach(&self, channel: Channel) {
        if channel.is_closed() {
            debug!("Not attaching closed channel {}", channel.address());
            return;
        }

        let previous = lock(&self.inner.channel).replace(channel.clone());
        if let Some(previous) = previous {
            if previous.ptr_eq(&channel) {
                return;
            }
            debug!("Replacing channel {} of {}", previous.address(), self.id());
            previous.close();
        }
        channel.mark_attached();

        let record = {
            let mut record = write(&self.inner.record);
            record.info = channel.identity().clone();
            record.last_connection = Some(channel.address().to_string());
            record.last_seen = now_secs();
            record.clone()
        };
        self.persist(&record);
        self.refresh_plugins(&record.info).await;

        info!(
            "Device {} ({}) connected at {}",
            record.info.device_name,
            self.id(),
            channel.address()
        );

        let incoming = channel.take_incoming();
        let plugins = self.plugins();
        join_all(plugins.iter().map(|plugin| plugin.connected(self))).await;
        self.emit(ManagerEvent::Connected {
            device_id: self.id().to_string(),
            address: channel.address().to_string(),
        });

        tokio::spawn(self.clone().dispatch_loop(channel, incoming));
    }

    /// Align plugin instances and the dispatch table with the peer's capabilities
    async fn refresh_plugins(&self, peer: &DeviceInfo) {
        let current = self.plugins();
        let next: Vec<Arc<dyn Plugin>> = self
            .inner
            .context
            .registry
            .active_factories(peer)
            .into_iter()
            .map(|factory| {
                current
                    .iter()
                    .find(|p| p.name() == factory.name())
                    .cloned()
                    .unwrap_or_else(|| factory.create(self))
            })
            .collect();
        let removed: Vec<Arc<dyn Plugin>> = current
            .into_iter()
            .filter(|p| !next.iter().any(|n| n.name() == p.name()))
            .collect();

        *write(&self.inner.dispatch) = build_dispatch(&next, peer);
        *write(&self.inner.plugins) = next;

        for plugin in &removed {
            debug!("Plugin {} no longer active for {}", plugin.name(), self.id());
        }
        join_all(removed.iter().map(|plugin| plugin.destroy())).await;
    }

    async fn dispatch_loop(
        self,
        channel: Channel,
        incoming: Option<mpsc::UnboundedReceiver<Packet>>,
    ) {
        match incoming {
            Some(mut incoming) => loop {
                tokio::select! {
                    packet = incoming.recv() => match packet {
                        Some(packet) => self.handle_packet(packet).await,
                        None => break,
                    },
                    _ = channel.closed() => break,
                }
            },
            None => warn!(
                "Packet stream of {} already taken, closing",
                channel.address()
            ),
        }

        self.detach(&channel).await;
    }

    /// Detach `channel` if it is still the attached one
    async fn detach(&self, channel: &Channel) {
        let detached = {
            let mut slot = lock(&self.inner.channel);
            if slot.as_ref().is_some_and(|c| c.ptr_eq(channel)) {
                slot.take()
            } else {
                None
            }
        };

        channel.close();
        if detached.is_some() {
            self.on_disconnected().await;
        }
    }

    async fn on_disconnected(&self) {
        info!("Device {} ({}) disconnected", self.name(), self.id());

        let cancelled_request = {
            let mut record = write(&self.inner.record);
            record.last_seen = now_secs();
            if record.pairing_status.direction().is_some() {
                record.pairing_status = PairingStatus::Unpaired;
                true
            } else {
                false
            }
        };
        if cancelled_request {
            self.cancel_pair_timer();
            self.emit(ManagerEvent::Unpaired {
                device_id: self.id().to_string(),
            });
        }

        let plugins = self.plugins();
        join_all(plugins.iter().map(|plugin| plugin.disconnected(self))).await;
        self.emit(ManagerEvent::Disconnected {
            device_id: self.id().to_string(),
        });

        if self.is_paired() {
            self.inner.context.reconnect.notify_one();
        }
    }

    async fn handle_packet(&self, packet: Packet) {
        if packet.is_type(PACKET_TYPE_PAIR) {
            if let Err(e) = self.handle_pair(&packet).await {
                warn!("Pairing packet from {} not handled: {}", self.id(), e);
            }
            return;
        }

        if !self.is_paired() {
            debug!(
                "Dropping {} from unpaired device {}",
                packet.packet_type,
                self.id()
            );
            return;
        }

        let handlers = read(&self.inner.dispatch).get(&packet.packet_type).cloned();
        let Some(handlers) = handlers else {
            debug!("No handler for {} from {}", packet.packet_type, self.id());
            return;
        };

        for handler in handlers {
            if let Err(e) = handler.handle_packet(&packet, self).await {
                warn!(
                    "Plugin {} failed to handle {} from {}: {}",
                    handler.name(),
                    packet.packet_type,
                    self.id(),
                    e
                );
            }
        }
    }

    async fn handle_pair(&self, packet: &Packet) -> Result<()> {
        let PairingPacket { pair } = PairingPacket::from_packet(packet)?;
        let previous = self.pairing_status();
        let (status, action) = previous.on_pair_packet(pair);

        match action {
            PairAction::AwaitUser => {
                self.set_status(status);
                self.arm_pair_timer();
                info!("Pairing requested by {} ({})", self.name(), self.id());
                self.emit(ManagerEvent::PairingRequested {
                    device_id: self.id().to_string(),
                });
            }
            PairAction::Commit => self.commit_pair()?,
            PairAction::ConfirmPaired => {
                self.require_channel()?
                    .send(PairingPacket::accept())
                    .await?;
            }
            PairAction::Revoke => {
                info!("Unpaired by {} ({})", self.name(), self.id());
                self.clear_trust();
            }
            PairAction::None => {
                if status != previous {
                    info!("Pairing with {} rejected", self.id());
                    self.cancel_pair_timer();
                    self.set_status(status);
                    self.emit(ManagerEvent::Unpaired {
                        device_id: self.id().to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Ask the peer to pair
    ///
    /// Accepts instead if the peer already asked us. The request expires
    /// after the pairing timeout.
    pub async fn request_pair(&self) -> Result<()> {
        match self.pairing_status() {
            PairingStatus::Paired => return Ok(()),
            PairingStatus::RequestedByPeer => return self.accept_pair().await,
            _ => {}
        }

        let channel = self.require_channel()?;
        self.set_status(PairingStatus::Requested);
        if let Err(e) = channel.send(PairingPacket::request()).await {
            self.set_status(PairingStatus::Unpaired);
            return Err(e);
        }

        self.arm_pair_timer();
        info!("Requested pairing with {} ({})", self.name(), self.id());
        Ok(())
    }

    /// Accept the peer's pairing request
    pub async fn accept_pair(&self) -> Result<()> {
        if self.pairing_status() != PairingStatus::RequestedByPeer {
            return Err(ProtocolError::InvalidState(format!(
                "no pairing request from {}",
                self.id()
            )));
        }

        self.require_channel()?
            .send(PairingPacket::accept())
            .await?;
        self.commit_pair()
    }

    /// Decline a pending pairing request, ours or the peer's
    pub async fn reject_pair(&self) -> Result<()> {
        if self.pairing_status().direction().is_none() {
            return Err(ProtocolError::InvalidState(format!(
                "no pending pairing with {}",
                self.id()
            )));
        }

        self.cancel_pair_timer();
        self.set_status(PairingStatus::Unpaired);
        if let Some(channel) = self.channel() {
            if let Err(e) = channel.send(PairingPacket::reject()).await {
                debug!("Could not deliver rejection to {}: {}", self.id(), e);
            }
        }
        self.emit(ManagerEvent::Unpaired {
            device_id: self.id().to_string(),
        });
        Ok(())
    }

    /// Revoke trust and tell the peer if it is reachable
    pub async fn unpair(&self) -> Result<()> {
        if let Some(channel) = self.channel() {
            if let Err(e) = channel.send(PairingPacket::unpair()).await {
                debug!("Could not deliver unpair to {}: {}", self.id(), e);
            }
        }
        self.clear_trust();
        Ok(())
    }

    /// Pin the certificate of the attached channel and persist
    fn commit_pair(&self) -> Result<()> {
        let channel = self.require_channel()?;
        let certificate = channel.certificate();
        self.cancel_pair_timer();

        let record = {
            let mut record = write(&self.inner.record);
            record.pairing_status = PairingStatus::Paired;
            record.certificate_fingerprint = Some(certificate.fingerprint.clone());
            record.certificate_pem = Some(certificate_to_pem(&certificate.der));
            record.clone()
        };
        self.persist(&record);

        info!(
            "Paired with {} ({}), certificate {}",
            record.info.device_name,
            self.id(),
            certificate.fingerprint
        );
        self.emit(ManagerEvent::Paired {
            device_id: self.id().to_string(),
            fingerprint: certificate.fingerprint.clone(),
        });
        Ok(())
    }

    fn clear_trust(&self) {
        self.cancel_pair_timer();
        let record = {
            let mut record = write(&self.inner.record);
            record.pairing_status = PairingStatus::Unpaired;
            record.certificate_fingerprint = None;
            record.certificate_pem = None;
            record.clone()
        };
        self.persist(&record);
        self.emit(ManagerEvent::Unpaired {
            device_id: self.id().to_string(),
        });
    }

    /// Record a transient status; pending states are never persisted
    fn set_status(&self, status: PairingStatus) {
        write(&self.inner.record).pairing_status = status;
    }

    fn arm_pair_timer(&self) {
        let token = CancellationToken::new();
        if let Some(previous) = lock(&self.inner.pair_timer).replace(token.clone()) {
            previous.cancel();
        }

        let device = self.clone();
        let timeout = self.inner.context.pair_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => device.on_pair_timeout().await,
            }
        });
    }

    fn cancel_pair_timer(&self) {
        if let Some(token) = lock(&self.inner.pair_timer).take() {
            token.cancel();
        }
    }

    async fn on_pair_timeout(&self) {
        if self.pairing_status().direction().is_none() {
            return;
        }

        info!("Pairing with {} timed out", self.id());
        lock(&self.inner.pair_timer).take();
        self.set_status(PairingStatus::Unpaired);
        if let Some(channel) = self.channel() {
            if let Err(e) = channel.send(PairingPacket::reject()).await {
                debug!("Could not deliver timeout to {}: {}", self.id(), e);
            }
        }
        self.emit(ManagerEvent::Unpaired {
            device_id: self.id().to_string(),
        });
    }

    /// Send a packet on the attached channel
    ///
    /// Only pairing packets may be sent to an unpaired device.
    pub async fn send_packet(&self, packet: Packet) -> Result<()> {
        if !packet.is_type(PACKET_TYPE_PAIR) && !self.is_paired() {
            return Err(ProtocolError::NotPaired);
        }
        self.require_channel()?.send(packet).await
    }

    /// Upload a payload announced by `packet`
    pub async fn upload<R>(
        &self,
        packet: Packet,
        source: R,
        size: u64,
        checksum: Option<String>,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        if !self.is_paired() {
            return Err(ProtocolError::NotPaired);
        }
        self.require_channel()?
            .upload(packet, source, size, checksum)
            .await
    }

    /// Download the payload announced by `packet`
    pub async fn download<W>(&self, packet: &Packet, sink: W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        if !self.is_paired() {
            return Err(ProtocolError::NotPaired);
        }
        self.require_channel()?.download(packet, sink).await
    }

    /// Decline the payload announced by `packet`
    pub async fn reject_transfer(&self, packet: &Packet) {
        if let Some(channel) = self.channel() {
            channel.reject_transfer(packet).await;
        }
    }

    /// Tear down before the device is dropped from the registry
    pub async fn destroy(&self) {
        self.cancel_pair_timer();
        self.set_channel(None).await;

        let plugins = std::mem::take(&mut *write(&self.inner.plugins));
        write(&self.inner.dispatch).clear();
        join_all(plugins.iter().map(|plugin| plugin.destroy())).await;
    }

    fn require_channel(&self) -> Result<Channel> {
        self.channel()
            .ok_or_else(|| ProtocolError::ChannelClosed(format!("{} is not connected", self.id())))
    }

    fn persist(&self, record: &DeviceRecord) {
        if let Err(e) = self.inner.context.store.save(record) {
            warn!("Failed to persist device {}: {}", self.id(), e);
        }
    }

    fn emit(&self, event: ManagerEvent) {
        // No subscribers is fine
        let _ = self.inner.context.events.send(event);
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Get current UNIX timestamp in seconds
fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
