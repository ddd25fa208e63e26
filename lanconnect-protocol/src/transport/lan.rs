//! LAN Channel Service
//!
//! Discovery and connections share one port number: identity datagrams are
//! received on UDP, channels are accepted on TCP.
//!
//! ## Acceptance
//!
//! Both an identity datagram and an inbound connection are checked against
//! the [`AcceptancePolicy`] before anything is sent back:
//!
//! 1. A device with that id already exists
//! 2. The sender's host was targeted with [`ChannelService::broadcast`]
//! 3. We are discoverable
//!
//! Anything else is dropped without a reply.
//!
//! ## Failure handling
//!
//! Failing to bind the TCP listener fails [`ChannelService::start`]. Failing
//! to bind UDP only disables discovery; a background task keeps retrying with
//! exponential backoff. Peers can still reach us directly.

use super::channel::{lan_address, Channel, ChannelConfig, PendingChannel, LAN_SCHEME};
use super::tls::LocalIdentity;
use super::tls_config::TlsConfig;
use super::{AcceptancePolicy, ChannelService, DEFAULT_PORT};
use crate::packet::PACKET_TYPE_IDENTITY;
use crate::recovery::BackoffStrategy;
use crate::transfer::TRANSFER_PORT_RANGE;
use crate::{CertificateInfo, DeviceInfo, Packet, ProtocolError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Largest datagram we accept
const MAX_DATAGRAM_SIZE: usize = 65_507;

/// LAN service settings
#[derive(Debug, Clone)]
pub struct LanConfig {
    /// Port for both UDP discovery and TCP connections; 0 picks one
    pub port: u16,
    /// Ports probed for payload uploads
    pub transfer_port_range: RangeInclusive<u16>,
    /// Destination of network-wide identity broadcasts
    pub broadcast_address: Ipv4Addr,
    /// Period of the identity broadcast while discoverable
    pub broadcast_interval: Duration,
    /// Local address to bind
    pub bind_address: IpAddr,
}

impl Default for LanConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            transfer_port_range: TRANSFER_PORT_RANGE,
            broadcast_address: Ipv4Addr::BROADCAST,
            broadcast_interval: Duration::from_secs(10),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

/// LAN backend: UDP discovery plus TCP/TLS channels
pub struct LanService {
    inner: Arc<LanInner>,
}

struct LanInner {
    config: LanConfig,
    info: DeviceInfo,
    tls: Arc<TlsConfig>,
    policy: AcceptancePolicy,
    port: AtomicU16,
    token: Mutex<CancellationToken>,
    channel_config: RwLock<Option<ChannelConfig>>,
    udp: RwLock<Option<Arc<UdpSocket>>>,
    allowed: RwLock<HashSet<IpAddr>>,
    channels: Mutex<HashMap<String, Channel>>,
    dialing: Mutex<HashSet<String>>,
}

impl LanService {
    /// Create a stopped service
    ///
    /// `info.tcp_port` is replaced by the port actually bound on start.
    pub fn new(
        info: DeviceInfo,
        certificate: &CertificateInfo,
        policy: AcceptancePolicy,
        config: LanConfig,
    ) -> Result<Self> {
        let tls = TlsConfig::new(certificate)?;
        Ok(Self {
            inner: Arc::new(LanInner {
                config,
                info,
                tls,
                policy,
                port: AtomicU16::new(0),
                token: Mutex::new(CancellationToken::new()),
                channel_config: RwLock::new(None),
                udp: RwLock::new(None),
                allowed: RwLock::new(HashSet::new()),
                channels: Mutex::new(HashMap::new()),
                dialing: Mutex::new(HashSet::new()),
            }),
        })
    }

    /// Acceptance policy shared with the manager
    pub fn policy(&self) -> &AcceptancePolicy {
        &self.inner.policy
    }

    /// Whether `host` has been explicitly targeted
    pub async fn is_allowed(&self, host: IpAddr) -> bool {
        self.inner.allowed.read().await.contains(&host)
    }

    /// Open channels produced by this service
    pub async fn channels(&self) -> Vec<Channel> {
        self.inner.channels.lock().await.values().cloned().collect()
    }

    /// Whether discovery is currently running
    pub async fn is_discovery_bound(&self) -> bool {
        self.inner.udp.read().await.is_some()
    }
}

#[async_trait]
impl ChannelService for LanService {
    fn name(&self) -> &str {
        LAN_SCHEME
    }

    async fn start(&self, sink: mpsc::UnboundedSender<Channel>) -> Result<()> {
        let inner = &self.inner;
        let token = CancellationToken::new();
        {
            let mut current = inner.token.lock().await;
            current.cancel();
            *current = token.clone();
        }

        let bind = SocketAddr::new(inner.config.bind_address, inner.config.port);
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| ProtocolError::from_io_error(e, "binding TCP listener"))?;
        let port = listener.local_addr()?.port();
        inner.port.store(port, Ordering::SeqCst);
        info!("Accepting connections on TCP port {}", port);

        let mut info = inner.info.clone();
        info.tcp_port = port;
        let config = ChannelConfig {
            local: LocalIdentity {
                info,
                tls: inner.tls.clone(),
            },
            transfer_ports: inner.config.transfer_port_range.clone(),
        };
        *inner.channel_config.write().await = Some(config.clone());

        let udp_addr = SocketAddr::new(inner.config.bind_address, port);
        match bind_udp(udp_addr).await {
            Ok(socket) => {
                info!("Listening for identity datagrams on UDP port {}", port);
                *inner.udp.write().await = Some(socket.clone());
                tokio::spawn(inner.clone().datagram_loop(
                    socket,
                    config.clone(),
                    sink.clone(),
                    token.clone(),
                ));
            }
            Err(e) => {
                warn!(
                    "Failed to bind UDP port {}: {}. Discovery disabled until it can be bound",
                    port, e
                );
                tokio::spawn(inner.clone().rebind_loop(
                    udp_addr,
                    config.clone(),
                    sink.clone(),
                    token.clone(),
                ));
            }
        }

        tokio::spawn(inner.clone().accept_loop(listener, config, sink, token.clone()));
        tokio::spawn(inner.clone().broadcast_loop(token));

        Ok(())
    }

    async fn stop(&self) {
        let inner = &self.inner;
        inner.token.lock().await.cancel();

        let channels: Vec<Channel> = inner.channels.lock().await.drain().map(|(_, c)| c).collect();
        for channel in &channels {
            channel.close();
        }
        inner.dialing.lock().await.clear();
        *inner.udp.write().await = None;
        *inner.channel_config.write().await = None;
        inner.port.store(0, Ordering::SeqCst);

        info!("LAN service stopped, closed {} channel(s)", channels.len());
    }

    async fn broadcast(&self, address: Option<&str>) {
        let inner = &self.inner;
        let port = inner.port.load(Ordering::SeqCst);

        let target = match address {
            Some(address) => match resolve_target(address, port).await {
                Ok(target) => {
                    inner.allowed.write().await.insert(target.ip());
                    target
                }
                Err(e) => {
                    warn!("Cannot broadcast to {}: {}", address, e);
                    return;
                }
            },
            None => SocketAddr::new(IpAddr::V4(inner.config.broadcast_address), port),
        };

        if let Err(e) = inner.send_identity(target).await {
            debug!("Identity broadcast to {} failed: {}", target, e);
        }
    }

    fn local_port(&self) -> Option<u16> {
        match self.inner.port.load(Ordering::SeqCst) {
            0 => None,
            port => Some(port),
        }
    }
}

impl Drop for LanService {
    fn drop(&mut self) {
        if let Ok(token) = self.inner.token.try_lock() {
            token.cancel();
        }
    }
}

impl LanInner {
    async fn send_identity(&self, target: SocketAddr) -> Result<()> {
        let socket = self.udp.read().await.clone().ok_or_else(|| {
            ProtocolError::NetworkError("Discovery socket is not bound".to_string())
        })?;
        let mut identity = match self.channel_config.read().await.as_ref() {
            Some(config) => config.local.info.to_identity_packet(),
            None => {
                return Err(ProtocolError::NetworkError(
                    "Service is not started".to_string(),
                ))
            }
        };

        let bytes = identity.to_bytes()?;
        socket.send_to(&bytes, target).await?;
        debug!("Sent identity ({} bytes) to {}", bytes.len(), target);
        Ok(())
    }

    /// Announce ourselves to the whole network while discoverable
    async fn broadcast_loop(self: Arc<Self>, token: CancellationToken) {
        let period = self.config.broadcast_interval.max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.policy.is_discoverable() {
                continue;
            }

            let port = self.port.load(Ordering::SeqCst);
            let target = SocketAddr::new(IpAddr::V4(self.config.broadcast_address), port);
            if let Err(e) = self.send_identity(target).await {
                debug!("Periodic broadcast to {} failed: {}", target, e);
            }
        }
    }

    async fn rebind_loop(
        self: Arc<Self>,
        addr: SocketAddr,
        config: ChannelConfig,
        sink: mpsc::UnboundedSender<Channel>,
        token: CancellationToken,
    ) {
        let mut backoff = BackoffStrategy::new();

        while let Some(delay) = backoff.next_delay() {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match bind_udp(addr).await {
                Ok(socket) => {
                    info!("Discovery restored on UDP port {}", addr.port());
                    *self.udp.write().await = Some(socket.clone());
                    self.datagram_loop(socket, config, sink, token).await;
                    return;
                }
                Err(e) if !e.is_recoverable() => {
                    warn!("Giving up on UDP port {}: {}", addr.port(), e);
                    return;
                }
                Err(e) => debug!("UDP rebind attempt {} failed: {}", backoff.attempt, e),
            }
        }
    }

    async fn datagram_loop(
        self: Arc<Self>,
        socket: Arc<UdpSocket>,
        config: ChannelConfig,
        sink: mpsc::UnboundedSender<Channel>,
        token: CancellationToken,
    ) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let (len, src) = tokio::select! {
                _ = token.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        debug!("Datagram receive failed: {}", e);
                        continue;
                    }
                },
            };

            let packet = match Packet::from_bytes(&buf[..len]) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!("Ignoring malformed datagram from {}: {}", src, e);
                    continue;
                }
            };
            if !packet.is_type(PACKET_TYPE_IDENTITY) {
                debug!("Ignoring {} datagram from {}", packet.packet_type, src);
                continue;
            }

            let identity = match DeviceInfo::from_identity_packet(&packet) {
                Ok(identity) => identity,
                Err(e) => {
                    debug!("Ignoring identity from {}: {}", src, e);
                    continue;
                }
            };
            if identity.device_id == config.local.info.device_id {
                continue;
            }

            self.clone()
                .on_identity(identity, src.ip(), &config, &sink, &token)
                .await;
        }

        debug!("Datagram loop stopped");
    }

    async fn on_identity(
        self: Arc<Self>,
        identity: DeviceInfo,
        host: IpAddr,
        config: &ChannelConfig,
        sink: &mpsc::UnboundedSender<Channel>,
        token: &CancellationToken,
    ) {
        let allowed = self.allowed.read().await.contains(&host);
        let acceptance = self.policy.decide(&identity.device_id, allowed).await;
        if !acceptance.is_accepted() {
            debug!(
                "Ignoring identity of unknown device {} from {}",
                identity.device_id, host
            );
            return;
        }

        let address = lan_address(host, identity.tcp_port);
        if let Some(existing) = self.channels.lock().await.get(&address) {
            if !existing.is_closed() {
                debug!("Already connected to {}", address);
                return;
            }
        }
        if !self.dialing.lock().await.insert(address.clone()) {
            debug!("Already dialing {}", address);
            return;
        }

        debug!(
            "Dialing {} ({}) at {} [{:?}]",
            identity.device_name, identity.device_id, address, acceptance
        );

        let peer_addr = SocketAddr::new(host, identity.tcp_port);
        let config = config.clone();
        let sink = sink.clone();
        let channel_token = token.child_token();
        tokio::spawn(async move {
            match Channel::open(&config, peer_addr, identity, channel_token, allowed).await {
                Ok(channel) => self.register(channel, &sink).await,
                Err(e) => debug!("Failed to open channel to {}: {}", address, e),
            }
            self.dialing.lock().await.remove(&address);
        });
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        config: ChannelConfig,
        sink: mpsc::UnboundedSender<Channel>,
        token: CancellationToken,
    ) {
        let mut backoff = BackoffStrategy::new();

        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((tcp, peer_addr)) => {
                    backoff.reset();
                    tokio::spawn(self.clone().on_connection(
                        tcp,
                        peer_addr,
                        config.clone(),
                        sink.clone(),
                        token.child_token(),
                    ));
                }
                Err(e) => {
                    let e = ProtocolError::from_io_error(e, "accepting connection");
                    if !e.is_recoverable() {
                        error!("Accept loop stopped: {}", e);
                        break;
                    }
                    warn!("Accept failed: {}", e);
                    let Some(delay) = backoff.next_delay() else {
                        break;
                    };
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        debug!("Accept loop stopped");
    }

    async fn on_connection(
        self: Arc<Self>,
        tcp: TcpStream,
        peer_addr: SocketAddr,
        config: ChannelConfig,
        sink: mpsc::UnboundedSender<Channel>,
        token: CancellationToken,
    ) {
        let _ = tcp.set_nodelay(true);

        let pending = match PendingChannel::read_identity(tcp, peer_addr, token).await {
            Ok(pending) => pending,
            Err(e) => {
                debug!("Dropping connection from {}: {}", peer_addr, e);
                return;
            }
        };

        let device_id = pending.identity().device_id.clone();
        if device_id == config.local.info.device_id {
            debug!("Dropping connection from ourselves at {}", peer_addr);
            return;
        }

        let allowed = self.allowed.read().await.contains(&peer_addr.ip());
        if !self.policy.decide(&device_id, allowed).await.is_accepted() {
            debug!(
                "Ignoring connection from unknown device {} at {}",
                device_id, peer_addr
            );
            return;
        }

        match pending.upgrade(&config, allowed).await {
            Ok(channel) => self.register(channel, &sink).await,
            Err(e) => warn!("Handshake with {} failed: {}", peer_addr, e),
        }
    }

    /// Track a new channel and hand it to the manager
    async fn register(self: &Arc<Self>, channel: Channel, sink: &mpsc::UnboundedSender<Channel>) {
        let address = channel.address().to_string();
        if let Some(previous) = self
            .channels
            .lock()
            .await
            .insert(address.clone(), channel.clone())
        {
            if !previous.ptr_eq(&channel) {
                debug!("Replacing channel at {}", address);
            }
        }

        let inner = self.clone();
        let watched = channel.clone();
        tokio::spawn(async move {
            watched.closed().await;
            let mut channels = inner.channels.lock().await;
            if channels.get(&address).is_some_and(|c| c.ptr_eq(&watched)) {
                channels.remove(&address);
            }
        });

        if sink.send(channel.clone()).is_err() {
            debug!("No consumer for channels, closing {}", channel.address());
            channel.close();
        }
    }
}

async fn bind_udp(addr: SocketAddr) -> Result<Arc<UdpSocket>> {
    let socket = UdpSocket::bind(addr)
        .await
        .map_err(|e| ProtocolError::from_io_error(e, "binding UDP socket"))?;
    socket.set_broadcast(true)?;
    Ok(Arc::new(socket))
}

/// Parse `host[:port]`, resolving names
async fn resolve_target(address: &str, default_port: u16) -> Result<SocketAddr> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    let query = if address.contains(':') {
        address.to_string()
    } else {
        format!("{}:{}", address, default_port)
    };
    lookup_host(query)
        .await?
        .next()
        .ok_or_else(|| ProtocolError::NetworkError(format!("Cannot resolve {}", address)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Acceptance;
    use crate::DeviceType;

    fn service(id: &str, discoverable: bool) -> LanService {
        let cert = CertificateInfo::generate(id).unwrap();
        let info = DeviceInfo::with_id(id, id, DeviceType::Desktop, 0);
        let config = LanConfig {
            port: 0,
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..LanConfig::default()
        };
        LanService::new(info, &cert, AcceptancePolicy::new(discoverable), config).unwrap()
    }

    async fn next_channel(rx: &mut mpsc::UnboundedReceiver<Channel>) -> Channel {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for a channel")
            .expect("sink closed")
    }

    #[tokio::test]
    async fn test_busy_udp_port_is_retried() {
        let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let err = bind_udp(addr).await.unwrap_err();
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_resolve_target() {
        assert_eq!(
            resolve_target("10.0.0.2", 1716).await.unwrap(),
            "10.0.0.2:1716".parse().unwrap()
        );
        assert_eq!(
            resolve_target("10.0.0.2:1800", 1716).await.unwrap(),
            "10.0.0.2:1800".parse().unwrap()
        );
        assert_eq!(
            resolve_target("localhost", 1716).await.unwrap().port(),
            1716
        );
    }

    #[tokio::test]
    async fn test_start_binds_and_stop_releases() {
        let lan = service("alice", false);
        assert_eq!(lan.local_port(), None);

        let (tx, _rx) = mpsc::unbounded_channel();
        lan.start(tx).await.unwrap();
        assert!(lan.local_port().is_some());
        assert_eq!(lan.name(), "lan");

        lan.stop().await;
        assert_eq!(lan.local_port(), None);
    }

    #[tokio::test]
    async fn test_start_fails_when_tcp_port_taken() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let cert = CertificateInfo::generate("alice").unwrap();
        let info = DeviceInfo::with_id("alice", "alice", DeviceType::Desktop, 0);
        let config = LanConfig {
            port,
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..LanConfig::default()
        };
        let lan = LanService::new(info, &cert, AcceptancePolicy::new(true), config).unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(lan.start(tx).await.is_err());
    }

    #[tokio::test]
    async fn test_start_degrades_when_udp_port_taken() {
        // Find a port free for TCP, then hold it for UDP
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        let _udp = UdpSocket::bind(("127.0.0.1", port)).await.unwrap();

        let cert = CertificateInfo::generate("alice").unwrap();
        let info = DeviceInfo::with_id("alice", "alice", DeviceType::Desktop, 0);
        let config = LanConfig {
            port,
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..LanConfig::default()
        };
        let lan = LanService::new(info, &cert, AcceptancePolicy::new(true), config).unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        lan.start(tx).await.unwrap();
        assert_eq!(lan.local_port(), Some(port));
        assert!(!lan.is_discovery_bound().await);
        lan.stop().await;
    }

    #[tokio::test]
    async fn test_targeted_broadcast_connects_both_sides() {
        let alice = service("alice", false);
        let bob = service("bob", true);
        let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        alice.start(alice_tx).await.unwrap();
        bob.start(bob_tx).await.unwrap();

        let bob_port = bob.local_port().unwrap();
        alice
            .broadcast(Some(&format!("127.0.0.1:{}", bob_port)))
            .await;
        assert!(alice.is_allowed(IpAddr::V4(Ipv4Addr::LOCALHOST)).await);

        // Bob is discoverable and dials back; alice accepts because she targeted bob
        let at_bob = next_channel(&mut bob_rx).await;
        let at_alice = next_channel(&mut alice_rx).await;
        assert_eq!(at_bob.device_id(), "alice");
        assert_eq!(at_alice.device_id(), "bob");
        assert!(at_alice.is_allowed());

        // A second identity for the same address is de-duplicated
        alice
            .broadcast(Some(&format!("127.0.0.1:{}", bob_port)))
            .await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(bob_rx.try_recv().is_err());

        alice.stop().await;
        bob.stop().await;
        assert!(at_alice.is_closed());
        assert!(at_bob.is_closed());
    }

    #[tokio::test]
    async fn test_undiscoverable_ignores_unknown_identity() {
        let alice = service("alice", false);
        let bob = service("bob", false);
        let (alice_tx, _alice_rx) = mpsc::unbounded_channel();
        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        alice.start(alice_tx).await.unwrap();
        bob.start(bob_tx).await.unwrap();

        alice
            .broadcast(Some(&format!("127.0.0.1:{}", bob.local_port().unwrap())))
            .await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(bob_rx.try_recv().is_err());
        assert!(bob.channels().await.is_empty());

        // Once known, the same identity is accepted
        bob.policy().add_known("alice").await;
        assert_eq!(bob.policy().decide("alice", false).await, Acceptance::Known);
        alice
            .broadcast(Some(&format!("127.0.0.1:{}", bob.local_port().unwrap())))
            .await;
        let channel = next_channel(&mut bob_rx).await;
        assert_eq!(channel.device_id(), "alice");

        alice.stop().await;
        bob.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_inbound_connection_gets_no_reply() {
        let bob = service("bob", false);
        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        bob.start(bob_tx).await.unwrap();

        let mut tcp = TcpStream::connect(("127.0.0.1", bob.local_port().unwrap()))
            .await
            .unwrap();
        let stranger = DeviceInfo::with_id("stranger", "stranger", DeviceType::Phone, 1716);
        crate::transport::tls::write_identity(&mut tcp, &stranger)
            .await
            .unwrap();

        // Bob closes without sending anything back
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(
            Duration::from_secs(5),
            tokio::io::AsyncReadExt::read(&mut tcp, &mut buf),
        )
        .await
        .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert!(bob_rx.try_recv().is_err());

        bob.stop().await;
    }
}
