//! Authenticated connection to one peer
//!
//! A [`Channel`] is created by a channel service once the cleartext identity
//! exchange and the TLS upgrade have completed. It owns the TLS stream through
//! two tasks:
//!
//! - a writer task, the single ordered send path; every [`Channel::send`]
//!   goes through its queue so packet order is preserved
//! - a reader task that splits the stream into packets and forwards them to
//!   whoever took the incoming stream (the attached device)
//!
//! Closing the channel cancels its token. Both tasks stop, queued sends fail
//! with [`ProtocolError::ChannelClosed`] and so does any later send.

use super::tls::{self, guarded, LocalIdentity, PeerCertificate};
use crate::packet::{read_line, MAX_PACKET_SIZE};
use crate::transfer::Transfer;
use crate::{DeviceInfo, Packet, ProtocolError, Result};
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_openssl::SslStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// URI scheme of LAN channel addresses
pub const LAN_SCHEME: &str = "lan";

/// Handshake and lifecycle states of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// TCP connection being established
    Connecting,
    /// Cleartext identity sent or received
    IdentityExchanged,
    /// TLS complete, waiting for the device to accept the certificate
    Authenticating,
    /// Owned by a device
    Attached,
    /// Terminal
    Closed,
}

/// Settings shared by every channel of one service
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Our identity and TLS contexts
    pub local: LocalIdentity,
    /// Ports probed for payload uploads
    pub transfer_ports: RangeInclusive<u16>,
}

/// Format the address of a LAN channel
pub fn lan_address(host: IpAddr, port: u16) -> String {
    format!("{}://{}", LAN_SCHEME, SocketAddr::new(host, port))
}

struct Outgoing {
    packet: Packet,
    done: oneshot::Sender<Result<()>>,
}

struct ChannelInner {
    identity: DeviceInfo,
    config: ChannelConfig,
    peer_addr: SocketAddr,
    address: String,
    certificate: PeerCertificate,
    allowed: bool,
    token: CancellationToken,
    state: watch::Sender<ChannelState>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<Packet>>>,
}

/// Handle to an authenticated connection
///
/// Cheap to clone; all clones refer to the same connection.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("address", &self.inner.address)
            .field("device_id", &self.inner.identity.device_id)
            .field("state", &self.state())
            .finish()
    }
}

/// An accepted connection whose identity has been read but not yet upgraded
///
/// Lets the service apply its acceptance policy before anything is sent back.
pub struct PendingChannel {
    tcp: TcpStream,
    peer_addr: SocketAddr,
    identity: DeviceInfo,
    token: CancellationToken,
    state: watch::Sender<ChannelState>,
}

impl PendingChannel {
    /// Read the cleartext identity from an accepted connection
    pub async fn read_identity(
        mut tcp: TcpStream,
        peer_addr: SocketAddr,
        token: CancellationToken,
    ) -> Result<Self> {
        let (state, _) = watch::channel(ChannelState::Connecting);
        let identity = guarded(&token, "reading identity", tls::read_identity(&mut tcp)).await?;
        state.send_replace(ChannelState::IdentityExchanged);
        debug!(
            "Identity from {} ({}) at {}",
            identity.device_name, identity.device_id, peer_addr
        );

        Ok(Self {
            tcp,
            peer_addr,
            identity,
            token,
            state,
        })
    }

    /// Identity the peer announced
    pub fn identity(&self) -> &DeviceInfo {
        &self.identity
    }

    /// Address the channel will have once upgraded
    pub fn address(&self) -> String {
        lan_address(self.peer_addr.ip(), self.identity.tcp_port)
    }

    /// Remote socket address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Upgrade to TLS as the client and start the channel
    pub async fn upgrade(self, config: &ChannelConfig, allowed: bool) -> Result<Channel> {
        let Self {
            tcp,
            peer_addr,
            identity,
            token,
            state,
        } = self;

        let (stream, certificate) = guarded(
            &token,
            "TLS handshake",
            tls::upgrade_as_client(tcp, &config.local.tls),
        )
        .await?;
        certificate.verify_owner(&identity.device_id)?;

        Ok(Channel::start(
            stream,
            StartParams {
                identity,
                config: config.clone(),
                peer_addr,
                certificate,
                allowed,
                token,
                state,
            },
        ))
    }
}

struct StartParams {
    identity: DeviceInfo,
    config: ChannelConfig,
    peer_addr: SocketAddr,
    certificate: PeerCertificate,
    allowed: bool,
    token: CancellationToken,
    state: watch::Sender<ChannelState>,
}

impl Channel {
    /// Dial a peer whose identity we already know (from discovery)
    ///
    /// Sends our identity in cleartext and upgrades to TLS as the server.
    pub async fn open(
        config: &ChannelConfig,
        peer_addr: SocketAddr,
        identity: DeviceInfo,
        token: CancellationToken,
        allowed: bool,
    ) -> Result<Channel> {
        let (state, _) = watch::channel(ChannelState::Connecting);
        let mut tcp = guarded(&token, "connecting", async {
            TcpStream::connect(peer_addr)
                .await
                .map_err(|e| ProtocolError::from_io_error(e, "connecting"))
        })
        .await?;
        let _ = tcp.set_nodelay(true);

        guarded(
            &token,
            "sending identity",
            tls::write_identity(&mut tcp, &config.local.info),
        )
        .await?;
        state.send_replace(ChannelState::IdentityExchanged);

        let (stream, certificate) = guarded(
            &token,
            "TLS handshake",
            tls::upgrade_as_server(tcp, &config.local.tls),
        )
        .await?;
        certificate.verify_owner(&identity.device_id)?;

        Ok(Self::start(
            stream,
            StartParams {
                identity,
                config: config.clone(),
                peer_addr,
                certificate,
                allowed,
                token,
                state,
            },
        ))
    }

    /// Accept an incoming connection in one step
    pub async fn accept(
        config: &ChannelConfig,
        tcp: TcpStream,
        token: CancellationToken,
        allowed: bool,
    ) -> Result<Channel> {
        let peer_addr = tcp.peer_addr()?;
        PendingChannel::read_identity(tcp, peer_addr, token)
            .await?
            .upgrade(config, allowed)
            .await
    }

    fn start(stream: SslStream<TcpStream>, params: StartParams) -> Channel {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        params.state.send_replace(ChannelState::Authenticating);

        let address = lan_address(params.peer_addr.ip(), params.identity.tcp_port);
        let channel = Channel {
            inner: Arc::new(ChannelInner {
                identity: params.identity,
                config: params.config,
                peer_addr: params.peer_addr,
                address,
                certificate: params.certificate,
                allowed: params.allowed,
                token: params.token,
                state: params.state,
                outgoing: out_tx,
                incoming: Mutex::new(Some(in_rx)),
            }),
        };

        info!(
            "Channel established with {} at {}",
            channel.inner.identity.device_name, channel.inner.address
        );

        let (reader, writer) = tokio::io::split(stream);
        tokio::spawn(channel.clone().read_loop(reader, in_tx));
        tokio::spawn(channel.clone().write_loop(writer, out_rx));

        channel
    }

    async fn read_loop(
        self,
        reader: ReadHalf<SslStream<TcpStream>>,
        tx: mpsc::UnboundedSender<Packet>,
    ) {
        let mut reader = BufReader::new(reader);
        let token = self.inner.token.clone();

        loop {
            let line = tokio::select! {
                _ = token.cancelled() => break,
                line = read_line(&mut reader, MAX_PACKET_SIZE) => line,
            };

            match line {
                Ok(Some(line)) if line.is_empty() => continue,
                Ok(Some(line)) => match Packet::from_bytes(&line) {
                    Ok(packet) => {
                        debug!(
                            "Received {} from {}",
                            packet.packet_type, self.inner.identity.device_id
                        );
                        // A dropped receiver means nobody is attached any more
                        if tx.send(packet).is_err() {
                            debug!("No receiver for {}, dropping packet", self.inner.address);
                        }
                    }
                    Err(e) => {
                        warn!("Malformed packet from {}: {}", self.inner.address, e);
                        break;
                    }
                },
                Ok(None) => {
                    debug!("Connection to {} closed by peer", self.inner.address);
                    break;
                }
                Err(e) => {
                    debug!("Read from {} failed: {}", self.inner.address, e);
                    break;
                }
            }
        }

        self.close();
    }

    async fn write_loop(
        self,
        mut writer: WriteHalf<SslStream<TcpStream>>,
        mut rx: mpsc::UnboundedReceiver<Outgoing>,
    ) {
        let token = self.inner.token.clone();

        loop {
            let Outgoing { mut packet, done } = tokio::select! {
                _ = token.cancelled() => break,
                next = rx.recv() => match next {
                    Some(next) => next,
                    None => break,
                },
            };

            let result = match packet.to_bytes() {
                Ok(bytes) if bytes.len() > MAX_PACKET_SIZE => Err(
                    ProtocolError::PacketSizeExceeded(bytes.len(), MAX_PACKET_SIZE),
                ),
                Ok(bytes) => write_packet(&mut writer, &bytes).await,
                Err(e) => Err(e),
            };

            let fatal = matches!(result, Err(ProtocolError::Io(_)));
            if let Err(e) = &result {
                warn!(
                    "Failed to send {} to {}: {}",
                    packet.packet_type, self.inner.address, e
                );
            } else {
                debug!("Sent {} to {}", packet.packet_type, self.inner.address);
            }
            let _ = done.send(result);

            if fatal {
                break;
            }
        }

        self.close();
        rx.close();
        let _ = tokio::time::timeout(Duration::from_secs(1), writer.shutdown()).await;
    }

    /// Send a packet; resolves once it has been written
    ///
    /// Packets sent on one channel are written in call order.
    pub async fn send(&self, packet: Packet) -> Result<()> {
        let closed = || ProtocolError::ChannelClosed(self.inner.address.clone());
        if self.is_closed() {
            return Err(closed());
        }

        let (done, rx) = oneshot::channel();
        self.inner
            .outgoing
            .send(Outgoing { packet, done })
            .map_err(|_| closed())?;

        tokio::select! {
            res = rx => res.unwrap_or_else(|_| Err(closed())),
            _ = self.inner.token.cancelled() => Err(closed()),
        }
    }

    /// Take the stream of incoming packets
    ///
    /// Only the first caller gets it; the attached device owns it.
    pub fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<Packet>> {
        self.inner
            .incoming
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
    }

    /// Close the connection; idempotent
    pub fn close(&self) {
        if !self.inner.token.is_cancelled() {
            debug!("Closing channel {}", self.inner.address);
            self.inner.token.cancel();
        }
        self.inner.state.send_replace(ChannelState::Closed);
    }

    /// Wait until the channel is closed
    pub async fn closed(&self) {
        self.inner.token.cancelled().await
    }

    pub(crate) fn mark_attached(&self) {
        self.inner.state.send_if_modified(|state| {
            if *state == ChannelState::Authenticating {
                *state = ChannelState::Attached;
                true
            } else {
                false
            }
        });
    }

    /// Current state
    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    /// True when both handles refer to the same connection
    pub fn ptr_eq(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// True once closed
    pub fn is_closed(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Peer identity
    pub fn identity(&self) -> &DeviceInfo {
        &self.inner.identity
    }

    /// Peer device id
    pub fn device_id(&self) -> &str {
        &self.inner.identity.device_id
    }

    /// Channel address, `lan://host:port`
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Remote socket address of the primary connection
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// Certificate presented by the peer
    pub fn certificate(&self) -> &PeerCertificate {
        &self.inner.certificate
    }

    /// Whether the peer's host had been explicitly targeted
    pub fn is_allowed(&self) -> bool {
        self.inner.allowed
    }

    /// Token cancelled when the channel closes
    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    pub(crate) fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// New transfer bound to this channel
    ///
    /// Closing the channel cancels the transfer.
    pub fn transfer(&self) -> Transfer {
        Transfer::new(self.clone())
    }

    /// Upload `size` bytes from `source` announced by `packet`
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
        self.transfer().upload(packet, source, size, checksum).await
    }

    /// Download the payload referenced by `packet` into `sink`
    pub async fn download<W>(&self, packet: &Packet, sink: W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.transfer().download(packet, sink).await
    }

    /// Decline a payload so the uploader stops waiting
    pub async fn reject_transfer(&self, packet: &Packet) {
        Transfer::reject(self, packet).await
    }
}

async fn write_packet<W>(writer: &mut W, bytes: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CertificateInfo, DeviceType};
    use serde_json::json;
    use tokio::net::TcpListener;

    fn config(id: &str) -> ChannelConfig {
        let cert = CertificateInfo::generate(id).unwrap();
        let info = DeviceInfo::with_id(id, id, DeviceType::Desktop, 1716);
        ChannelConfig {
            local: LocalIdentity::new(info, &cert).unwrap(),
            transfer_ports: 1739..=1764,
        }
    }

    /// Returns (dialer side, acceptor side)
    async fn pair() -> (Channel, Channel) {
        let alice = config("alice");
        let bob = config("bob");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accepted = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            Channel::accept(&bob, tcp, CancellationToken::new(), false)
                .await
                .unwrap()
        });

        let bob_identity = DeviceInfo::with_id("bob", "bob", DeviceType::Desktop, addr.port());
        let dialed = Channel::open(&alice, addr, bob_identity, CancellationToken::new(), true)
            .await
            .unwrap();
        (dialed, accepted.await.unwrap())
    }

    #[tokio::test]
    async fn test_open_and_accept() {
        let (alice_side, bob_side) = pair().await;

        assert_eq!(alice_side.device_id(), "bob");
        assert_eq!(bob_side.device_id(), "alice");
        assert!(alice_side.is_allowed());
        assert!(!bob_side.is_allowed());
        assert_eq!(alice_side.state(), ChannelState::Authenticating);
        assert!(alice_side.address().starts_with("lan://127.0.0.1:"));
        assert_eq!(bob_side.address(), "lan://127.0.0.1:1716");
    }

    #[tokio::test]
    async fn test_packets_arrive_in_order() {
        let (alice_side, bob_side) = pair().await;
        let mut incoming = bob_side.take_incoming().unwrap();
        assert!(bob_side.take_incoming().is_none());

        for n in 0..20 {
            alice_side
                .send(Packet::new("kdeconnect.ping", json!({ "n": n })))
                .await
                .unwrap();
        }
        for n in 0..20 {
            let packet = incoming.recv().await.unwrap();
            assert_eq!(packet.get_body_field::<i64>("n"), Some(n));
        }
    }

    #[tokio::test]
    async fn test_close_fails_sends_and_reaches_peer() {
        let (alice_side, bob_side) = pair().await;
        let mut incoming = bob_side.take_incoming().unwrap();

        alice_side.close();
        assert_eq!(alice_side.state(), ChannelState::Closed);
        assert!(matches!(
            alice_side
                .send(Packet::new("kdeconnect.ping", json!({})))
                .await,
            Err(ProtocolError::ChannelClosed(_))
        ));

        // Peer sees EOF and closes too
        tokio::time::timeout(Duration::from_secs(5), bob_side.closed())
            .await
            .unwrap();
        assert!(incoming.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_attached_state() {
        let (alice_side, _bob_side) = pair().await;
        alice_side.mark_attached();
        assert_eq!(alice_side.state(), ChannelState::Attached);

        alice_side.close();
        alice_side.mark_attached();
        assert_eq!(alice_side.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_identity_certificate_mismatch_is_refused() {
        let alice = config("alice");
        let bob = config("bob");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let _ = Channel::accept(&bob, tcp, CancellationToken::new(), false).await;
        });

        // We expect "carol" but bob's certificate answers
        let claimed = DeviceInfo::with_id("carol", "carol", DeviceType::Desktop, addr.port());
        let result = Channel::open(&alice, addr, claimed, CancellationToken::new(), false).await;
        assert!(matches!(
            result,
            Err(ProtocolError::CertificateValidation(_))
        ));
    }
}
