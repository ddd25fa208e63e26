//! Payload Transfer
//!
//! Binary payloads never travel over the packet channel. Each one gets its
//! own TCP connection:
//!
//! 1. The uploader binds the first free port in the transfer range
//! 2. It sends the announcing packet over the channel with `payloadSize`,
//!    `payloadTransferInfo.port` and, when known, `body.payloadHash`
//! 3. The downloader dials that port and sends its identity in cleartext
//! 4. TLS is negotiated; the downloader is the TLS client
//! 5. Both sides check the peer certificate against the one pinned by the
//!    owning channel
//! 6. Raw bytes flow until `payloadSize` is reached, then the uploader closes
//!
//! A transfer succeeds only if exactly `payloadSize` bytes moved. Partial
//! output is left in place for the caller to deal with.

use crate::packet::Packet;
use crate::transport::tls::{self, guarded};
use crate::transport::Channel;
use crate::{ProtocolError, Result};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default transfer port range
pub const TRANSFER_PORT_RANGE: RangeInclusive<u16> = 1739..=1764;

/// How long an uploader waits for the downloader to connect
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest pause tolerated between two chunks
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Buffer size for streaming (64KB)
const BUFFER_SIZE: usize = 65536;

/// Body field carrying the payload checksum
pub const PAYLOAD_HASH_FIELD: &str = "payloadHash";

/// Lifecycle of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Created, waiting for the peer
    Pending,
    /// Handshake done, bytes flowing
    Transferring,
    /// Exactly the declared number of bytes moved
    Completed,
    /// Transport, authentication or integrity failure
    Failed,
    /// Cancelled through the token
    Cancelled,
}

impl TransferState {
    /// True for Completed, Failed and Cancelled
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed | TransferState::Cancelled
        )
    }
}

struct TransferInner {
    id: String,
    channel: Channel,
    token: CancellationToken,
    state: watch::Sender<TransferState>,
    started: AtomicBool,
    transferred: AtomicU64,
}

/// One-shot payload transfer bound to a channel
///
/// Cheap to clone; a clone can be kept to cancel or observe a transfer that
/// is running elsewhere. Closing the owning channel cancels the transfer.
#[derive(Clone)]
pub struct Transfer {
    inner: Arc<TransferInner>,
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("transferred", &self.transferred())
            .finish()
    }
}

impl Transfer {
    pub(crate) fn new(channel: Channel) -> Self {
        let token = channel.token().child_token();
        let (state, _) = watch::channel(TransferState::Pending);
        Self {
            inner: Arc::new(TransferInner {
                id: Uuid::new_v4().to_string(),
                channel,
                token,
                state,
                started: AtomicBool::new(false),
                transferred: AtomicU64::new(0),
            }),
        }
    }

    /// Unique id of this transfer
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Current state
    pub fn state(&self) -> TransferState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions
    pub fn watch_state(&self) -> watch::Receiver<TransferState> {
        self.inner.state.subscribe()
    }

    /// Bytes moved so far
    pub fn transferred(&self) -> u64 {
        self.inner.transferred.load(Ordering::Relaxed)
    }

    /// Abort the transfer and release its socket
    pub fn cancel(&self) {
        self.inner.token.cancel();
    }

    /// Offer `size` bytes from `source` to the peer
    ///
    /// `packet` is sent over the channel once a port is bound, with the
    /// payload fields filled in. Returns the number of bytes sent.
    pub async fn upload<R>(
        &self,
        packet: Packet,
        mut source: R,
        size: u64,
        checksum: Option<String>,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.begin()?;
        let result = self.run_upload(packet, &mut source, size, checksum).await;
        self.finish(result)
    }

    /// Fetch the payload announced by `packet` into `sink`
    ///
    /// Returns the number of bytes received.
    pub async fn download<W>(&self, packet: &Packet, mut sink: W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.begin()?;
        let result = self.run_download(packet, &mut sink).await;
        self.finish(result)
    }

    /// Connect to the advertised port and hang up immediately
    ///
    /// The uploader sees the connection end and stops waiting.
    pub(crate) async fn reject(channel: &Channel, packet: &Packet) {
        if !packet.has_payload() {
            return;
        }
        let Some(port) = packet.payload_port() else {
            return;
        };

        let addr = SocketAddr::new(channel.peer_addr().ip(), port);
        match timeout(Duration::from_secs(5), TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                debug!("Rejected transfer from {}", addr);
                drop(stream);
            }
            Ok(Err(e)) => debug!("Could not reach {} to reject transfer: {}", addr, e),
            Err(_) => debug!("Timed out rejecting transfer at {}", addr),
        }
    }

    fn begin(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(ProtocolError::InvalidPacket(format!(
                "Transfer {} already used",
                self.inner.id
            )));
        }
        if self.inner.token.is_cancelled() {
            self.inner.state.send_replace(TransferState::Cancelled);
            return Err(ProtocolError::Cancelled("transfer".to_string()));
        }
        Ok(())
    }

    fn finish(&self, result: Result<u64>) -> Result<u64> {
        let state = match &result {
            Ok(_) => TransferState::Completed,
            Err(ProtocolError::Cancelled(_)) => TransferState::Cancelled,
            Err(_) => TransferState::Failed,
        };
        match &result {
            Ok(n) => info!("Transfer {} completed ({} bytes)", self.inner.id, n),
            Err(e) => warn!("Transfer {} ended as {:?}: {}", self.inner.id, state, e),
        }
        self.inner.state.send_replace(state);
        result
    }

    async fn run_upload<R>(
        &self,
        mut packet: Packet,
        source: &mut R,
        size: u64,
        checksum: Option<String>,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let channel = &self.inner.channel;
        let token = &self.inner.token;
        let (listener, port) = bind_transfer_listener(&channel.config().transfer_ports).await?;

        let declared = i64::try_from(size).map_err(|_| {
            ProtocolError::InvalidPacket(format!("Payload too large: {} bytes", size))
        })?;
        let mut info = HashMap::new();
        info.insert("port".to_string(), json!(port));
        packet.payload_size = Some(declared);
        packet.payload_transfer_info = Some(info);
        if let (Some(hash), Value::Object(body)) = (checksum, &mut packet.body) {
            body.insert(PAYLOAD_HASH_FIELD.to_string(), Value::String(hash));
        }
        channel.send(packet).await?;

        let (mut tcp, remote) = tokio::select! {
            _ = token.cancelled() => return Err(ProtocolError::Cancelled("waiting for downloader".to_string())),
            accepted = timeout(ACCEPT_TIMEOUT, listener.accept()) => match accepted {
                Ok(Ok(accepted)) => accepted,
                Ok(Err(e)) => return Err(ProtocolError::from_io_error(e, "accepting downloader")),
                Err(_) => return Err(ProtocolError::Timeout("waiting for downloader".to_string())),
            },
        };
        drop(listener);
        debug!("Transfer {} accepted {} on port {}", self.inner.id, remote, port);

        let identity = guarded(token, "reading identity", tls::read_identity(&mut tcp)).await?;
        if identity.device_id != channel.device_id() {
            return Err(ProtocolError::CertificateValidation(format!(
                "Transfer peer {} is not {}",
                identity.device_id,
                channel.device_id()
            )));
        }
        let (mut stream, peer) = guarded(
            token,
            "TLS handshake",
            tls::upgrade_as_server(tcp, &channel.config().local.tls),
        )
        .await?;
        self.check_peer(&peer.fingerprint)?;

        self.inner.state.send_replace(TransferState::Transferring);
        let sent = self.splice(source, &mut stream, size, None, false).await;
        let _ = timeout(Duration::from_secs(1), stream.shutdown()).await;
        let sent = sent?;

        if sent != size {
            return Err(ProtocolError::TransferIncomplete {
                transferred: sent,
                expected: size,
            });
        }
        Ok(sent)
    }

    async fn run_download<W>(&self, packet: &Packet, sink: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let channel = &self.inner.channel;
        let token = &self.inner.token;

        if !packet.has_payload() {
            return Err(ProtocolError::InvalidPacket(format!(
                "{} carries no payload",
                packet.packet_type
            )));
        }
        let port = packet
            .payload_port()
            .ok_or_else(|| ProtocolError::InvalidPacket("Missing payload port".to_string()))?;
        let size = packet
            .payload_size
            .and_then(|s| u64::try_from(s).ok())
            .ok_or_else(|| ProtocolError::InvalidPacket("Invalid payloadSize".to_string()))?;
        let expected_hash = packet.get_body_field::<String>(PAYLOAD_HASH_FIELD);

        let addr = SocketAddr::new(channel.peer_addr().ip(), port);
        let mut tcp = guarded(token, "connecting", async {
            TcpStream::connect(addr)
                .await
                .map_err(|e| ProtocolError::from_io_error(e, "connecting to uploader"))
        })
        .await?;
        guarded(
            token,
            "sending identity",
            tls::write_identity(&mut tcp, &channel.config().local.info),
        )
        .await?;
        let (mut stream, peer) = guarded(
            token,
            "TLS handshake",
            tls::upgrade_as_client(tcp, &channel.config().local.tls),
        )
        .await?;
        self.check_peer(&peer.fingerprint)?;

        self.inner.state.send_replace(TransferState::Transferring);
        let mut hasher = expected_hash.as_ref().map(|_| Sha256::new());
        let received = self
            .splice(&mut stream, sink, size, hasher.as_mut(), true)
            .await?;

        if received < size {
            return Err(ProtocolError::TransferIncomplete {
                transferred: received,
                expected: size,
            });
        }

        if let (Some(expected), Some(hasher)) = (expected_hash, hasher) {
            let actual = hex::encode(hasher.finalize());
            if !actual.eq_ignore_ascii_case(&expected) {
                return Err(ProtocolError::ChecksumMismatch { expected, actual });
            }
        }
        Ok(received)
    }

    fn check_peer(&self, fingerprint: &str) -> Result<()> {
        let expected = &self.inner.channel.certificate().fingerprint;
        if fingerprint != expected {
            return Err(ProtocolError::CertificateValidation(
                "Transfer peer presented a different certificate".to_string(),
            ));
        }
        Ok(())
    }

    /// Copy at most `limit` bytes, honouring cancellation
    ///
    /// With `network_source`, a read error ends the copy like EOF would; the
    /// byte count check decides the outcome.
    async fn splice<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        limit: u64,
        mut hasher: Option<&mut Sha256>,
        network_source: bool,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut total = 0u64;

        while total < limit {
            let want = usize::try_from(limit - total)
                .unwrap_or(BUFFER_SIZE)
                .min(BUFFER_SIZE);

            let read = tokio::select! {
                _ = self.inner.token.cancelled() => {
                    return Err(ProtocolError::Cancelled("transfer".to_string()));
                }
                read = timeout(IDLE_TIMEOUT, reader.read(&mut buffer[..want])) => read,
            };
            let n = match read {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
                Ok(Err(e)) if network_source => {
                    debug!("Transfer {} read ended: {}", self.inner.id, e);
                    break;
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(ProtocolError::Timeout("transfer stalled".to_string())),
            };

            tokio::select! {
                _ = self.inner.token.cancelled() => {
                    return Err(ProtocolError::Cancelled("transfer".to_string()));
                }
                written = writer.write_all(&buffer[..n]) => written?,
            }
            if let Some(hasher) = hasher.as_deref_mut() {
                hasher.update(&buffer[..n]);
            }
            total += n as u64;
            self.inner.transferred.store(total, Ordering::Relaxed);
        }

        writer.flush().await?;
        Ok(total)
    }
}

/// Bind the first free port of `ports`
///
/// Ports are probed sequentially without reservation, so a concurrent
/// transfer taking a port just means trying the next one.
pub async fn bind_transfer_listener(ports: &RangeInclusive<u16>) -> Result<(TcpListener, u16)> {
    for port in ports.clone() {
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => {
                let port = listener.local_addr()?.port();
                debug!("Transfer listener bound on port {}", port);
                return Ok((listener, port));
            }
            Err(e) => debug!("Transfer port {} unavailable: {}", port, e),
        }
    }

    Err(ProtocolError::NetworkError(format!(
        "No free transfer port in {}-{}",
        ports.start(),
        ports.end()
    )))
}

/// SHA-256 of `data`, lowercase hex, as carried in `payloadHash`
pub fn payload_checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
