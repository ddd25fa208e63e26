//! Connection handshake
//!
//! Every connection, primary or transfer, starts the same way:
//!
//! 1. The dialing side writes its identity packet in cleartext
//! 2. The accepting side reads it byte by byte, leaving the TLS ClientHello
//!    unread in the socket
//! 3. The stream is upgraded to TLS with inverted roles: the side that
//!    accepted the TCP connection is the TLS client, the dialer is the TLS
//!    server
//! 4. Both sides extract the peer certificate and compute its fingerprint
//!
//! Every step is bounded by [`HANDSHAKE_TIMEOUT`] and aborts as soon as the
//! supplied cancellation token fires.

use super::tls_config::TlsConfig;
use crate::packet::{read_line, MAX_PACKET_SIZE};
use crate::pairing::common_name;
use crate::{CertificateInfo, DeviceInfo, Packet, ProtocolError, Result};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Upper bound for each handshake step
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// What we present to peers: our identity and the TLS contexts built from
/// our certificate
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    /// Identity packet contents (tcpPort must be the port we accept on)
    pub info: DeviceInfo,
    /// TLS contexts for both roles
    pub tls: Arc<TlsConfig>,
}

impl LocalIdentity {
    /// Build from our identity and certificate
    pub fn new(info: DeviceInfo, certificate: &CertificateInfo) -> Result<Self> {
        Ok(Self {
            info,
            tls: TlsConfig::new(certificate)?,
        })
    }
}

/// Certificate presented by the peer during the TLS handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCertificate {
    /// DER encoding
    pub der: Vec<u8>,
    /// SHA-256 fingerprint, colon separated
    pub fingerprint: String,
}

impl PeerCertificate {
    fn from_stream(stream: &SslStream<TcpStream>) -> Result<Self> {
        let cert = stream.ssl().peer_certificate().ok_or_else(|| {
            ProtocolError::CertificateValidation("Peer presented no certificate".to_string())
        })?;
        let der = cert.to_der()?;
        let fingerprint = CertificateInfo::calculate_fingerprint(&der);
        Ok(Self { der, fingerprint })
    }

    /// Check that the certificate belongs to the announced device id
    pub fn verify_owner(&self, device_id: &str) -> Result<()> {
        let cn = common_name(&self.der)?;
        if cn != device_id {
            return Err(ProtocolError::CertificateValidation(format!(
                "Certificate common name {} does not match device id {}",
                cn, device_id
            )));
        }
        Ok(())
    }
}

/// Run one handshake step under the timeout and the cancellation token
pub async fn guarded<T, F>(token: &CancellationToken, step: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        _ = token.cancelled() => Err(ProtocolError::Cancelled(step.to_string())),
        res = tokio::time::timeout(HANDSHAKE_TIMEOUT, fut) => match res {
            Ok(inner) => inner,
            Err(_) => Err(ProtocolError::Timeout(step.to_string())),
        },
    }
}

/// Write our identity packet in cleartext
pub async fn write_identity<S>(stream: &mut S, identity: &DeviceInfo) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let bytes = identity.to_identity_packet().to_bytes()?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Read the peer's cleartext identity packet
pub async fn read_identity<S>(stream: &mut S) -> Result<DeviceInfo>
where
    S: AsyncRead + Unpin,
{
    let line = read_line(stream, MAX_PACKET_SIZE).await?.ok_or_else(|| {
        ProtocolError::ChannelClosed("Connection closed before identity packet".to_string())
    })?;
    let packet = Packet::from_bytes(&line)?;
    DeviceInfo::from_identity_packet(&packet)
}

/// Upgrade an accepted TCP connection; we are the TLS client
pub async fn upgrade_as_client(
    tcp: TcpStream,
    tls: &TlsConfig,
) -> Result<(SslStream<TcpStream>, PeerCertificate)> {
    let mut stream = SslStream::new(tls.client_ssl()?, tcp)?;
    Pin::new(&mut stream).connect().await?;
    let peer = PeerCertificate::from_stream(&stream)?;
    debug!("TLS client handshake complete, peer {}", peer.fingerprint);
    Ok((stream, peer))
}

/// Upgrade a dialed TCP connection; we are the TLS server
pub async fn upgrade_as_server(
    tcp: TcpStream,
    tls: &TlsConfig,
) -> Result<(SslStream<TcpStream>, PeerCertificate)> {
    let mut stream = SslStream::new(tls.server_ssl()?, tcp)?;
    Pin::new(&mut stream).accept().await?;
    let peer = PeerCertificate::from_stream(&stream)?;
    debug!("TLS server handshake complete, peer {}", peer.fingerprint);
    Ok((stream, peer))
}

/// Full handshake from the dialing side
///
/// Returns the TLS stream and the certificate the peer presented. The peer's
/// identity is already known to the dialer (discovery datagram or transfer
/// owner), so none is read here.
pub async fn dial_handshake(
    tcp: TcpStream,
    local: &LocalIdentity,
    token: &CancellationToken,
) -> Result<(SslStream<TcpStream>, PeerCertificate)> {
    let mut tcp = tcp;
    guarded(token, "sending identity", write_identity(&mut tcp, &local.info)).await?;
    guarded(token, "TLS handshake", upgrade_as_server(tcp, &local.tls)).await
}

/// Full handshake from the accepting side
pub async fn accept_handshake(
    tcp: TcpStream,
    local: &LocalIdentity,
    token: &CancellationToken,
) -> Result<(DeviceInfo, SslStream<TcpStream>, PeerCertificate)> {
    let mut tcp = tcp;
    let identity = guarded(token, "reading identity", read_identity(&mut tcp)).await?;
    let (stream, peer) =
        guarded(token, "TLS handshake", upgrade_as_client(tcp, &local.tls)).await?;
    Ok((identity, stream, peer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeviceType;
    use tokio::net::TcpListener;

    fn local(id: &str) -> (LocalIdentity, CertificateInfo) {
        let cert = CertificateInfo::generate(id).unwrap();
        let info = DeviceInfo::with_id(id, id, DeviceType::Desktop, 1716);
        (LocalIdentity::new(info, &cert).unwrap(), cert)
    }

    #[tokio::test]
    async fn test_handshake_exchanges_certificates() {
        let (alice, alice_cert) = local("alice");
        let (bob, bob_cert) = local("bob");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();

        let accept_token = token.clone();
        let acceptor = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            accept_handshake(tcp, &bob, &accept_token).await.unwrap()
        });

        let tcp = TcpStream::connect(addr).await.unwrap();
        let (_stream, peer_seen_by_alice) = dial_handshake(tcp, &alice, &token).await.unwrap();
        let (identity, _stream, peer_seen_by_bob) = acceptor.await.unwrap();

        assert_eq!(identity.device_id, "alice");
        assert_eq!(peer_seen_by_alice.fingerprint, bob_cert.fingerprint);
        assert_eq!(peer_seen_by_bob.fingerprint, alice_cert.fingerprint);
        assert!(peer_seen_by_bob.verify_owner("alice").is_ok());
        assert!(peer_seen_by_bob.verify_owner("mallory").is_err());
    }

    #[tokio::test]
    async fn test_cancelled_handshake() {
        let (bob, _) = local("bob");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();

        // Connect but never send an identity
        let _silent = TcpStream::connect(addr).await.unwrap();
        let (tcp, _) = listener.accept().await.unwrap();

        token.cancel();
        let result = accept_handshake(tcp, &bob, &token).await;
        assert!(matches!(result, Err(ProtocolError::Cancelled(_))));
    }
}
