//! TLS configuration
//!
//! Both directions of a connection present our long-lived certificate and
//! request the peer's. No CA is involved: any certificate is accepted during
//! the handshake and trust is decided afterwards by fingerprint.
//!
//! Uses OpenSSL directly to keep TLS 1.0 available for older Android peers.

use crate::{CertificateInfo, ProtocolError, Result};
use openssl::pkey::PKey;
use openssl::ssl::{
    Ssl, SslAcceptor, SslAcceptorBuilder, SslConnector, SslConnectorBuilder, SslContextBuilder,
    SslMethod, SslVerifyMode, SslVersion,
};
use openssl::x509::X509;
use std::sync::Arc;
use tracing::debug;

/// Cipher suites accepted by KDE Connect peers (v1.4+)
///
/// ECDHE-RSA-AES128-SHA is needed by TLS 1.0 Android peers and only exists at
/// security level 1.
const CIPHER_LIST: &str =
    "ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-SHA:@SECLEVEL=1";

/// Prepared TLS contexts for both handshake roles
pub struct TlsConfig {
    acceptor: SslAcceptor,
    connector: SslConnector,
    fingerprint: String,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl TlsConfig {
    /// Build server and client contexts around our certificate
    pub fn new(our_cert: &CertificateInfo) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            acceptor: create_server_config(our_cert)?,
            connector: create_client_config(our_cert)?,
            fingerprint: our_cert.fingerprint.clone(),
        }))
    }

    /// Fingerprint of the certificate we present
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// A fresh session for the TLS server role
    pub fn server_ssl(&self) -> Result<Ssl> {
        Ok(Ssl::new(self.acceptor.context())?)
    }

    /// A fresh session for the TLS client role
    pub fn client_ssl(&self) -> Result<Ssl> {
        Ok(Ssl::new(self.connector.context())?)
    }
}

fn create_server_config(our_cert: &CertificateInfo) -> Result<SslAcceptor> {
    debug!("Creating TLS server config");

    let mut builder: SslAcceptorBuilder =
        SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server()).map_err(|e| {
            ProtocolError::CertificateValidation(format!("Failed to create SSL acceptor: {}", e))
        })?;

    configure(&mut builder, our_cert)?;
    // Require a client certificate so its fingerprint can be checked
    builder.set_verify_callback(
        SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
        |_, _| true,
    );

    Ok(builder.build())
}

fn create_client_config(our_cert: &CertificateInfo) -> Result<SslConnector> {
    debug!("Creating TLS client config");

    let mut builder: SslConnectorBuilder =
        SslConnector::builder(SslMethod::tls_client()).map_err(|e| {
            ProtocolError::CertificateValidation(format!("Failed to create SSL connector: {}", e))
        })?;

    configure(&mut builder, our_cert)?;
    builder.set_verify_callback(SslVerifyMode::PEER, |_, _| true);

    Ok(builder.build())
}

fn configure(builder: &mut SslContextBuilder, our_cert: &CertificateInfo) -> Result<()> {
    builder
        .set_min_proto_version(Some(SslVersion::TLS1))
        .map_err(|e| {
            ProtocolError::CertificateValidation(format!("Failed to set min TLS version: {}", e))
        })?;
    builder
        .set_max_proto_version(Some(SslVersion::TLS1_3))
        .map_err(|e| {
            ProtocolError::CertificateValidation(format!("Failed to set max TLS version: {}", e))
        })?;
    builder.set_cipher_list(CIPHER_LIST).map_err(|e| {
        ProtocolError::CertificateValidation(format!("Failed to set cipher list: {}", e))
    })?;

    let cert = X509::from_der(&our_cert.certificate).map_err(|e| {
        ProtocolError::CertificateValidation(format!("Failed to parse certificate: {}", e))
    })?;
    let pkey = PKey::private_key_from_der(&our_cert.private_key).map_err(|e| {
        ProtocolError::CertificateValidation(format!("Failed to parse private key: {}", e))
    })?;

    builder.set_certificate(&cert).map_err(|e| {
        ProtocolError::CertificateValidation(format!("Failed to set certificate: {}", e))
    })?;
    builder.set_private_key(&pkey).map_err(|e| {
        ProtocolError::CertificateValidation(format!("Failed to set private key: {}", e))
    })?;

    Ok(())
}
