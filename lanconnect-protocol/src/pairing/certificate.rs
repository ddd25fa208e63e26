//! Long-lived device certificate
//!
//! Each installation owns one self-signed certificate. Its common name is the
//! device id, and its SHA-256 fingerprint is what peers pin once paired.
//!
//! ## Certificate Requirements
//!
//! - **Algorithm**: RSA 2048-bit
//! - **Organization (O)**: "KDE"
//! - **Organizational Unit (OU)**: "Kde connect"
//! - **Common Name (CN)**: Device UUID
//! - **Validity**: 10 years

use crate::identity::generate_device_id;
use crate::{ProtocolError, Result};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509, X509Name};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Certificate validity period (10 years)
const CERT_VALIDITY_YEARS: u32 = 10;

/// Organization name in certificate
const CERT_ORG: &str = "KDE";

/// Organizational unit in certificate
const CERT_ORG_UNIT: &str = "Kde connect";

/// File name of our certificate inside the certificate directory
pub const CERT_FILE_NAME: &str = "certificate.pem";

/// File name of our private key inside the certificate directory
pub const KEY_FILE_NAME: &str = "private.pem";

/// Device certificate information
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// Device ID (certificate common name)
    pub device_id: String,

    /// DER-encoded certificate
    pub certificate: Vec<u8>,

    /// DER-encoded private key
    pub private_key: Vec<u8>,

    /// SHA256 fingerprint of certificate
    pub fingerprint: String,
}

impl CertificateInfo {
    /// Generate a new self-signed certificate for a device
    ///
    /// # Examples
    ///
    /// ```
    /// use lanconnect_protocol::pairing::CertificateInfo;
    ///
    /// let cert_info = CertificateInfo::generate("test_device_id").unwrap();
    /// assert_eq!(cert_info.device_id, "test_device_id");
    /// ```
    pub fn generate(device_id: impl Into<String>) -> Result<Self> {
        let device_id = device_id.into();

        let rsa = Rsa::generate(2048)?;
        let pkey = PKey::from_rsa(rsa)?;

        let mut builder = X509::builder()?;
        builder.set_version(2)?;

        let mut serial = BigNum::new()?;
        serial.rand(159, MsbOption::MAYBE_ZERO, false)?;
        let serial = serial.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;

        let mut name = X509Name::builder()?;
        name.append_entry_by_text("O", CERT_ORG)?;
        name.append_entry_by_text("OU", CERT_ORG_UNIT)?;
        name.append_entry_by_text("CN", &device_id)?;
        let name = name.build();
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;

        let not_before = Asn1Time::days_from_now(0)?;
        let not_after = Asn1Time::days_from_now(CERT_VALIDITY_YEARS * 365)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;

        builder.set_pubkey(&pkey)?;

        // End-entity certificate, not a CA
        builder.append_extension(BasicConstraints::new().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .digital_signature()
                .key_encipherment()
                .key_agreement()
                .build()?,
        )?;

        builder.sign(&pkey, MessageDigest::sha256())?;
        let cert = builder.build();

        let certificate = cert.to_der()?;
        let private_key = pkey.private_key_to_der()?;
        let fingerprint = Self::calculate_fingerprint(&certificate);

        info!(
            "Generated certificate for device {} with fingerprint: {}",
            device_id, fingerprint
        );

        Ok(Self {
            device_id,
            certificate,
            private_key,
            fingerprint,
        })
    }

    /// Load the certificate stored in `dir`, or generate and store a new one
    ///
    /// A freshly generated certificate uses `device_id` when given, otherwise
    /// a random id. An existing certificate always wins: its common name is
    /// the device id from then on.
    pub fn load_or_generate(dir: impl AsRef<Path>, device_id: Option<&str>) -> Result<Self> {
        let dir = dir.as_ref();
        let cert_path = dir.join(CERT_FILE_NAME);
        let key_path = dir.join(KEY_FILE_NAME);

        if cert_path.exists() && key_path.exists() {
            return Self::load_from_files(&cert_path, &key_path);
        }

        let device_id = device_id
            .map(str::to_string)
            .unwrap_or_else(generate_device_id);
        info!("No certificate in {:?}, generating one", dir);
        let cert = Self::generate(device_id)?;
        cert.save_to_files(&cert_path, &key_path)?;
        Ok(cert)
    }

    /// Calculate SHA256 fingerprint of a certificate
    ///
    /// Returns fingerprint in format: XX:XX:XX:...:XX (hex bytes separated by colons)
    pub fn calculate_fingerprint(cert_der: &[u8]) -> String {
        let hash = Sha256::digest(cert_der);

        hash.iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Save certificate and private key to PEM files
    pub fn save_to_files(
        &self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<()> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        for parent in [cert_path.parent(), key_path.parent()].into_iter().flatten() {
            fs::create_dir_all(parent)?;
        }

        fs::write(cert_path, certificate_to_pem(&self.certificate))?;

        let pkey = PKey::private_key_from_der(&self.private_key)?;
        fs::write(key_path, pkey.private_key_to_pem_pkcs8()?)?;
        restrict_permissions(key_path)?;

        info!(
            "Saved certificate to {:?} and private key to {:?}",
            cert_path, key_path
        );

        Ok(())
    }

    /// Load certificate and private key from PEM files
    pub fn load_from_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        debug!("Loading certificate from {:?}", cert_path);

        let cert = X509::from_pem(&fs::read(cert_path)?)?;
        let certificate = cert.to_der()?;

        let pkey = PKey::private_key_from_pem(&fs::read(key_path)?)?;
        let private_key = pkey.private_key_to_der()?;

        let device_id = common_name_of(&cert)?;
        let fingerprint = Self::calculate_fingerprint(&certificate);

        info!(
            "Loaded certificate for device {} with fingerprint: {}",
            device_id, fingerprint
        );

        Ok(Self {
            device_id,
            certificate,
            private_key,
            fingerprint,
        })
    }

    /// PEM encoding of the certificate
    pub fn to_pem(&self) -> String {
        certificate_to_pem(&self.certificate)
    }
}

/// Extract the common name from a DER-encoded certificate
pub fn common_name(cert_der: &[u8]) -> Result<String> {
    let cert = X509::from_der(cert_der)?;
    common_name_of(&cert)
}

fn common_name_of(cert: &X509) -> Result<String> {
    cert.subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .map(|entry| entry.data().to_string())
        .transpose()?
        .ok_or_else(|| {
            ProtocolError::CertificateValidation(
                "Certificate does not contain Common Name".to_string(),
            )
        })
}

/// Encode a DER certificate as PEM for persistence
pub fn certificate_to_pem(cert_der: &[u8]) -> String {
    pem::encode(&pem::Pem::new("CERTIFICATE", cert_der.to_vec()))
}

/// Decode a PEM certificate back to DER
pub fn certificate_from_pem(data: &str) -> Result<Vec<u8>> {
    let parsed = pem::parse(data)
        .map_err(|e| ProtocolError::CertificateValidation(format!("Invalid PEM: {}", e)))?;
    if parsed.tag() != "CERTIFICATE" {
        return Err(ProtocolError::CertificateValidation(format!(
            "Unexpected PEM tag {}",
            parsed.tag()
        )));
    }
    Ok(parsed.into_contents())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_certificate_generation() {
        let cert = CertificateInfo::generate("test_device_123").unwrap();

        assert_eq!(cert.device_id, "test_device_123");
        assert!(!cert.certificate.is_empty());
        assert!(!cert.private_key.is_empty());
        assert_eq!(common_name(&cert.certificate).unwrap(), "test_device_123");
    }

    #[test]
    fn test_fingerprint_format() {
        let cert = CertificateInfo::generate("test").unwrap();
        let parts: Vec<&str> = cert.fingerprint.split(':').collect();

        assert_eq!(parts.len(), 32);
        for part in parts {
            assert_eq!(part.len(), 2);
            assert!(part
                .chars()
                .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));
        }
    }

    #[test]
    fn test_certificate_fingerprint_distinct() {
        let cert1 = CertificateInfo::generate("device1").unwrap();
        let cert2 = CertificateInfo::generate("device2").unwrap();

        assert_ne!(cert1.fingerprint, cert2.fingerprint);
        assert_eq!(
            CertificateInfo::calculate_fingerprint(&cert1.certificate),
            cert1.fingerprint
        );
    }

    #[test]
    fn test_load_or_generate_is_stable() {
        let temp_dir = TempDir::new().unwrap();

        let first = CertificateInfo::load_or_generate(temp_dir.path(), Some("fixed_id")).unwrap();
        assert!(temp_dir.path().join(CERT_FILE_NAME).exists());
        assert!(temp_dir.path().join(KEY_FILE_NAME).exists());

        // The requested id is ignored once a certificate exists
        let second = CertificateInfo::load_or_generate(temp_dir.path(), Some("other")).unwrap();
        assert_eq!(second.device_id, "fixed_id");
        assert_eq!(first.fingerprint, second.fingerprint);
    }

    #[test]
    fn test_load_or_generate_random_id() {
        let temp_dir = TempDir::new().unwrap();
        let cert = CertificateInfo::load_or_generate(temp_dir.path(), None).unwrap();
        assert_eq!(cert.device_id.len(), 36);
    }

    #[test]
    fn test_pem_roundtrip() {
        let cert = CertificateInfo::generate("pem_device").unwrap();
        let pem = cert.to_pem();
        assert!(pem.contains("BEGIN CERTIFICATE"));
        assert_eq!(certificate_from_pem(&pem).unwrap(), cert.certificate);
        assert!(certificate_from_pem("garbage").is_err());
    }
}
