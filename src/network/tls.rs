//! Mutual-TLS transport credentials
//!
//! Wraps tokio-rustls with the checks the gossip network needs on every
//! connection, inbound and outbound:
//! - both sides present certificates chained to the configured CA
//! - after the TLS handshake completes and before any application data,
//!   the peer certificate's serial is looked up in the revocation
//!   registry; a revoked serial closes the connection
//! - on success the serial and the remote IP are recorded, so an operator
//!   can later revoke that certificate for all future handshakes
//!
//! Sessions established before a revocation are left alone.

use crate::network::connection::BoxedStream;
use crate::network::netaddress::NetAddress;
use crate::storage::{KvStore, StorageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::server::AllowAnyAuthenticatedClient;
use tokio_rustls::rustls::{self, Certificate, PrivateKey, RootCertStore, ServerName};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Bound on the TLS handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// ALPN protocol offered on both sides
pub const ALPN_PROTOCOL: &[u8] = b"h2";

/// Store key prefix for revocation records
const CERT_PREFIX: &str = "cert/";

/// Longest SPIFFE URI accepted
const SPIFFE_MAX_LEN: usize = 2048;

/// Longest SPIFFE trust domain accepted
const SPIFFE_MAX_HOST_LEN: usize = 255;

/// TLS errors
#[derive(Error, Debug)]
pub enum TlsError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("TLS error: {0}")]
    Rustls(#[from] rustls::Error),
    #[error("No certificate found in {0}")]
    MissingCertificate(String),
    #[error("No private key found in {0}")]
    MissingKey(String),
    #[error("Invalid server name: {0}")]
    InvalidServerName(String),
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),
    #[error("Certificate revoked: {0}")]
    CertificateRevoked(String),
    #[error("TLS handshake timed out")]
    HandshakeTimeout,
}

// =============================================================================
// Revocation registry
// =============================================================================

/// What we know about one certificate serial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertRecord {
    /// Serial number, lowercase hex
    pub serial: String,
    /// Last IP that presented it
    pub ip: String,
    /// Whether handshakes presenting it are refused
    pub revoked: bool,
    /// When it was last seen in a handshake
    pub last_seen: Option<DateTime<Utc>>,
}

/// Certificate serial registry shared by every handshake
#[derive(Default)]
pub struct RevocationRegistry {
    serials: Mutex<HashMap<String, CertRecord>>,
    latest_by_ip: Mutex<HashMap<String, String>>,
}

impl RevocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a serial seen from `ip`, keeping its revoked flag
    pub fn record(&self, serial: &str, ip: &str) {
        if let Ok(mut serials) = self.serials.lock() {
            let record = serials
                .entry(serial.to_string())
                .or_insert_with(|| CertRecord {
                    serial: serial.to_string(),
                    ip: String::new(),
                    revoked: false,
                    last_seen: None,
                });
            record.ip = ip.to_string();
            record.last_seen = Some(Utc::now());
        }
        if let Ok(mut latest) = self.latest_by_ip.lock() {
            latest.insert(ip.to_string(), serial.to_string());
        }
    }

    /// Mark a serial revoked; unknown serials are added
    pub fn revoke(&self, serial: &str) -> bool {
        let Ok(mut serials) = self.serials.lock() else {
            return false;
        };
        let record = serials
            .entry(serial.to_string())
            .or_insert_with(|| CertRecord {
                serial: serial.to_string(),
                ip: String::new(),
                revoked: false,
                last_seen: None,
            });
        let changed = !record.revoked;
        record.revoked = true;
        log::info!("Certificate {} revoked", serial);
        changed
    }

    /// Lift a revocation; returns false if the serial was not revoked
    pub fn restore(&self, serial: &str) -> bool {
        let Ok(mut serials) = self.serials.lock() else {
            return false;
        };
        match serials.get_mut(serial) {
            Some(record) if record.revoked => {
                record.revoked = false;
                log::info!("Certificate {} restored", serial);
                true
            }
            _ => false,
        }
    }

    /// Forget a serial entirely
    pub fn remove(&self, serial: &str) -> bool {
        self.serials
            .lock()
            .map(|mut s| s.remove(serial).is_some())
            .unwrap_or(false)
    }

    pub fn is_revoked(&self, serial: &str) -> bool {
        self.serials
            .lock()
            .map(|s| s.get(serial).map(|r| r.revoked).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Latest serial presented from an IP
    pub fn serial_for_ip(&self, ip: &str) -> Option<String> {
        self.latest_by_ip.lock().ok()?.get(ip).cloned()
    }

    /// All known serials, sorted
    pub fn records(&self) -> Vec<CertRecord> {
        let mut records: Vec<CertRecord> = self
            .serials
            .lock()
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| a.serial.cmp(&b.serial));
        records
    }

    /// Write every record to the store
    pub fn persist(&self, store: &KvStore) -> Result<(), StorageError> {
        store.clear_prefix(CERT_PREFIX)?;
        for record in self.records() {
            store.put(&format!("{}{}", CERT_PREFIX, record.serial), &record)?;
        }
        store.flush()
    }

    /// Load records from the store, skipping corrupt ones
    pub fn load(store: &KvStore) -> Result<Self, StorageError> {
        let registry = Self::new();
        if let Ok(mut serials) = registry.serials.lock() {
            for (_, record) in store.scan_prefix::<CertRecord>(CERT_PREFIX)? {
                serials.insert(record.serial.clone(), record);
            }
        }
        Ok(registry)
    }
}

/// Admission check on a presented certificate serial
pub fn admit_certificate(registry: &RevocationRegistry, serial: &str) -> Result<(), TlsError> {
    if registry.is_revoked(serial) {
        return Err(TlsError::CertificateRevoked(serial.to_string()));
    }
    Ok(())
}

// =============================================================================
// Certificate inspection
// =============================================================================

/// SPIFFE identity carried in a certificate URI SAN
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpiffeId {
    pub trust_domain: String,
    pub path: String,
}

impl std::fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "spiffe://{}{}", self.trust_domain, self.path)
    }
}

/// Parse a `spiffe://trust-domain/path` URI
pub fn parse_spiffe_uri(uri: &str) -> Option<SpiffeId> {
    if uri.len() > SPIFFE_MAX_LEN {
        return None;
    }
    let rest = uri.strip_prefix("spiffe://")?;
    if rest.contains('?') || rest.contains('#') {
        return None;
    }
    let (host, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, ""),
    };
    if host.is_empty() || host.contains('@') || host.len() > SPIFFE_MAX_HOST_LEN {
        return None;
    }
    if path.len() <= 1 {
        return None;
    }
    Some(SpiffeId {
        trust_domain: host.to_string(),
        path: path.to_string(),
    })
}

/// What the handshake learned from the peer certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCertificate {
    /// Serial number, lowercase hex
    pub serial: String,
    /// SPIFFE identity, if the certificate carries exactly one valid URI
    pub spiffe_id: Option<SpiffeId>,
}

/// Extract serial and SPIFFE identity from a DER certificate
pub fn inspect_certificate(der: &[u8]) -> Result<PeerCertificate, TlsError> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;

    let serial = hex::encode(cert.raw_serial());

    let uris: Vec<&str> = match cert.subject_alternative_name() {
        Ok(Some(san)) => san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                x509_parser::extensions::GeneralName::URI(uri) => Some(*uri),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    let spiffe_id = match uris.as_slice() {
        [uri] => parse_spiffe_uri(uri),
        _ => None,
    };

    Ok(PeerCertificate { serial, spiffe_id })
}

// =============================================================================
// Credentials
// =============================================================================

fn read_pem(data: &[u8]) -> Result<Vec<rustls_pemfile::Item>, TlsError> {
    Ok(rustls_pemfile::read_all(&mut BufReader::new(data))?)
}

fn load_certs(data: &[u8], origin: &str) -> Result<Vec<Certificate>, TlsError> {
    let certs: Vec<Certificate> = read_pem(data)?
        .into_iter()
        .filter_map(|item| match item {
            rustls_pemfile::Item::X509Certificate(der) => Some(Certificate(der)),
            _ => None,
        })
        .collect();
    if certs.is_empty() {
        return Err(TlsError::MissingCertificate(origin.to_string()));
    }
    Ok(certs)
}

fn load_key(data: &[u8], origin: &str) -> Result<PrivateKey, TlsError> {
    read_pem(data)?
        .into_iter()
        .find_map(|item| match item {
            rustls_pemfile::Item::PKCS8Key(der)
            | rustls_pemfile::Item::RSAKey(der)
            | rustls_pemfile::Item::ECKey(der) => Some(PrivateKey(der)),
            _ => None,
        })
        .ok_or_else(|| TlsError::MissingKey(origin.to_string()))
}

/// Client and server TLS configuration plus the revocation registry
#[derive(Clone)]
pub struct TlsCredentials {
    connector: TlsConnector,
    acceptor: TlsAcceptor,
    server_name: ServerName,
    registry: Arc<RevocationRegistry>,
}

impl TlsCredentials {
    /// Build credentials from PEM files
    pub fn from_pem_files(
        cert_path: &Path,
        key_path: &Path,
        ca_path: &Path,
        server_name: &str,
        registry: Arc<RevocationRegistry>,
    ) -> Result<Self, TlsError> {
        let cert = fs::read(cert_path)?;
        let key = fs::read(key_path)?;
        let ca = fs::read(ca_path)?;
        Self::from_pem(&cert, &key, &ca, server_name, registry)
    }

    /// Build credentials from PEM data
    pub fn from_pem(
        cert_pem: &[u8],
        key_pem: &[u8],
        ca_pem: &[u8],
        server_name: &str,
        registry: Arc<RevocationRegistry>,
    ) -> Result<Self, TlsError> {
        let certs = load_certs(cert_pem, "certificate")?;
        let key = load_key(key_pem, "private key")?;

        let mut roots = RootCertStore::empty();
        for ca in load_certs(ca_pem, "CA bundle")? {
            roots.add(&ca)?;
        }

        let mut server_config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_client_cert_verifier(AllowAnyAuthenticatedClient::new(roots.clone()).boxed())
            .with_single_cert(certs.clone(), key.clone())?;
        server_config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

        let mut client_config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)?;
        client_config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

        let server_name = ServerName::try_from(server_name)
            .map_err(|_| TlsError::InvalidServerName(server_name.to_string()))?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(client_config)),
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            server_name,
            registry,
        })
    }

    /// Revocation registry consulted on every handshake
    pub fn registry(&self) -> &Arc<RevocationRegistry> {
        &self.registry
    }

    /// Run the client side of the handshake and the revocation check
    pub async fn client_handshake(
        &self,
        stream: TcpStream,
        remote: &NetAddress,
    ) -> Result<(BoxedStream, Option<PeerCertificate>), TlsError> {
        let mut tls = timeout(
            HANDSHAKE_TIMEOUT,
            self.connector.connect(self.server_name.clone(), stream),
        )
        .await
        .map_err(|_| TlsError::HandshakeTimeout)??;

        let presented = tls.get_ref().1.peer_certificates().map(|c| c.to_vec());
        match self.check_peer(presented, remote) {
            Ok(cert) => {
                let stream: BoxedStream = Box::pin(tls);
                Ok((stream, cert))
            }
            Err(e) => {
                let _ = tls.shutdown().await;
                Err(e)
            }
        }
    }

    /// Run the server side of the handshake and the revocation check
    pub async fn server_handshake(
        &self,
        stream: TcpStream,
        remote: &NetAddress,
    ) -> Result<(BoxedStream, Option<PeerCertificate>), TlsError> {
        let mut tls = timeout(HANDSHAKE_TIMEOUT, self.acceptor.accept(stream))
            .await
            .map_err(|_| TlsError::HandshakeTimeout)??;

        let presented = tls.get_ref().1.peer_certificates().map(|c| c.to_vec());
        match self.check_peer(presented, remote) {
            Ok(cert) => {
                let stream: BoxedStream = Box::pin(tls);
                Ok((stream, cert))
            }
            Err(e) => {
                let _ = tls.shutdown().await;
                Err(e)
            }
        }
    }

    fn check_peer(
        &self,
        presented: Option<Vec<Certificate>>,
        remote: &NetAddress,
    ) -> Result<Option<PeerCertificate>, TlsError> {
        let Some(leaf) = presented.as_ref().and_then(|chain| chain.first()) else {
            return Ok(None);
        };

        let cert = inspect_certificate(&leaf.0)?;
        if let Err(e) = admit_certificate(&self.registry, &cert.serial) {
            log::warn!("Refusing {}: {}", remote, e);
            return Err(e);
        }

        self.registry.record(&cert.serial, &remote.ip().to_string());
        Ok(Some(cert))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_record_preserves_revoked_flag() {
        let registry = RevocationRegistry::new();
        registry.record("0a", "10.0.0.1");
        assert!(!registry.is_revoked("0a"));

        assert!(registry.revoke("0a"));
        assert!(!registry.revoke("0a"));
        registry.record("0a", "10.0.0.2");
        assert!(registry.is_revoked("0a"));
        assert_eq!(registry.records()[0].ip, "10.0.0.2");
        assert_eq!(registry.serial_for_ip("10.0.0.2").as_deref(), Some("0a"));
    }

    #[test]
    fn test_revoke_unknown_then_restore() {
        let registry = RevocationRegistry::new();
        assert!(registry.revoke("ff"));
        assert!(admit_certificate(&registry, "ff").is_err());
        assert!(registry.restore("ff"));
        assert!(!registry.restore("ff"));
        assert!(admit_certificate(&registry, "ff").is_ok());
        assert!(registry.remove("ff"));
    }

    #[test]
    fn test_persist_and_load() {
        let dir = tempdir().unwrap();
        let store = KvStore::open(dir.path()).unwrap();
        let registry = RevocationRegistry::new();
        registry.record("01", "1.1.1.1");
        registry.revoke("02");
        registry.persist(&store).unwrap();

        let reopened = KvStore::open(dir.path()).unwrap();
        let loaded = RevocationRegistry::load(&reopened).unwrap();
        assert_eq!(loaded.records().len(), 2);
        assert!(loaded.is_revoked("02"));
        assert!(!loaded.is_revoked("01"));
    }

    #[test]
    fn test_spiffe_parsing() {
        assert_eq!(
            parse_spiffe_uri("spiffe://example.org/node/1"),
            Some(SpiffeId {
                trust_domain: "example.org".into(),
                path: "/node/1".into(),
            })
        );
        assert!(parse_spiffe_uri("https://example.org/node").is_none());
        assert!(parse_spiffe_uri("spiffe://example.org").is_none());
        assert!(parse_spiffe_uri("spiffe://example.org/").is_none());
        assert!(parse_spiffe_uri("spiffe:///path").is_none());
        assert!(parse_spiffe_uri("spiffe://user@example.org/path").is_none());
        assert!(parse_spiffe_uri("spiffe:example.org/path").is_none());
        let long = format!("spiffe://example.org/{}", "a".repeat(SPIFFE_MAX_LEN));
        assert!(parse_spiffe_uri(&long).is_none());
    }

    #[test]
    fn test_inspect_generated_certificate() {
        let mut params = rcgen::CertificateParams::new(vec!["node.gossip".to_string()]);
        params.serial_number = Some(rcgen::SerialNumber::from(vec![0x12, 0x34]));
        params
            .subject_alt_names
            .push(rcgen::SanType::URI("spiffe://gossip/node/a".to_string()));
        let cert = rcgen::Certificate::from_params(params).unwrap();

        let info = inspect_certificate(&cert.serialize_der().unwrap()).unwrap();
        assert_eq!(info.serial, "1234");
        assert_eq!(info.spiffe_id.unwrap().path, "/node/a");
    }

    #[test]
    fn test_credentials_require_material() {
        let registry = Arc::new(RevocationRegistry::new());
        assert!(matches!(
            TlsCredentials::from_pem(b"", b"", b"", "node.gossip", registry),
            Err(TlsError::MissingCertificate(_))
        ));
    }
}
