//! TLS configuration for both ends of the tunnel

use crate::{TransportError, TransportResult};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Coordinator-side TLS settings
#[derive(Debug, Clone)]
pub struct ServerTlsConfig {
    /// Server certificate chain (PEM)
    pub cert_path: PathBuf,

    /// Server private key (PEM)
    pub key_path: PathBuf,

    /// CA used to verify agent certificates; setting it enables mutual TLS
    pub client_ca_path: Option<PathBuf>,
}

impl ServerTlsConfig {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            client_ca_path: None,
        }
    }

    /// Require agents to present a certificate signed by `ca_path`
    pub fn with_client_ca(mut self, ca_path: impl Into<PathBuf>) -> Self {
        self.client_ca_path = Some(ca_path.into());
        self
    }

    /// Whether agents must authenticate with a client certificate
    pub fn mutual_auth(&self) -> bool {
        self.client_ca_path.is_some()
    }

    /// Build rustls TlsAcceptor for the tunnel listener
    pub fn build_tls_acceptor(&self) -> TransportResult<tokio_rustls::TlsAcceptor> {
        ensure_crypto_provider();

        let certs = load_certs(&self.cert_path)?;
        let key = load_private_key(&self.key_path)?;

        let builder = rustls::ServerConfig::builder();
        let builder = match &self.client_ca_path {
            Some(ca_path) => {
                let roots = load_root_store(ca_path)?;
                let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
                    .build()
                    .map_err(|e| {
                        TransportError::TlsError(format!("Invalid client verifier: {}", e))
                    })?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };

        let server_crypto = builder
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?;

        Ok(tokio_rustls::TlsAcceptor::from(Arc::new(server_crypto)))
    }
}

/// Agent-side TLS settings
#[derive(Debug, Clone, Default)]
pub struct ClientTlsConfig {
    /// CA that signed the coordinator certificate (web PKI roots if unset)
    pub ca_cert_path: Option<PathBuf>,

    /// Client certificate presented for mutual TLS
    pub client_cert_path: Option<PathBuf>,

    /// Private key matching `client_cert_path`
    pub client_key_path: Option<PathBuf>,

    /// Skip server certificate verification (INSECURE, development only)
    pub insecure_skip_verify: bool,
}

impl ClientTlsConfig {
    /// Build the rustls client configuration used for `wss://` tunnels
    pub fn build_client_config(&self) -> TransportResult<Arc<rustls::ClientConfig>> {
        ensure_crypto_provider();

        let builder = if self.insecure_skip_verify {
            tracing::warn!("Server certificate verification disabled");
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
        } else {
            let roots = match &self.ca_cert_path {
                Some(path) => load_root_store(path)?,
                None => {
                    let mut roots = rustls::RootCertStore::empty();
                    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                    roots
                }
            };
            rustls::ClientConfig::builder().with_root_certificates(roots)
        };

        let client_crypto = match (&self.client_cert_path, &self.client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let certs = load_certs(cert_path)?;
                let key = load_private_key(key_path)?;
                builder.with_client_auth_cert(certs, key).map_err(|e| {
                    TransportError::TlsError(format!("Invalid client cert/key: {}", e))
                })?
            }
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(TransportError::ConfigurationError(
                    "Client certificate and key must be provided together".to_string(),
                ))
            }
        };

        Ok(Arc::new(client_crypto))
    }
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

pub(crate) fn load_certs(path: &Path) -> TransportResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        TransportError::TlsError(format!("Failed to open cert file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse certs: {}", e)))?;

    if certs.is_empty() {
        return Err(TransportError::TlsError(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

pub(crate) fn load_private_key(path: &Path) -> TransportResult<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        TransportError::TlsError(format!("Failed to open key file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::TlsError(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TransportError::TlsError("No private key found".to_string()))
}

fn load_root_store(path: &Path) -> TransportResult<rustls::RootCertStore> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| TransportError::ConfigurationError(format!("Invalid CA cert: {}", e)))?;
    }
    Ok(roots)
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutual_auth_flag() {
        let config = ServerTlsConfig::new("server.crt", "server.key");
        assert!(!config.mutual_auth());

        let config = config.with_client_ca("ca.crt");
        assert!(config.mutual_auth());
    }

    #[test]
    fn test_missing_cert_file() {
        let config = ServerTlsConfig::new("/nonexistent/server.crt", "/nonexistent/server.key");
        assert!(matches!(
            config.build_tls_acceptor(),
            Err(TransportError::TlsError(_))
        ));
    }

    #[test]
    fn test_client_cert_without_key() {
        let config = ClientTlsConfig {
            client_cert_path: Some(PathBuf::from("client.crt")),
            insecure_skip_verify: true,
            ..Default::default()
        };
        assert!(matches!(
            config.build_client_config(),
            Err(TransportError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_client_default_uses_web_roots() {
        let config = ClientTlsConfig::default();
        assert!(config.build_client_config().is_ok());
    }
}
