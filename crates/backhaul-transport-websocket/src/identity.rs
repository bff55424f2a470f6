//! Transport-verified peer identity
//!
//! Under mutual TLS the coordinator learns who the agent is from the client
//! certificate before any application message is read. The claimed identity
//! only shows up later, in the `register` message, so this module just
//! extracts and carries the verified name; the comparison happens in the
//! tunnel handler.

use crate::{TransportError, TransportResult};
use rustls::pki_types::CertificateDer;
use x509_parser::prelude::*;

/// What the transport knows about the remote end of a tunnel
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerIdentity {
    /// Connection is TLS-encrypted
    pub secure: bool,

    /// Client presented a certificate that chained to the configured CA
    pub mutual_auth: bool,

    /// Subject Common Name of the verified client certificate
    pub verified_id: Option<String>,
}

impl PeerIdentity {
    /// Plain `ws://` connection
    pub fn plaintext() -> Self {
        Self::default()
    }

    /// TLS without client authentication
    pub fn tls() -> Self {
        Self {
            secure: true,
            ..Self::default()
        }
    }

    /// TLS with a verified client certificate
    pub fn mutual(verified_id: impl Into<String>) -> Self {
        Self {
            secure: true,
            mutual_auth: true,
            verified_id: Some(verified_id.into()),
        }
    }

    /// Check a claimed identity against the verified one
    ///
    /// Without mutual TLS any claim is accepted.
    pub fn permits(&self, claimed: &str) -> bool {
        if !self.mutual_auth {
            return true;
        }
        self.verified_id.as_deref() == Some(claimed)
    }
}

/// Extract the identity from the leaf of a verified peer certificate chain
///
/// The identity is the first subject Common Name. A chain without a leaf, a
/// certificate that does not parse, or a missing/blank CN are all refusals.
pub fn identity_from_certificate(
    peer_certificates: Option<&[CertificateDer<'_>]>,
) -> TransportResult<String> {
    let leaf = peer_certificates
        .and_then(|certs| certs.first())
        .ok_or_else(|| {
            TransportError::AuthenticationFailed("No client certificate presented".to_string())
        })?;

    let (_, cert) = X509Certificate::from_der(leaf.as_ref()).map_err(|e| {
        TransportError::AuthenticationFailed(format!("Malformed client certificate: {}", e))
    })?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::trim)
        .filter(|cn| !cn.is_empty())
        .ok_or_else(|| {
            TransportError::AuthenticationFailed(
                "Client certificate has no usable subject CN".to_string(),
            )
        })?;

    Ok(common_name.to_string())
}
