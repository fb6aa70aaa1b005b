//! rustls configuration for pinned, self-signed peer certificates.
//!
//! Peers present self-signed certificates, so chain and hostname checks are
//! replaced by a fingerprint pin. The verifier remembers what it saw so the
//! round can pin it on first contact.

use std::sync::{Arc, Mutex, PoisonError};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};

use crate::error::{Error, Result};
use crate::identity::{check_pinned, DeviceIdentity, Fingerprint};

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Accepts any well-formed server certificate whose fingerprint matches the pin.
///
/// Without a pin every certificate is accepted and recorded (trust on first use).
#[derive(Debug)]
pub struct PinnedCertVerifier {
    peer_id: String,
    pinned: Option<Fingerprint>,
    presented: Mutex<Option<Fingerprint>>,
    provider: Arc<CryptoProvider>,
}

impl PinnedCertVerifier {
    pub fn new(peer_id: impl Into<String>, pinned: Option<Fingerprint>) -> Self {
        Self {
            peer_id: peer_id.into(),
            pinned,
            presented: Mutex::new(None),
            provider: crypto_provider(),
        }
    }

    /// Fingerprint of the last certificate the server presented.
    pub fn presented(&self) -> Option<Fingerprint> {
        self.presented
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The pin mismatch seen during the handshake, if any.
    pub fn violation(&self) -> Option<Error> {
        let presented = self.presented()?;
        check_pinned(&self.peer_id, self.pinned.as_ref(), &presented).err()
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let presented = Fingerprint::of_der(end_entity.as_ref());
        *self
            .presented
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(presented.clone());

        check_pinned(&self.peer_id, self.pinned.as_ref(), &presented)
            .map_err(|error| rustls::Error::General(error.to_string()))?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Client configuration that verifies servers only through `verifier`.
pub fn client_config(verifier: Arc<PinnedCertVerifier>) -> Result<ClientConfig> {
    let config = ClientConfig::builder_with_provider(verifier.provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|error| Error::Transport(format!("TLS client setup failed: {error}")))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Ok(config)
}

/// Server configuration presenting this device's certificate.
pub fn server_config(identity: &DeviceIdentity) -> Result<ServerConfig> {
    let certificate = CertificateDer::from_pem_slice(identity.certificate_pem().as_bytes())
        .map_err(|error| Error::Identity(format!("invalid device certificate: {error}")))?;
    let key = PrivateKeyDer::from_pem_slice(identity.private_key_pem().as_bytes())
        .map_err(|error| Error::Identity(format!("invalid device key: {error}")))?;

    let mut config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|error| Error::Identity(format!("TLS server setup failed: {error}")))?
        .with_no_client_auth()
        .with_single_cert(vec![certificate], key)
        .map_err(|error| Error::Identity(format!("TLS server setup failed: {error}")))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn der(identity: &DeviceIdentity) -> CertificateDer<'static> {
        CertificateDer::from_pem_slice(identity.certificate_pem().as_bytes()).unwrap()
    }

    fn verify(verifier: &PinnedCertVerifier, cert: &CertificateDer<'_>) -> bool {
        let name = ServerName::try_from("localhost").unwrap();
        verifier
            .verify_server_cert(cert, &[], &name, &[], UnixTime::now())
            .is_ok()
    }

    #[test]
    fn unpinned_verifier_accepts_and_records() {
        let identity = DeviceIdentity::ephemeral("server").unwrap();
        let verifier = PinnedCertVerifier::new("peer", None);

        assert!(verify(&verifier, &der(&identity)));
        assert_eq!(verifier.presented().as_ref(), Some(identity.fingerprint()));
        assert!(verifier.violation().is_none());
    }

    #[test]
    fn pinned_verifier_rejects_other_certificates() {
        let trusted = DeviceIdentity::ephemeral("trusted").unwrap();
        let impostor = DeviceIdentity::ephemeral("impostor").unwrap();
        let verifier = PinnedCertVerifier::new("peer", Some(trusted.fingerprint().clone()));

        assert!(verify(&verifier, &der(&trusted)));
        assert!(!verify(&verifier, &der(&impostor)));
        assert!(matches!(
            verifier.violation(),
            Some(Error::TrustViolation { .. })
        ));
    }

    #[test]
    fn configs_build_from_identity() {
        let identity = DeviceIdentity::ephemeral("device").unwrap();
        let server = server_config(&identity).unwrap();
        assert_eq!(server.alpn_protocols, vec![b"http/1.1".to_vec()]);

        let verifier = Arc::new(PinnedCertVerifier::new("peer", None));
        assert!(client_config(verifier).is_ok());
    }
}
