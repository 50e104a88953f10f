//! TLS connector setup for the hyper client.
//!
//! TLS needs both a crypto provider and root certificates:
//!
//! - **Crypto providers**: `tls-ring` (default with `tls`) or `tls-aws-lc`.
//!   Without either, a provider installed with
//!   `CryptoProvider::install_default()` is used.
//! - **Root certificates**: `tls-native-roots` (default with `tls`) or
//!   `tls-webpki-roots`.
//!
//! Plain `http://` URLs never touch TLS, so cleartext test servers work with
//! any feature set that can build a config.

use std::sync::Arc;

use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};

use crate::config::ConfigError;

/// True if both a crypto provider and root certificates are compiled in.
#[inline]
pub const fn has_tls_support() -> bool {
    cfg!(any(feature = "tls-ring", feature = "tls-aws-lc"))
        && cfg!(any(
            feature = "tls-native-roots",
            feature = "tls-webpki-roots"
        ))
}

fn provider() -> Option<Arc<CryptoProvider>> {
    #[cfg(feature = "tls-ring")]
    return Some(Arc::new(rustls::crypto::ring::default_provider()));

    #[cfg(all(feature = "tls-aws-lc", not(feature = "tls-ring")))]
    return Some(Arc::new(rustls::crypto::aws_lc_rs::default_provider()));

    #[cfg(not(any(feature = "tls-ring", feature = "tls-aws-lc")))]
    rustls::crypto::CryptoProvider::get_default().cloned()
}

fn provider_builder(
    provider: Arc<CryptoProvider>,
) -> Result<rustls::ConfigBuilder<ClientConfig, rustls::WantsVerifier>, ConfigError> {
    Ok(ClientConfig::builder_with_provider(provider).with_safe_default_protocol_versions()?)
}

/// Root certificates from the enabled features. Empty when none are enabled.
fn build_root_store() -> rustls::RootCertStore {
    #[allow(unused_mut)]
    let mut roots = rustls::RootCertStore::empty();

    #[cfg(feature = "tls-native-roots")]
    {
        let native_certs = rustls_native_certs::load_native_certs();
        if !native_certs.errors.is_empty() {
            tracing::debug!("errors loading native certs: {:?}", native_certs.errors);
        }
        roots.add_parsable_certificates(native_certs.certs);
    }

    #[cfg(all(feature = "tls-webpki-roots", not(feature = "tls-native-roots")))]
    {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    roots
}

/// The default TLS configuration from the enabled features.
pub fn default_tls_config() -> Result<ClientConfig, ConfigError> {
    let provider = provider().ok_or(ConfigError::NoCryptoProvider)?;
    Ok(provider_builder(provider)?
        .with_root_certificates(build_root_store())
        .with_no_client_auth())
}

/// Build an HTTPS-or-HTTP connector speaking both HTTP versions.
pub fn build_https_connector(
    tls_config: Option<ClientConfig>,
) -> Result<HttpsConnector<HttpConnector>, ConfigError> {
    let config = match tls_config {
        Some(config) => config,
        None => default_tls_config()?,
    };
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_nodelay(true);
    Ok(HttpsConnectorBuilder::new()
        .with_tls_config(config)
        .https_or_http()
        .enable_all_versions()
        .wrap_connector(http))
}

/// Accepts any server certificate but still checks handshake signatures
/// with the provider's algorithms. Development only.
#[derive(Debug)]
pub struct DangerousAcceptAnyCertVerifier {
    provider: Arc<CryptoProvider>,
}

impl DangerousAcceptAnyCertVerifier {
    pub fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for DangerousAcceptAnyCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// A TLS configuration that skips certificate verification.
pub fn danger_accept_invalid_certs_config() -> Result<ClientConfig, ConfigError> {
    let provider = provider().ok_or(ConfigError::NoCryptoProvider)?;
    let verifier = Arc::new(DangerousAcceptAnyCertVerifier::new(provider.clone()));
    Ok(provider_builder(provider)?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(any(feature = "tls-ring", feature = "tls-aws-lc"))]
    #[test]
    fn test_default_tls_config_without_alpn() {
        let config = default_tls_config().expect("provider compiled in");
        assert!(config.alpn_protocols.is_empty());
    }

    #[cfg(any(feature = "tls-ring", feature = "tls-aws-lc"))]
    #[test]
    fn test_build_https_connector_default() {
        assert!(build_https_connector(None).is_ok());
        assert!(danger_accept_invalid_certs_config().is_ok());
    }

    #[cfg(feature = "tls-ring")]
    #[test]
    fn test_danger_verifier_uses_provider_schemes() {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verifier = DangerousAcceptAnyCertVerifier::new(provider.clone());
        assert_eq!(
            verifier.supported_verify_schemes(),
            provider.signature_verification_algorithms.supported_schemes()
        );
    }

    #[cfg(all(feature = "tls-ring", feature = "tls-native-roots"))]
    #[test]
    fn test_has_tls_support() {
        assert!(has_tls_support());
    }
}
