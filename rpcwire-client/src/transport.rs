//! HTTP transport: a pooled hyper client with rustls.
//!
//! Feature flags:
//!
//! - `tls` (default) enables `tls-ring` + `tls-native-roots`
//! - `tls-ring` / `tls-aws-lc` select the crypto provider
//! - `tls-native-roots` / `tls-webpki-roots` select root certificates

mod body;
mod connector;
mod hyper;

pub use body::TransportBody;
pub use connector::{
    DangerousAcceptAnyCertVerifier, build_https_connector, danger_accept_invalid_certs_config,
    default_tls_config, has_tls_support,
};
pub use hyper::{HyperTransport, HyperTransportBuilder};

pub use rustls::ClientConfig as TlsClientConfig;
