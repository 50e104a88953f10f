//! Hyper-based HTTP transport.

use std::time::Duration;

use hyper::body::Incoming;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::{TokioExecutor, TokioTimer};
use rpcwire_core::Error;
use rustls::ClientConfig;

use super::body::TransportBody;
use super::connector::{build_https_connector, danger_accept_invalid_certs_config};
use crate::classify::classify_transport;
use crate::config::ConfigError;

type HyperClient = Client<HttpsConnector<HttpConnector>, TransportBody>;

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_MAX_IDLE_PER_HOST: usize = 32;

/// HTTP/1.1 and HTTP/2 transport with connection pooling.
///
/// Cleartext HTTP/2 (h2c) is only spoken with [`HyperTransportBuilder::http2_only`];
/// bidirectional streams and gRPC over `http://` need it.
///
/// ```ignore
/// let transport = HyperTransport::builder()
///     .http2_only(true)
///     .pool_idle_timeout(Some(Duration::from_secs(60)))
///     .build()?;
/// ```
#[derive(Clone)]
pub struct HyperTransport {
    client: HyperClient,
    http2_only: bool,
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperTransport")
            .field("http2_only", &self.http2_only)
            .finish_non_exhaustive()
    }
}

impl HyperTransport {
    pub fn builder() -> HyperTransportBuilder {
        HyperTransportBuilder::new()
    }

    pub fn new() -> Result<Self, ConfigError> {
        Self::builder().build()
    }

    /// Issue one request. Failures come back already classified.
    pub async fn request(
        &self,
        request: http::Request<TransportBody>,
    ) -> Result<http::Response<Incoming>, Error> {
        self.client
            .request(request)
            .await
            .map_err(|e| classify_transport(&e))
    }

    pub fn is_http2_only(&self) -> bool {
        self.http2_only
    }
}

/// HTTP/2 PING settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct KeepAlive {
    interval: Duration,
    timeout: Duration,
}

/// Builder for [`HyperTransport`].
#[derive(Debug)]
pub struct HyperTransportBuilder {
    tls: Tls,
    http2_only: bool,
    idle_timeout: Option<Duration>,
    max_idle_per_host: usize,
    keep_alive: Option<KeepAlive>,
}

#[derive(Debug)]
enum Tls {
    Default,
    Custom(ClientConfig),
    AcceptInvalidCerts,
}

impl Default for HyperTransportBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HyperTransportBuilder {
    pub fn new() -> Self {
        Self {
            tls: Tls::Default,
            http2_only: false,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            max_idle_per_host: DEFAULT_MAX_IDLE_PER_HOST,
            keep_alive: None,
        }
    }

    /// Custom roots, client certificates for mTLS and so on.
    pub fn tls_config(mut self, config: ClientConfig) -> Self {
        self.tls = Tls::Custom(config);
        self
    }

    /// Accept any server certificate. Development only; replaces any
    /// custom TLS config.
    pub fn danger_accept_invalid_certs(mut self) -> Self {
        self.tls = Tls::AcceptInvalidCerts;
        self
    }

    /// Speak HTTP/2 without an upgrade or ALPN. Required for h2c.
    pub fn http2_only(mut self, enabled: bool) -> Self {
        self.http2_only = enabled;
        self
    }

    /// How long an idle pooled connection is kept. `None` keeps it forever.
    pub fn pool_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn pool_max_idle_per_host(mut self, max: usize) -> Self {
        self.max_idle_per_host = max;
        self
    }

    /// Ping HTTP/2 connections every `interval`; a ping unanswered after
    /// `timeout` closes the connection.
    pub fn h2_keep_alive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.keep_alive = Some(KeepAlive { interval, timeout });
        self
    }

    pub fn build(self) -> Result<HyperTransport, ConfigError> {
        let connector = build_https_connector(match self.tls {
            Tls::Default => None,
            Tls::Custom(config) => Some(config),
            Tls::AcceptInvalidCerts => Some(danger_accept_invalid_certs_config()?),
        })?;

        let mut builder = Client::builder(TokioExecutor::new());
        builder
            .pool_timer(TokioTimer::new())
            .timer(TokioTimer::new())
            .pool_idle_timeout(self.idle_timeout)
            .pool_max_idle_per_host(self.max_idle_per_host)
            .http2_only(self.http2_only);
        if let Some(keep_alive) = self.keep_alive {
            builder
                .http2_keep_alive_interval(keep_alive.interval)
                .http2_keep_alive_timeout(keep_alive.timeout);
        }
        tracing::debug!(http2_only = self.http2_only, "transport ready");

        Ok(HyperTransport {
            client: builder.build(connector),
            http2_only: self.http2_only,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let builder = HyperTransportBuilder::new();
        assert!(!builder.http2_only);
        assert!(matches!(builder.tls, Tls::Default));
        assert_eq!(builder.max_idle_per_host, DEFAULT_MAX_IDLE_PER_HOST);
        assert_eq!(builder.idle_timeout, Some(Duration::from_secs(90)));
        assert!(builder.keep_alive.is_none());
    }

    #[test]
    fn test_builder_keep_alive_and_idle() {
        let builder = HyperTransportBuilder::new()
            .h2_keep_alive(Duration::from_secs(10), Duration::from_secs(5))
            .pool_idle_timeout(None);
        assert_eq!(
            builder.keep_alive,
            Some(KeepAlive {
                interval: Duration::from_secs(10),
                timeout: Duration::from_secs(5),
            })
        );
        assert!(builder.idle_timeout.is_none());
    }

    #[test]
    fn test_danger_replaces_custom_tls() {
        let builder = HyperTransportBuilder::new().danger_accept_invalid_certs();
        assert!(matches!(builder.tls, Tls::AcceptInvalidCerts));
    }

    #[cfg(any(feature = "tls-ring", feature = "tls-aws-lc"))]
    #[tokio::test]
    async fn test_build_http2_only() {
        let transport = HyperTransportBuilder::new().http2_only(true).build().unwrap();
        assert!(transport.is_http2_only());
    }
}
