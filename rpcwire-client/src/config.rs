//! Client call configuration.

use rpcwire_core::{Codec, CompressionPools, Protocol};

/// Default ceiling for a Connect GET URL.
pub const DEFAULT_GET_URL_MAX_BYTES: usize = 8 * 1024;

/// Errors raised while assembling a client or its transport.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid base url {0:?}: {1}")]
    InvalidUrl(String, String),
    #[error("request compression {0:?} is not registered")]
    UnknownCompression(String),
    #[error(
        "HTTPS requires a crypto provider: enable `tls-ring` or `tls-aws-lc`, or install a default rustls provider"
    )]
    NoCryptoProvider,
    #[error("TLS configuration failed: {0}")]
    Tls(#[from] rustls::Error),
}

/// Settings shared by every call a [`Client`](crate::Client) makes.
///
/// ```ignore
/// let config = ClientConfig::new(Protocol::Grpc)
///     .codec(Codec::Json)
///     .send_compression("gzip");
/// ```
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub(crate) protocol: Protocol,
    pub(crate) codec: Codec,
    pub(crate) send_compression: Option<String>,
    pub(crate) compression: CompressionPools,
    pub(crate) compress_min_bytes: usize,
    pub(crate) read_max_bytes: usize,
    pub(crate) send_max_bytes: usize,
    pub(crate) enable_get: bool,
    pub(crate) get_url_max_bytes: usize,
    pub(crate) get_use_fallback: bool,
    pub(crate) user_agent: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(Protocol::Connect)
    }
}

impl ClientConfig {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            codec: Codec::Proto,
            send_compression: None,
            compression: CompressionPools::default(),
            compress_min_bytes: 0,
            read_max_bytes: 0,
            send_max_bytes: 0,
            enable_get: false,
            get_url_max_bytes: DEFAULT_GET_URL_MAX_BYTES,
            get_use_fallback: true,
            user_agent: None,
        }
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Compress requests with the named algorithm. It must be registered.
    pub fn send_compression<S: Into<String>>(mut self, name: S) -> Self {
        self.send_compression = Some(name.into());
        self
    }

    /// Algorithms the client can decompress and advertises to the server.
    pub fn compression(mut self, pools: CompressionPools) -> Self {
        self.compression = pools;
        self
    }

    pub fn compress_min_bytes(mut self, min: usize) -> Self {
        self.compress_min_bytes = min;
        self
    }

    /// Zero means unlimited.
    pub fn read_max_bytes(mut self, max: usize) -> Self {
        self.read_max_bytes = max;
        self
    }

    /// Zero means unlimited.
    pub fn send_max_bytes(mut self, max: usize) -> Self {
        self.send_max_bytes = max;
        self
    }

    /// Issue side-effect-free Connect unary calls as GET requests.
    pub fn enable_get(mut self, enabled: bool) -> Self {
        self.enable_get = enabled;
        self
    }

    pub fn get_url_max_bytes(mut self, max: usize) -> Self {
        self.get_url_max_bytes = max;
        self
    }

    /// Fall back to POST when a GET URL would exceed the budget.
    pub fn get_use_fallback(mut self, enabled: bool) -> Self {
        self.get_use_fallback = enabled;
        self
    }

    pub fn user_agent<S: Into<String>>(mut self, user_agent: S) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn get_protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn get_codec(&self) -> Codec {
        self.codec
    }

    pub(crate) fn user_agent_value(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(|| format!("rpcwire-client/{}", env!("CARGO_PKG_VERSION")))
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        match &self.send_compression {
            Some(name) if !self.compression.contains(name) => {
                Err(ConfigError::UnknownCompression(name.clone()))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.get_protocol(), Protocol::Connect);
        assert_eq!(config.get_codec(), Codec::Proto);
        assert_eq!(config.get_url_max_bytes, DEFAULT_GET_URL_MAX_BYTES);
        assert!(config.get_use_fallback);
        assert!(!config.enable_get);
        assert!(config.user_agent_value().starts_with("rpcwire-client/"));
    }

    #[test]
    fn test_config_rejects_unregistered_send_compression() {
        let config = ClientConfig::new(Protocol::Grpc).send_compression("snappy");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownCompression(name)) if name == "snappy"
        ));
        assert!(ClientConfig::default().send_compression("gzip").validate().is_ok());
    }

    #[test]
    fn test_config_user_agent_override() {
        let config = ClientConfig::default().user_agent("probe/1.0");
        assert_eq!(config.user_agent_value(), "probe/1.0");
    }
}
