use std::sync::Arc;

use http::Uri;
use rpcwire_core::{BufferPool, CallContext, Error, RpcMessage, Spec};

use crate::config::{ClientConfig, ConfigError};
use crate::conn::ClientConn;
use crate::transport::HyperTransport;

/// Opens [`ClientConn`]s against one server.
///
/// Cloning is cheap; clones share the transport's connection pool.
///
/// ```ignore
/// let client = Client::new(
///     "http://localhost:3000",
///     HyperTransport::new()?,
///     ClientConfig::new(Protocol::Connect),
/// )?;
/// let spec = Spec::new("/greet.v1.GreetService/Greet", StreamType::Unary);
/// let reply: GreetResponse = client.unary(spec, CallContext::new(), &request).await?;
/// ```
#[derive(Clone, Debug)]
pub struct Client {
    transport: HyperTransport,
    base_url: String,
    config: Arc<ClientConfig>,
    buffers: BufferPool,
}

impl Client {
    pub fn new<S: Into<String>>(
        base_url: S,
        transport: HyperTransport,
        config: ClientConfig,
    ) -> Result<Self, ConfigError> {
        let base_url = base_url.into();
        let uri: Uri = base_url
            .parse()
            .map_err(|e: http::uri::InvalidUri| ConfigError::InvalidUrl(base_url.clone(), e.to_string()))?;
        match uri.scheme_str() {
            Some("http") | Some("https") => {}
            _ => {
                return Err(ConfigError::InvalidUrl(
                    base_url,
                    "scheme must be http or https".to_string(),
                ));
            }
        }
        if uri.authority().is_none() {
            return Err(ConfigError::InvalidUrl(base_url, "missing host".to_string()));
        }
        config.validate()?;
        Ok(Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            config: Arc::new(config),
            buffers: BufferPool::default(),
        })
    }

    /// Share a buffer pool with other clients or handlers.
    pub fn buffers(mut self, buffers: BufferPool) -> Self {
        self.buffers = buffers;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Open a conn for one call of `spec`. Nothing is sent until the first
    /// send, receive or close.
    pub fn new_conn(&self, spec: Spec, ctx: CallContext) -> Result<ClientConn, Error> {
        let procedure = spec.procedure.trim_start_matches('/');
        let url = format!("{}/{procedure}", self.base_url);
        let uri: Uri = url
            .parse()
            .map_err(|e| Error::internal(format!("invalid procedure url {url:?}: {e}")))?;
        Ok(ClientConn::new(
            self.transport.clone(),
            self.config.clone(),
            self.buffers.clone(),
            spec.client(),
            ctx,
            uri,
        ))
    }

    /// Run a unary call to completion.
    pub async fn unary<Req, Res>(
        &self,
        spec: Spec,
        ctx: CallContext,
        request: &Req,
    ) -> Result<Res, Error>
    where
        Req: RpcMessage,
        Res: RpcMessage,
    {
        let conn = self.new_conn(spec, ctx)?;
        conn.send(request).await?;
        conn.close_request().await?;
        conn.receive_unary().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpcwire_core::{Protocol, StreamType};

    fn transport() -> HyperTransport {
        HyperTransport::builder().http2_only(true).build().unwrap()
    }

    #[test]
    fn test_rejects_bad_base_urls() {
        for url in ["localhost:3000", "ftp://example.com", "not a url", "/relative"] {
            let err = Client::new(url, transport(), ClientConfig::default()).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidUrl(..)), "{url}: {err}");
        }
    }

    #[test]
    fn test_rejects_unregistered_send_compression() {
        let config = ClientConfig::new(Protocol::Grpc).send_compression("br");
        let err = Client::new("http://localhost:3000", transport(), config).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownCompression(name) if name == "br"));
    }

    #[tokio::test]
    async fn test_new_conn_joins_procedure() {
        let client = Client::new("http://localhost:3000/api/", transport(), ClientConfig::default())
            .unwrap();
        assert_eq!(client.base_url(), "http://localhost:3000/api");
        let conn = client
            .new_conn(
                Spec::new("/greet.v1.GreetService/Greet", StreamType::Unary),
                CallContext::new(),
            )
            .unwrap();
        assert!(conn.spec().is_client);
        assert_eq!(conn.protocol(), Protocol::Connect);
        assert!(conn.request_headers().contains_key(http::header::CONTENT_TYPE));
    }
}
