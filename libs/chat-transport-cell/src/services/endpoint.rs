use std::time::Duration;

use async_trait::async_trait;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use tracing::{debug, info, warn};
use url::Url;

use shared_config::AppConfig;
use shared_models::auth::BearerToken;

use crate::services::socket::{redact, SocketChannel, SocketConnector};
use crate::{CloseCode, TransportError};

/// Everything needed to build a socket URL except the endpoint path.
#[derive(Debug, Clone)]
pub struct SocketTarget {
    scheme: &'static str,
    host: String,
    token: BearerToken,
    params: Vec<(String, String)>,
}

impl SocketTarget {
    pub fn new(config: &AppConfig, token: BearerToken, params: Vec<(String, String)>) -> Self {
        Self {
            scheme: config.websocket_scheme(),
            host: config.host().to_string(),
            token,
            params,
        }
    }

    /// Same target with a refreshed credential.
    pub fn with_token(&self, token: BearerToken) -> Self {
        Self {
            token,
            ..self.clone()
        }
    }

    pub fn token(&self) -> &BearerToken {
        &self.token
    }

    /// `<ws|wss>://<host>/<endpoint>?token=<token>[&k=v...]`
    pub fn url_for(&self, endpoint: &str) -> Result<Url, TransportError> {
        if self.host.is_empty() {
            return Err(TransportError::InvalidUrl("chat server host is not configured".to_string()));
        }

        let endpoint = endpoint.trim().trim_start_matches('/');
        let mut url = Url::parse(&format!("{}://{}/{}", self.scheme, self.host, endpoint))?;
        url.query_pairs_mut()
            .append_pair("token", self.token.as_str())
            .extend_pairs(self.params.iter());
        Ok(url)
    }
}

pub fn build_socket_url(
    config: &AppConfig,
    endpoint: &str,
    token: &BearerToken,
    params: &[(String, String)],
) -> Result<Url, TransportError> {
    SocketTarget::new(config, token.clone(), params.to_vec()).url_for(endpoint)
}

/// Decides which endpoint path the long-lived connection should use.
#[async_trait]
pub trait EndpointResolver: Send + Sync {
    async fn resolve(
        &self,
        connector: &dyn SocketConnector,
        target: &SocketTarget,
    ) -> Result<String, TransportError>;
}

/// A single configured endpoint, used as is.
#[derive(Debug, Clone)]
pub struct FixedEndpoint {
    endpoint: String,
}

impl FixedEndpoint {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl EndpointResolver for FixedEndpoint {
    async fn resolve(
        &self,
        _connector: &dyn SocketConnector,
        target: &SocketTarget,
    ) -> Result<String, TransportError> {
        // Fail early on a URL that can never work.
        target.url_for(&self.endpoint)?;
        Ok(self.endpoint.clone())
    }
}

/// Tries several endpoint paths at once with short-lived trial connections.
/// The first one to open wins; every trial is discarded once the race is
/// decided, including the winner's.
#[derive(Debug, Clone)]
pub struct ProbingResolver {
    candidates: Vec<String>,
    probe_timeout: Duration,
}

impl ProbingResolver {
    pub fn new(candidates: Vec<String>, probe_timeout: Duration) -> Self {
        Self {
            candidates,
            probe_timeout,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.chat_ws_endpoint_candidates.clone(), config.probe_timeout())
    }

    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    fn exhausted(&self) -> TransportError {
        TransportError::EndpointsExhausted {
            tried: self.candidates.join(", "),
        }
    }
}

#[async_trait]
impl EndpointResolver for ProbingResolver {
    async fn resolve(
        &self,
        connector: &dyn SocketConnector,
        target: &SocketTarget,
    ) -> Result<String, TransportError> {
        if self.candidates.is_empty() {
            return Err(self.exhausted());
        }

        let probes: Vec<BoxFuture<'_, Result<(String, SocketChannel), TransportError>>> = self
            .candidates
            .iter()
            .map(|endpoint| probe(connector, target, endpoint, self.probe_timeout).boxed())
            .collect();

        match future::select_ok(probes).await {
            Ok(((endpoint, trial), pending)) => {
                // Dropping the losers cancels their handshakes.
                drop(pending);
                trial.close(CloseCode::Normal);
                info!("Chat endpoint resolved to /{}", endpoint);
                Ok(endpoint)
            }
            Err(last) => {
                warn!("Every chat endpoint candidate failed, last error: {}", last);
                Err(self.exhausted())
            }
        }
    }
}

async fn probe(
    connector: &dyn SocketConnector,
    target: &SocketTarget,
    endpoint: &str,
    probe_timeout: Duration,
) -> Result<(String, SocketChannel), TransportError> {
    let url = target.url_for(endpoint)?;
    debug!("Probing chat endpoint {}", redact(&url));

    match tokio::time::timeout(probe_timeout, connector.connect(&url)).await {
        Ok(Ok(channel)) => Ok((endpoint.to_string(), channel)),
        Ok(Err(e)) => {
            debug!("Probe of /{} failed: {}", endpoint, e);
            Err(e)
        }
        Err(_) => {
            debug!("Probe of /{} timed out", endpoint);
            Err(TransportError::HandshakeFailed {
                url: redact(&url),
                reason: format!("probe timed out after {:?}", probe_timeout),
            })
        }
    }
}
