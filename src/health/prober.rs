use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::debug;

use crate::config::{HealthConfig, NodeConfig};

/// One probe attempt against a node. Implementations must not block the
/// calling task for longer than necessary — timeout enforcement is the
/// checker's job, not the prober's.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, node: &NodeConfig) -> bool;
}

/// Issues the configured HTTP request against `node.url` joined with
/// `health_check.path` and checks the response status against
/// `expected_status_codes`. A connection error, a non-2xx/expected status,
/// or a malformed URL all count as probe failure.
pub struct HttpProber {
    config: HealthConfig,
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl HttpProber {
    pub fn new(config: HealthConfig) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self { config, client }
    }

    fn target_uri(&self, node: &NodeConfig) -> Option<Uri> {
        let base = node.url.trim_end_matches('/');
        let path = if self.config.path.starts_with('/') {
            self.config.path.clone()
        } else {
            format!("/{}", self.config.path)
        };
        format!("{base}{path}").parse().ok()
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, node: &NodeConfig) -> bool {
        let Some(uri) = self.target_uri(node) else {
            debug!(node_id = %node.id, url = %node.url, "health probe: invalid target url");
            return false;
        };

        let method = self.config.method.parse::<Method>().unwrap_or(Method::GET);
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in &self.config.headers {
            builder = builder.header(name, value);
        }

        let request = match builder.body(Empty::<Bytes>::new()) {
            Ok(r) => r,
            Err(e) => {
                debug!(node_id = %node.id, "health probe: failed to build request: {e}");
                return false;
            }
        };

        match self.client.request(request).await {
            Ok(response) => {
                let status = response.status().as_u16();
                let _ = response.into_body().collect().await;
                self.config.expected_status_codes.contains(&status)
            }
            Err(e) => {
                debug!(node_id = %node.id, "health probe: request failed: {e}");
                false
            }
        }
    }
}

/// Wraps a user-supplied predicate instead of issuing an HTTP request — the
/// hook [`crate::health::AdvancedHealthChecker`] uses for synthetic or
/// out-of-band health signals (e.g. a TCP dial, a custom RPC).
pub struct PredicateProber {
    predicate: Arc<dyn Fn(&NodeConfig) -> bool + Send + Sync>,
}

impl PredicateProber {
    pub fn new(predicate: impl Fn(&NodeConfig) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Arc::new(predicate),
        }
    }
}

#[async_trait]
impl Prober for PredicateProber {
    async fn probe(&self, node: &NodeConfig) -> bool {
        (self.predicate)(node)
    }
}
