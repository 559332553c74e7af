use crate::config::SiteConfig;
use crate::error::GatewayError;
use crate::proxy::context::BoxBody;
use hyper::body::Incoming;
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;

/// Pooled HTTP/1.1 client for the site upstream that admitted requests are
/// handed to.
pub struct SiteClient {
    /// `scheme://authority` with no trailing slash.
    base: String,
    client: Client<HttpConnector, BoxBody>,
    request_timeout: Duration,
}

impl SiteClient {
    pub fn new(cfg: &SiteConfig) -> Result<Self, GatewayError> {
        let uri: Uri = cfg
            .upstream
            .parse()
            .map_err(|e| GatewayError::Config(format!("site.upstream: {}", e)))?;
        let (scheme, authority) = match (uri.scheme_str(), uri.authority()) {
            (Some(s), Some(a)) => (s.to_string(), a.to_string()),
            _ => {
                return Err(GatewayError::Config(format!(
                    "site.upstream '{}' must be an absolute URL",
                    cfg.upstream
                )))
            }
        };

        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.set_keepalive(Some(Duration::from_secs(60)));
        http.set_connect_timeout(Some(Duration::from_millis(cfg.connect_timeout_ms)));

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(64)
            .build(http);

        Ok(Self {
            base: format!("{}://{}", scheme, authority),
            client,
            request_timeout: Duration::from_millis(cfg.request_timeout_ms),
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn target_uri(&self, path_and_query: &str) -> Result<Uri, GatewayError> {
        let mut target = String::with_capacity(self.base.len() + path_and_query.len());
        target.push_str(&self.base);
        target.push_str(path_and_query);
        target
            .parse()
            .map_err(|e| GatewayError::Internal(format!("bad upstream uri: {}", e)))
    }

    /// Send a request whose URI has already been pointed at the upstream.
    pub async fn send(&self, req: Request<BoxBody>) -> Result<Response<Incoming>, GatewayError> {
        match tokio::time::timeout(self.request_timeout, self.client.request(req)).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => Err(GatewayError::Upstream(e.to_string())),
            Err(_) => Err(GatewayError::UpstreamTimeout),
        }
    }
}
