use crate::config::GatewayConfig;
use crate::guard::Guards;
use crate::metrics::Metrics;
use crate::proxy::SiteClient;
use anyhow::Result;
use ipnetwork::IpNetwork;
use std::sync::Arc;
use tracing::info;

/// Shared gateway state, cheaply cloneable.
///
/// Everything here is compiled once from configuration at startup; the only
/// mutable state behind it is the limiter bucket tables, which synchronize
/// themselves.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub metrics: Metrics,
    pub guards: Arc<Guards>,
    pub site: Arc<SiteClient>,
    pub trusted_proxies: Arc<Vec<IpNetwork>>,
}

impl GatewayState {
    pub fn new(config: GatewayConfig, metrics: Metrics) -> Result<Self> {
        let guards = Guards::from_config(&config)?;
        let site = SiteClient::new(&config.site)?;
        let trusted_proxies = config.trusted_proxies();

        info!(
            "state: ready, upstream={}, trusted_proxies={}, route_guards={}",
            site.base(),
            trusted_proxies.len(),
            guards.route_guards.len()
        );

        Ok(Self {
            config: Arc::new(config),
            metrics,
            guards: Arc::new(guards),
            site: Arc::new(site),
            trusted_proxies: Arc::new(trusted_proxies),
        })
    }
}
