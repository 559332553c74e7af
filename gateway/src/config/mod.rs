pub mod presets;
pub mod types;


pub use types::*;

use crate::routing::PathPatterns;
use anyhow::Result;
use ipnetwork::IpNetwork;
use std::path::Path;

impl GatewayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used; the guard key must then come from the environment.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            GatewayConfig::default()
        };

        config.apply_env_overrides();

        config.validate()?;
        tracing::info!(
            gateway_policy = %config.guard.gateway_policy,
            policies = config.policies.len(),
            route_guards = config.route_guards.len(),
            protected_routes = config.auth.protected.len(),
            upstream = %config.site.upstream,
            "loaded gateway configuration"
        );
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Deployment settings only. Profiles and route guards come from the file.
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("RAMPART_GUARD_KEY") {
            self.guard.key = Some(v);
        }
        if let Some(v) = var("RAMPART_GATEWAY_POLICY") {
            self.guard.gateway_policy = v;
        }
        if let Some(v) = var("RAMPART_EVALUATOR_TIMEOUT_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.guard.evaluator_timeout_ms = n;
            }
        }
        if let Some(v) = var("RAMPART_TRUSTED_PROXIES") {
            self.guard.trusted_proxies = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = var("RAMPART_SITE_UPSTREAM") {
            self.site.upstream = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        // Running without a tenant key would mean running unprotected.
        match self.guard.key.as_deref() {
            Some(k) if !k.trim().is_empty() => {}
            _ => anyhow::bail!("guard.key is required (set it in the config file or RAMPART_GUARD_KEY)"),
        }

        if self.guard.evaluator_timeout_ms == 0 {
            anyhow::bail!("guard.evaluator_timeout_ms must be > 0");
        }

        for cidr in &self.guard.trusted_proxies {
            if cidr.parse::<IpNetwork>().is_err() {
                anyhow::bail!("guard.trusted_proxies: invalid CIDR '{}'", cidr);
            }
        }

        let policies = presets::resolve(&self.policies);
        if !policies.contains_key(&self.guard.gateway_policy) {
            anyhow::bail!(
                "guard.gateway_policy references unknown policy '{}'",
                self.guard.gateway_policy
            );
        }

        for (name, policy) in &policies {
            for rule in &policy.rules {
                if let crate::guard::Rule::TokenBucket(tb) = rule {
                    if tb.capacity == 0 || tb.refill_rate == 0 || tb.interval == 0 {
                        anyhow::bail!(
                            "policy '{}': token_bucket requires capacity, refill_rate and interval > 0",
                            name
                        );
                    }
                }
            }
        }

        for rg in &self.route_guards {
            if rg.uri.is_empty() {
                anyhow::bail!("route guard '{}' has empty uri", rg.name);
            }
            if !policies.contains_key(&rg.policy) {
                anyhow::bail!(
                    "route guard '{}' references unknown policy '{}'",
                    rg.name,
                    rg.policy
                );
            }
            PathPatterns::new(&[rg.uri.as_str()])?;
        }

        let protected = PathPatterns::new(&self.auth.protected)?;
        if protected.is_match(&self.auth.sign_in_path) {
            anyhow::bail!(
                "auth.sign_in_path '{}' must not be a protected route",
                self.auth.sign_in_path
            );
        }
        if self.auth.session_cookie.is_empty() {
            anyhow::bail!("auth.session_cookie must not be empty");
        }

        match self.site.upstream.parse::<http::Uri>() {
            Ok(uri) if uri.scheme_str() == Some("http") && uri.authority().is_some() => {}
            _ => anyhow::bail!(
                "site.upstream '{}' must be an absolute http:// URL",
                self.site.upstream
            ),
        }

        Ok(())
    }

    /// Parsed `guard.trusted_proxies`. Entries are checked by `validate`.
    pub fn trusted_proxies(&self) -> Vec<IpNetwork> {
        self.guard
            .trusted_proxies
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect()
    }
}
