use super::auth::{AuthFailure, AuthGate, AuthOutcome, Identity};
use super::decision::{Decision, DenyReason};
use super::limiter::LimiterSettings;
use super::policy::{GuardPolicy, PolicyContext, PolicySummary};
use super::request::RequestDescriptor;
use crate::config::{presets, GatewayConfig};
use crate::error::GatewayError;
use crate::routing::{GatewayMatcher, MethodFilter, PathPatterns};
use http::header::{CONTENT_TYPE, LOCATION, RETRY_AFTER};
use http::{HeaderName, HeaderValue, StatusCode};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// A response the guard layer emits instead of letting the request through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Denied {
        policy: String,
        reason: DenyReason,
        retry_after: Option<Duration>,
    },
    SignIn {
        location: String,
    },
    Unauthorized,
}

impl Rejection {
    fn denied(decision: &Decision, reason: DenyReason) -> Self {
        Rejection::Denied {
            policy: decision.policy.clone(),
            reason,
            retry_after: decision.retry_after(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Rejection::Denied { reason, .. } => reason.status(),
            Rejection::SignIn { .. } => StatusCode::TEMPORARY_REDIRECT,
            Rejection::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }

    /// JSON error body. Redirects carry none.
    pub fn body(&self) -> Option<String> {
        let message = match self {
            Rejection::Denied { reason, .. } => reason.message(),
            Rejection::Unauthorized => "Unauthorized",
            Rejection::SignIn { .. } => return None,
        };
        Some(serde_json::json!({ "error": message }).to_string())
    }

    pub fn headers(&self) -> Vec<(HeaderName, HeaderValue)> {
        let mut headers = Vec::with_capacity(2);
        match self {
            Rejection::Denied { retry_after, .. } => {
                headers.push((CONTENT_TYPE, HeaderValue::from_static("application/json")));
                if let Some(after) = retry_after {
                    let mut buf = itoa::Buffer::new();
                    if let Ok(v) = HeaderValue::from_str(buf.format(after.as_secs().max(1))) {
                        headers.push((RETRY_AFTER, v));
                    }
                }
            }
            Rejection::Unauthorized => {
                headers.push((CONTENT_TYPE, HeaderValue::from_static("application/json")));
            }
            Rejection::SignIn { location } => {
                if let Ok(v) = HeaderValue::from_str(location) {
                    headers.push((LOCATION, v));
                }
            }
        }
        headers
    }

    /// Pipeline stage that produced the rejection, for access logs.
    pub fn stage(&self) -> &'static str {
        match self {
            Rejection::Denied { .. } => "guard",
            Rejection::SignIn { .. } | Rejection::Unauthorized => "auth",
        }
    }
}

impl From<AuthFailure> for Rejection {
    fn from(failure: AuthFailure) -> Self {
        match failure {
            AuthFailure::SignIn { location } => Rejection::SignIn { location },
            AuthFailure::Unauthorized => Rejection::Unauthorized,
        }
    }
}

#[derive(Debug)]
pub enum Admission {
    /// Not looked at: static asset or framework-internal path.
    Bypass,
    Admitted {
        decision: Decision,
        identity: Option<Identity>,
    },
    Rejected(Rejection),
}

/// The single interception point every inbound request passes.
///
/// Sequence per request: policy, then auth for protected routes. Auth only
/// runs once the policy has fully completed and allowed the request.
pub struct Gateway {
    matcher: GatewayMatcher,
    policy: Arc<GuardPolicy>,
    auth: AuthGate,
}

impl Gateway {
    pub fn new(matcher: GatewayMatcher, policy: Arc<GuardPolicy>, auth: AuthGate) -> Self {
        Self {
            matcher,
            policy,
            auth,
        }
    }

    pub fn policy(&self) -> &Arc<GuardPolicy> {
        &self.policy
    }

    pub fn auth(&self) -> &AuthGate {
        &self.auth
    }

    pub async fn admit(&self, req: &RequestDescriptor) -> Admission {
        // Protected routes are never bypassed, whatever their extension.
        if !self.matcher.should_guard(&req.path) && !self.auth.is_protected(&req.path) {
            return Admission::Bypass;
        }

        let decision = self.policy.evaluate(req).await;
        if let Some(reason) = decision.reason() {
            return Admission::Rejected(Rejection::denied(&decision, reason));
        }

        match self.auth.protect(req).await {
            AuthOutcome::Public => Admission::Admitted {
                decision,
                identity: None,
            },
            AuthOutcome::Authenticated(identity) => Admission::Admitted {
                decision,
                identity: Some(identity),
            },
            AuthOutcome::Failed(failure) => Admission::Rejected(failure.into()),
        }
    }
}

/// A second, endpoint-specific policy run after gateway admission.
pub struct RouteGuard {
    name: String,
    uri: PathPatterns,
    methods: MethodFilter,
    policy: Arc<GuardPolicy>,
}

#[derive(Debug, Serialize)]
pub struct RouteGuardSummary {
    pub name: String,
    pub uri: String,
    pub methods: Vec<String>,
    pub policy: String,
}

impl RouteGuard {
    pub fn new(
        name: impl Into<String>,
        uri: &str,
        methods: &[String],
        policy: Arc<GuardPolicy>,
    ) -> Result<Self, GatewayError> {
        Ok(Self {
            name: name.into(),
            uri: PathPatterns::new(&[uri])?,
            methods: MethodFilter::new(methods),
            policy,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn applies_to(&self, req: &RequestDescriptor) -> bool {
        self.methods.allows(&req.method) && self.uri.is_match(&req.path)
    }

    /// Evaluate this guard's policy. A LIVE denial becomes a rejection.
    pub async fn protect(&self, req: &RequestDescriptor) -> Result<Decision, Rejection> {
        let decision = self.policy.evaluate(req).await;
        match decision.reason() {
            Some(reason) => {
                tracing::info!(
                    event = "PERMISSION_DENIED",
                    route_guard = %self.name,
                    policy = %decision.policy,
                    reason = reason.as_str(),
                    source = %req.source,
                    method = %req.method,
                    path = %req.path,
                    "route guard denied request"
                );
                Err(Rejection::denied(&decision, reason))
            }
            None => Ok(decision),
        }
    }

    pub fn summary(&self) -> RouteGuardSummary {
        RouteGuardSummary {
            name: self.name.clone(),
            uri: self.uri.patterns().join(","),
            methods: self.methods.methods().to_vec(),
            policy: self.policy.name().to_string(),
        }
    }
}

/// Ordered route guard table.
#[derive(Default)]
pub struct RouteGuards {
    guards: Vec<RouteGuard>,
}

impl RouteGuards {
    pub fn new(guards: Vec<RouteGuard>) -> Self {
        Self { guards }
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    /// Run every guard that applies, in declaration order. The first denial
    /// stops the chain: later guards are not charged for a rejected request.
    pub async fn check(&self, req: &RequestDescriptor) -> Result<Vec<Decision>, Rejection> {
        let mut decisions = Vec::new();
        for guard in self.guards.iter().filter(|g| g.applies_to(req)) {
            decisions.push(guard.protect(req).await?);
        }
        Ok(decisions)
    }

    pub fn summaries(&self) -> Vec<RouteGuardSummary> {
        self.guards.iter().map(RouteGuard::summary).collect()
    }
}

/// Everything compiled from configuration: the gateway, the route guards
/// and the named policies they reference.
pub struct Guards {
    pub gateway: Gateway,
    pub route_guards: RouteGuards,
    pub policies: BTreeMap<String, Arc<GuardPolicy>>,
}

impl Guards {
    pub fn from_config(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let ctx = PolicyContext {
            evaluator_timeout: Duration::from_millis(config.guard.evaluator_timeout_ms),
            limiter: LimiterSettings {
                max_entries: config.limiter.max_entries,
                idle_ttl: Duration::from_secs(config.limiter.idle_ttl_secs),
            },
        };

        let mut policies = BTreeMap::new();
        for (name, policy) in presets::resolve(&config.policies) {
            let compiled = GuardPolicy::compile(&name, &policy, &ctx)?;
            policies.insert(name, Arc::new(compiled));
        }

        let lookup = |name: &str| {
            policies
                .get(name)
                .cloned()
                .ok_or_else(|| GatewayError::Config(format!("unknown policy '{}'", name)))
        };

        let gateway = Gateway::new(
            GatewayMatcher::new(&config.matcher)?,
            lookup(&config.guard.gateway_policy)?,
            AuthGate::from_config(&config.auth)?,
        );

        let mut route_guards = Vec::with_capacity(config.route_guards.len());
        for rg in &config.route_guards {
            let name = if rg.name.is_empty() { rg.uri.clone() } else { rg.name.clone() };
            route_guards.push(RouteGuard::new(name, &rg.uri, &rg.methods, lookup(&rg.policy)?)?);
        }

        tracing::info!(
            "guard: compiled guards, policies={}, gateway_policy={}, route_guards={}",
            policies.len(),
            config.guard.gateway_policy,
            route_guards.len()
        );

        Ok(Self {
            gateway,
            route_guards: RouteGuards::new(route_guards),
            policies,
        })
    }

    pub fn policy(&self, name: &str) -> Option<&Arc<GuardPolicy>> {
        self.policies.get(name)
    }

    pub fn policy_summaries(&self) -> Vec<PolicySummary> {
        self.policies.values().map(|p| p.summary()).collect()
    }

    /// Spawn one eviction loop per limiter.
    pub fn start_gc(&self, every: Duration) {
        for policy in self.policies.values() {
            for limiter in policy.limiters() {
                limiter.start_gc(every, policy.name().to_string());
            }
        }
    }
}
