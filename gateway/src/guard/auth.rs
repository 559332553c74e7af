use super::request::RequestDescriptor;
use crate::config::AuthConfig;
use crate::error::GatewayError;
use crate::routing::PathPatterns;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// A signed-in user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
}

/// Resolves a session token to an identity.
#[async_trait]
pub trait SessionVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Option<Identity>;
}

/// Fixed token table loaded from configuration.
#[derive(Debug, Default)]
pub struct StaticSessions {
    sessions: HashMap<String, String>,
}

impl StaticSessions {
    pub fn new(sessions: HashMap<String, String>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl SessionVerifier for StaticSessions {
    async fn verify(&self, token: &str) -> Option<Identity> {
        self.sessions.get(token).map(|user_id| Identity {
            user_id: user_id.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    /// Browser navigation: send the user to sign in, then back here.
    SignIn { location: String },
    /// API caller: plain 401.
    Unauthorized,
}

impl AuthFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthFailure::SignIn { .. } => "sign_in",
            AuthFailure::Unauthorized => "unauthorized",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Route does not require a session.
    Public,
    Authenticated(Identity),
    Failed(AuthFailure),
}

/// Requires a valid session on protected routes.
pub struct AuthGate {
    protected: PathPatterns,
    sign_in_path: String,
    session_cookie: String,
    api_prefixes: Vec<String>,
    verifier: Arc<dyn SessionVerifier>,
}

impl AuthGate {
    pub fn new(config: &AuthConfig, verifier: Arc<dyn SessionVerifier>) -> Result<Self, GatewayError> {
        let protected = PathPatterns::new(&config.protected)?;
        if protected.is_match(&config.sign_in_path) {
            return Err(GatewayError::Config(format!(
                "sign-in path '{}' must not be protected",
                config.sign_in_path
            )));
        }
        Ok(Self {
            protected,
            sign_in_path: config.sign_in_path.clone(),
            session_cookie: config.session_cookie.clone(),
            api_prefixes: config.api_prefixes.clone(),
            verifier,
        })
    }

    /// Gate backed by the configured static session table.
    pub fn from_config(config: &AuthConfig) -> Result<Self, GatewayError> {
        Self::new(config, Arc::new(StaticSessions::new(config.sessions.clone())))
    }

    pub fn is_protected(&self, path: &str) -> bool {
        self.protected.is_match(path)
    }

    pub fn protected_patterns(&self) -> &[String] {
        self.protected.patterns()
    }

    pub async fn protect(&self, req: &RequestDescriptor) -> AuthOutcome {
        if !self.is_protected(&req.path) {
            return AuthOutcome::Public;
        }

        let token = req
            .cookie(&self.session_cookie)
            .or_else(|| req.bearer_token())
            .filter(|t| !t.is_empty());

        if let Some(token) = token {
            if let Some(identity) = self.verifier.verify(token).await {
                return AuthOutcome::Authenticated(identity);
            }
        }

        let failure = if req.is_api_call(&self.api_prefixes) {
            AuthFailure::Unauthorized
        } else {
            AuthFailure::SignIn {
                location: self.sign_in_location(req),
            }
        };

        metrics::counter!("gateway_auth_failures_total", "kind" => failure.kind()).increment(1);
        tracing::info!(
            event = "AUTH_FAILURE",
            source = %req.source,
            method = %req.method,
            path = %req.path,
            had_token = token.is_some(),
            outcome = failure.kind(),
            "authentication required"
        );
        AuthOutcome::Failed(failure)
    }

    fn sign_in_location(&self, req: &RequestDescriptor) -> String {
        format!(
            "{}?redirect_url={}",
            self.sign_in_path,
            urlencoding::encode(&req.path_and_query())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use std::net::{IpAddr, Ipv4Addr};

    fn gate() -> AuthGate {
        let mut config = AuthConfig::default();
        config
            .sessions
            .insert("sess-owner".to_string(), "user_owner".to_string());
        AuthGate::from_config(&config).unwrap()
    }

    fn req(path: &str) -> RequestDescriptor {
        RequestDescriptor::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)), Method::GET, path)
    }

    #[tokio::test]
    async fn test_public_route() {
        assert_eq!(gate().protect(&req("/")).await, AuthOutcome::Public);
        assert_eq!(gate().protect(&req("/blog/hello")).await, AuthOutcome::Public);
    }

    #[tokio::test]
    async fn test_browser_without_session_redirects() {
        let outcome = gate().protect(&req("/admin/reviews").with_query("page=2")).await;
        assert_eq!(
            outcome,
            AuthOutcome::Failed(AuthFailure::SignIn {
                location: "/sign-in?redirect_url=%2Fadmin%2Freviews%3Fpage%3D2".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_protected_base_path_without_trailing_segment() {
        let outcome = gate().protect(&req("/projects")).await;
        assert!(matches!(outcome, AuthOutcome::Failed(AuthFailure::SignIn { .. })));
    }

    #[tokio::test]
    async fn test_api_caller_gets_unauthorized() {
        let r = req("/admin/reviews").with_header("accept", "application/json");
        assert_eq!(
            gate().protect(&r).await,
            AuthOutcome::Failed(AuthFailure::Unauthorized)
        );
    }

    #[tokio::test]
    async fn test_valid_cookie_session() {
        let r = req("/security-journal/new").with_header("cookie", "__session=sess-owner");
        assert_eq!(
            gate().protect(&r).await,
            AuthOutcome::Authenticated(Identity {
                user_id: "user_owner".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_valid_bearer_session() {
        let r = req("/resources/private").with_header("authorization", "Bearer sess-owner");
        assert!(matches!(gate().protect(&r).await, AuthOutcome::Authenticated(_)));
    }

    #[tokio::test]
    async fn test_unknown_session_fails() {
        let r = req("/admin").with_header("cookie", "__session=forged");
        assert!(matches!(gate().protect(&r).await, AuthOutcome::Failed(_)));
    }

    #[test]
    fn test_protected_sign_in_is_rejected() {
        let config = AuthConfig {
            protected: vec!["/*".to_string()],
            ..AuthConfig::default()
        };
        assert!(AuthGate::from_config(&config).is_err());
    }
}
