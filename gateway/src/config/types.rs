use crate::guard::{Mode, Rule};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Deserialize a `T` that implements `Default`, treating JSON `null` the same as
/// a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub guard: GuardConfig,

    #[serde(default)]
    pub limiter: LimiterConfig,

    #[serde(default)]
    pub site: SiteConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub matcher: MatcherConfig,

    /// Named protection profiles. Entries override the built-in presets of
    /// the same name or add new ones.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub policies: HashMap<String, PolicyConfig>,

    /// Per-endpoint guards evaluated after gateway admission.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub route_guards: Vec<RouteGuardConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Tenant key of the guard service. Required: the gateway refuses to
    /// start without it.
    #[serde(default)]
    pub key: Option<String>,

    /// Policy the gateway runs for every matched request.
    #[serde(default = "default_gateway_policy")]
    pub gateway_policy: String,

    /// Upper bound on a single rule evaluation before it counts as an error.
    #[serde(default = "default_evaluator_timeout_ms")]
    pub evaluator_timeout_ms: u64,

    /// Peers in these CIDRs may set the client address via `X-Forwarded-For`.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub trusted_proxies: Vec<String>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            key: None,
            gateway_policy: default_gateway_policy(),
            evaluator_timeout_ms: default_evaluator_timeout_ms(),
            trusted_proxies: Vec::new(),
        }
    }
}

fn default_gateway_policy() -> String {
    "default".to_string()
}

fn default_evaluator_timeout_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Buckets untouched for this long are evicted (seconds).
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,

    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            idle_ttl_secs: default_idle_ttl(),
            gc_interval_secs: default_gc_interval(),
        }
    }
}

fn default_max_entries() -> usize {
    100_000
}

fn default_idle_ttl() -> u64 {
    300
}

fn default_gc_interval() -> u64 {
    60
}

/// The site behind the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Base URL admitted requests are forwarded to.
    #[serde(default = "default_upstream")]
    pub upstream: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            upstream: default_upstream(),
            connect_timeout_ms: default_connect_timeout(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

fn default_upstream() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_connect_timeout() -> u64 {
    3000
}

fn default_request_timeout() -> u64 {
    30000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Routes that require a signed-in identity. `X/*` covers `X` and
    /// everything below it.
    #[serde(default = "default_protected", deserialize_with = "deserialize_protected")]
    pub protected: Vec<String>,

    #[serde(default = "default_sign_in_path")]
    pub sign_in_path: String,

    #[serde(default = "default_session_cookie")]
    pub session_cookie: String,

    /// Callers under these prefixes get 401 instead of a sign-in redirect.
    #[serde(default = "default_api_prefixes")]
    pub api_prefixes: Vec<String>,

    /// Session token → user id. Stands in for the hosted identity provider.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub sessions: HashMap<String, String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            protected: default_protected(),
            sign_in_path: default_sign_in_path(),
            session_cookie: default_session_cookie(),
            api_prefixes: default_api_prefixes(),
            sessions: HashMap::new(),
        }
    }
}

fn deserialize_protected<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_else(default_protected))
}

fn default_protected() -> Vec<String> {
    ["/admin/*", "/projects/*", "/security-journal/*", "/resources/*"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_sign_in_path() -> String {
    "/sign-in".to_string()
}

fn default_session_cookie() -> String {
    "__session".to_string()
}

fn default_api_prefixes() -> Vec<String> {
    vec!["/api".to_string(), "/trpc".to_string()]
}

/// Which requests the gateway looks at at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatcherConfig {
    /// Framework-internal prefixes that bypass the gateway.
    #[serde(default = "default_skip_prefixes")]
    pub skip_prefixes: Vec<String>,

    /// File extensions treated as static assets (without the dot).
    #[serde(default = "default_static_extensions")]
    pub static_extensions: Vec<String>,

    /// Always guarded, even when the path looks static.
    #[serde(default = "default_api_prefixes")]
    pub always_prefixes: Vec<String>,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            skip_prefixes: default_skip_prefixes(),
            static_extensions: default_static_extensions(),
            always_prefixes: default_api_prefixes(),
        }
    }
}

fn default_skip_prefixes() -> Vec<String> {
    vec!["/_next".to_string()]
}

fn default_static_extensions() -> Vec<String> {
    [
        "html", "htm", "css", "js", "jpg", "jpeg", "webp", "png", "gif", "svg", "ttf", "woff",
        "woff2", "ico", "csv", "doc", "docx", "xls", "xlsx", "zip", "webmanifest",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// One named protection profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub mode: Mode,

    /// Evaluated in declaration order; the first denial decides.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteGuardConfig {
    #[serde(default)]
    pub name: String,

    /// URI pattern. Supports exact match, prefix match (`/api/journal/*`), and `/*` for catch-all.
    pub uri: String,

    /// Methods the guard applies to. Empty means all methods.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub methods: Vec<String>,

    /// Name of the policy to run.
    pub policy: String,
}
