use crate::config::MatcherConfig;
use crate::error::GatewayError;
use crate::guard::has_path_prefix;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use regex::Regex;

/// Decides which requests the gateway looks at at all.
///
/// Matching order:
/// 1. Always-included prefixes (`/api`, `/trpc`) are guarded, whatever they look like.
/// 2. Framework-internal prefixes (`/_next`) bypass.
/// 3. Paths ending in a static-asset extension bypass. `.json` is not static.
pub struct GatewayMatcher {
    skip_prefixes: Vec<String>,
    always_prefixes: Vec<String>,
    static_ext: Option<Regex>,
}

impl GatewayMatcher {
    pub fn new(config: &MatcherConfig) -> Result<Self, GatewayError> {
        let static_ext = if config.static_extensions.is_empty() {
            None
        } else {
            let alternation = config
                .static_extensions
                .iter()
                .map(|e| regex::escape(e.trim_start_matches('.')))
                .collect::<Vec<_>>()
                .join("|");
            let re = Regex::new(&format!(r"(?i)\.(?:{})$", alternation))
                .map_err(|e| GatewayError::Config(format!("invalid static extension list: {}", e)))?;
            Some(re)
        };
        Ok(Self {
            skip_prefixes: config.skip_prefixes.clone(),
            always_prefixes: config.always_prefixes.clone(),
            static_ext,
        })
    }

    pub fn should_guard(&self, path: &str) -> bool {
        if self.always_prefixes.iter().any(|p| has_path_prefix(path, p)) {
            return true;
        }
        if self.skip_prefixes.iter().any(|p| has_path_prefix(path, p)) {
            return false;
        }
        match &self.static_ext {
            Some(re) => !re.is_match(path),
            None => true,
        }
    }
}

/// A set of URI patterns compiled to one glob set.
///
/// Supported patterns: exact (`/sign-in`), prefix (`/admin/*`, which also
/// matches `/admin` itself), `/*` for catch-all, and any other glob where `*`
/// stays within one path segment and `**` crosses segments.
#[derive(Debug, Clone)]
pub struct PathPatterns {
    set: GlobSet,
    patterns: Vec<String>,
}

impl PathPatterns {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, GatewayError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            if !pattern.starts_with('/') {
                return Err(GatewayError::Config(format!(
                    "route pattern '{}' must start with '/'",
                    pattern
                )));
            }
            for glob in expand(pattern) {
                let compiled = GlobBuilder::new(&glob)
                    .literal_separator(true)
                    .build()
                    .map_err(|e| {
                        GatewayError::Config(format!("invalid route pattern '{}': {}", pattern, e))
                    })?;
                builder.add(compiled);
            }
        }
        let set = builder
            .build()
            .map_err(|e| GatewayError::Config(format!("failed to compile route patterns: {}", e)))?;
        Ok(Self {
            set,
            patterns: patterns.iter().map(|p| p.as_ref().to_string()).collect(),
        })
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.set.is_match(path)
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// `/x/*` → `/x` + `/x/**`; `/*` → `/` + `/**`.
fn expand(pattern: &str) -> Vec<String> {
    match pattern.strip_suffix("/*") {
        Some("") => vec!["/".to_string(), "/**".to_string()],
        Some(base) => vec![base.to_string(), format!("{}/**", base)],
        None => vec![pattern.to_string()],
    }
}

/// Method filter for route guards. Empty means all methods.
#[derive(Debug, Clone, Default)]
pub struct MethodFilter {
    methods: Vec<String>,
}

impl MethodFilter {
    pub fn new(methods: &[String]) -> Self {
        Self {
            methods: methods.iter().map(|m| m.to_ascii_uppercase()).collect(),
        }
    }

    pub fn allows(&self, method: &http::Method) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| m == method.as_str())
    }

    pub fn methods(&self) -> &[String] {
        &self.methods
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns(p: &[&str]) -> PathPatterns {
        PathPatterns::new(p).unwrap()
    }

    #[test]
    fn test_gateway_skips_static_and_internal() {
        let m = GatewayMatcher::new(&MatcherConfig::default()).unwrap();
        assert!(!m.should_guard("/_next/static/chunks/main.js"));
        assert!(!m.should_guard("/favicon.ico"));
        assert!(!m.should_guard("/images/hero.WEBP"));
        assert!(!m.should_guard("/fonts/inter.woff2"));
        assert!(!m.should_guard("/site.webmanifest"));
        assert!(!m.should_guard("/cv.docx"));
    }

    #[test]
    fn test_gateway_guards_pages_and_json() {
        let m = GatewayMatcher::new(&MatcherConfig::default()).unwrap();
        assert!(m.should_guard("/"));
        assert!(m.should_guard("/projects/rampart"));
        assert!(m.should_guard("/feed.json"));
        assert!(m.should_guard("/security-journal"));
    }

    #[test]
    fn test_gateway_always_guards_api() {
        let m = GatewayMatcher::new(&MatcherConfig::default()).unwrap();
        assert!(m.should_guard("/api/export.csv"));
        assert!(m.should_guard("/trpc/journal.list"));
        assert!(m.should_guard("/api/chat"));
    }

    #[test]
    fn test_prefix_pattern_includes_base() {
        let p = patterns(&["/admin/*"]);
        assert!(p.is_match("/admin"));
        assert!(p.is_match("/admin/"));
        assert!(p.is_match("/admin/reviews"));
        assert!(p.is_match("/admin/reviews/42"));
        assert!(!p.is_match("/administrator"));
        assert!(!p.is_match("/"));
    }

    #[test]
    fn test_exact_pattern() {
        let p = patterns(&["/api/journal"]);
        assert!(p.is_match("/api/journal"));
        assert!(!p.is_match("/api/journal/1"));
    }

    #[test]
    fn test_single_star_stays_in_segment() {
        let p = patterns(&["/api/journal/*/delete"]);
        assert!(p.is_match("/api/journal/7/delete"));
        assert!(!p.is_match("/api/journal/7/8/delete"));
    }

    #[test]
    fn test_catch_all() {
        let p = patterns(&["/*"]);
        assert!(p.is_match("/"));
        assert!(p.is_match("/anything/at/all"));
    }

    #[test]
    fn test_relative_pattern_rejected() {
        assert!(PathPatterns::new(&["admin/*"]).is_err());
    }

    #[test]
    fn test_method_filter() {
        let any = MethodFilter::new(&[]);
        assert!(any.allows(&http::Method::PATCH));

        let writes = MethodFilter::new(&["post".to_string(), "DELETE".to_string()]);
        assert!(writes.allows(&http::Method::POST));
        assert!(writes.allows(&http::Method::DELETE));
        assert!(!writes.allows(&http::Method::GET));
    }
}
