use crate::error::GatewayError;
use crate::routing::canonical_path;
use http::header::{AUTHORIZATION, COOKIE, USER_AGENT};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use ipnetwork::IpNetwork;
use std::net::{IpAddr, SocketAddr};

/// Everything the guard layer looks at for one inbound request.
///
/// Ephemeral: built by the proxy per request and dropped once admission is
/// decided.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub source: IpAddr,
    pub method: Method,
    /// Canonical path: what the matchers see and what the site receives.
    pub path: String,
    /// Path exactly as the client sent it, for attack-signature scanning.
    pub raw_path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
}

impl RequestDescriptor {
    pub fn new(source: IpAddr, method: Method, path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            source,
            method,
            raw_path: path.clone(),
            path,
            query: None,
            headers: HeaderMap::new(),
        }
    }

    /// Build from an incoming request head.
    ///
    /// The source is the TCP peer unless the peer is a trusted proxy, in which
    /// case the left-most valid `X-Forwarded-For` entry is used. Fails with
    /// `BadRequest` when the path has no unambiguous canonical form.
    pub fn from_parts(
        parts: &http::request::Parts,
        peer_addr: SocketAddr,
        trusted_proxies: &[IpNetwork],
    ) -> Result<Self, GatewayError> {
        let raw_path = parts.uri.path();
        let path = canonical_path(raw_path)?;
        let source = resolve_source(&parts.headers, peer_addr.ip(), trusted_proxies);
        Ok(Self {
            source,
            method: parts.method.clone(),
            path,
            raw_path: raw_path.to_string(),
            query: parts.uri.query().map(str::to_owned),
            headers: parts.headers.clone(),
        })
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(v) = HeaderValue::from_str(value) {
            self.headers.insert(HeaderName::from_static(name), v);
        }
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Value of a named cookie, if present.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v)
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(q) if !q.is_empty() => format!("{}?{}", self.path, q),
            _ => self.path.clone(),
        }
    }

    /// API-style callers get status codes instead of browser redirects.
    pub fn is_api_call(&self, api_prefixes: &[String]) -> bool {
        if api_prefixes.iter().any(|p| has_path_prefix(&self.path, p)) {
            return true;
        }
        let accept = self.header("accept").unwrap_or("");
        accept.contains("application/json") && !accept.contains("text/html")
    }
}

/// `prefix` matches the path itself or any sub-path, never a sibling
/// (`/api` matches `/api/x` but not `/apix`).
pub fn has_path_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

fn resolve_source(headers: &HeaderMap, peer_ip: IpAddr, trusted_proxies: &[IpNetwork]) -> IpAddr {
    if !trusted_proxies.iter().any(|net| net.contains(peer_ip)) {
        return peer_ip;
    }
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse::<IpAddr>().ok())
        .unwrap_or(peer_ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn parts(uri: &str, headers: &[(&'static str, &str)]) -> http::request::Parts {
        let mut builder = http::Request::builder().method("GET").uri(uri);
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn peer(a: u8, b: u8, c: u8, d: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), 40000)
    }

    #[test]
    fn test_untrusted_peer_cannot_spoof_source() {
        let p = parts("/api/journal", &[("x-forwarded-for", "1.2.3.4")]);
        let req = RequestDescriptor::from_parts(&p, peer(203, 0, 113, 9), &[]).unwrap();
        assert_eq!(req.source, IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)));
    }

    #[test]
    fn test_trusted_proxy_uses_forwarded_for() {
        let trusted: Vec<IpNetwork> = vec!["10.0.0.0/8".parse().unwrap()];
        let p = parts("/", &[("x-forwarded-for", "198.51.100.7, 10.0.0.2")]);
        let req = RequestDescriptor::from_parts(&p, peer(10, 0, 0, 2), &trusted).unwrap();
        assert_eq!(req.source, IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)));
    }

    #[test]
    fn test_trusted_proxy_with_garbage_header_falls_back() {
        let trusted: Vec<IpNetwork> = vec!["10.0.0.0/8".parse().unwrap()];
        let p = parts("/", &[("x-forwarded-for", "not-an-ip")]);
        let req = RequestDescriptor::from_parts(&p, peer(10, 1, 1, 1), &trusted).unwrap();
        assert_eq!(req.source, IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1)));
    }

    #[test]
    fn test_path_and_query_split() {
        let p = parts("/projects/x?tab=notes", &[]);
        let req = RequestDescriptor::from_parts(&p, peer(127, 0, 0, 1), &[]).unwrap();
        assert_eq!(req.path, "/projects/x");
        assert_eq!(req.query.as_deref(), Some("tab=notes"));
        assert_eq!(req.path_and_query(), "/projects/x?tab=notes");
    }

    #[test]
    fn test_path_is_canonicalized_raw_path_kept() {
        let p = parts("//%61dmin/./posts/?tab=draft", &[]);
        let req = RequestDescriptor::from_parts(&p, peer(127, 0, 0, 1), &[]).unwrap();
        assert_eq!(req.path, "/admin/posts");
        assert_eq!(req.raw_path, "//%61dmin/./posts/");
        assert_eq!(req.path_and_query(), "/admin/posts?tab=draft");
    }

    #[test]
    fn test_encoded_slash_is_bad_request() {
        let p = parts("/admin%2Fposts", &[]);
        match RequestDescriptor::from_parts(&p, peer(127, 0, 0, 1), &[]) {
            Err(GatewayError::BadRequest(_)) => {}
            other => panic!("expected bad request, got {:?}", other.map(|r| r.path)),
        }
    }

    #[test]
    fn test_cookie_and_bearer() {
        let req = RequestDescriptor::new(IpAddr::V4(Ipv4Addr::LOCALHOST), Method::GET, "/")
            .with_header("cookie", "theme=dark; __session=abc123; other=1")
            .with_header("authorization", "Bearer tok-1");
        assert_eq!(req.cookie("__session"), Some("abc123"));
        assert_eq!(req.cookie("missing"), None);
        assert_eq!(req.bearer_token(), Some("tok-1"));
    }

    #[test]
    fn test_blank_user_agent_is_none() {
        let req = RequestDescriptor::new(IpAddr::V4(Ipv4Addr::LOCALHOST), Method::GET, "/")
            .with_header("user-agent", "   ");
        assert_eq!(req.user_agent(), None);
    }

    #[test]
    fn test_path_prefix_boundaries() {
        assert!(has_path_prefix("/api", "/api"));
        assert!(has_path_prefix("/api/journal/1", "/api"));
        assert!(has_path_prefix("/api/journal", "/api/"));
        assert!(!has_path_prefix("/apix", "/api"));
        assert!(!has_path_prefix("/", "/api"));
    }

    #[test]
    fn test_api_call_detection() {
        let api = vec!["/api".to_string(), "/trpc".to_string()];
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert!(RequestDescriptor::new(ip, Method::GET, "/api/chat").is_api_call(&api));
        assert!(!RequestDescriptor::new(ip, Method::GET, "/admin").is_api_call(&api));
        assert!(RequestDescriptor::new(ip, Method::GET, "/admin")
            .with_header("accept", "application/json")
            .is_api_call(&api));
        assert!(!RequestDescriptor::new(ip, Method::GET, "/admin")
            .with_header("accept", "text/html,application/json")
            .is_api_call(&api));
    }
}
