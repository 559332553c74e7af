use crate::guard::{Admission, Decision, Guards, Identity, Rejection, RequestDescriptor};
use crate::proxy::context::{BoxBody, RequestContext, Stage};
use crate::server::GatewayState;
use http::header::{CONNECTION, HOST, TRANSFER_ENCODING};
use http::{HeaderName, HeaderValue, Version};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::Request;
use hyper::Response;
use std::net::SocketAddr;
use tracing::warn;

/// Identity header handed to the site for authenticated requests. Any
/// client-supplied value is dropped before forwarding.
pub static USER_HEADER: HeaderName = HeaderName::from_static("x-rampart-user");

/// Result of a successful pass through the admission pipeline.
#[derive(Debug)]
pub struct Admitted {
    /// Gateway policy that evaluated the request; `None` when bypassed.
    pub policy: Option<String>,
    pub identity: Option<Identity>,
    /// Gateway decision followed by any matching route guard decisions.
    pub decisions: Vec<Decision>,
}

impl Admitted {
    pub fn is_bypass(&self) -> bool {
        self.policy.is_none()
    }
}

/// Gateway admission followed by the route guards.
///
/// Route guards only run for requests the gateway looked at and admitted.
pub async fn admit(guards: &Guards, req: &RequestDescriptor) -> Result<Admitted, Rejection> {
    match guards.gateway.admit(req).await {
        Admission::Bypass => Ok(Admitted {
            policy: None,
            identity: None,
            decisions: Vec::new(),
        }),
        Admission::Rejected(rejection) => Err(rejection),
        Admission::Admitted { decision, identity } => {
            let policy = decision.policy.clone();
            let mut decisions = vec![decision];
            decisions.extend(guards.route_guards.check(req).await?);
            Ok(Admitted {
                policy: Some(policy),
                identity,
                decisions,
            })
        }
    }
}

/// Handle an incoming HTTP request through a phased lifecycle. A path with no
/// unambiguous canonical form is answered with 400 before any phase runs.
///
/// 1. ADMIT:    gateway policy, auth gate, route guards
/// 2. UPSTREAM: forward the admitted request, with its canonical path, to the site
/// 3. LOG:      finalize metrics, access line
pub async fn handle_request(
    req: Request<Incoming>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let (mut parts, body) = req.into_parts();
    let descriptor = match RequestDescriptor::from_parts(&parts, peer_addr, &state.trusted_proxies)
    {
        Ok(d) => d,
        Err(e) => {
            let ctx = RequestContext::new(
                parts.method.as_str().to_string(),
                parts.uri.path().to_string(),
                peer_addr.ip(),
            );
            warn!("proxy: {}", e);
            let resp = ctx.error_response(e.status(), "Bad request");
            phase_log(&ctx, &resp);
            return Ok(resp);
        }
    };

    let mut ctx = RequestContext::new(
        parts.method.as_str().to_string(),
        descriptor.path.clone(),
        descriptor.source,
    );

    let admitted = match phase_admit(&mut ctx, &state, &descriptor).await {
        Ok(a) => a,
        Err(resp) => {
            phase_log(&ctx, &resp);
            return Ok(resp);
        }
    };

    let host = parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    parts.headers.remove(&USER_HEADER);
    if let Some(identity) = &admitted.identity {
        if let Ok(v) = HeaderValue::from_str(&identity.user_id) {
            parts.headers.insert(USER_HEADER.clone(), v);
        }
    }
    remove_hop_headers(&mut parts.headers);
    inject_forwarded_headers(&mut parts.headers, peer_addr, &host);

    let resp = match phase_upstream(&mut ctx, &state, &descriptor, parts, body).await {
        Ok(upstream_resp) => build_downstream_response(upstream_resp),
        Err(resp) => resp,
    };

    phase_log(&ctx, &resp);
    Ok(resp)
}

async fn phase_admit(
    ctx: &mut RequestContext,
    state: &GatewayState,
    descriptor: &RequestDescriptor,
) -> Result<Admitted, Response<BoxBody>> {
    match admit(&state.guards, descriptor).await {
        Ok(admitted) => {
            ctx.stage = if admitted.is_bypass() {
                Stage::Bypass
            } else {
                Stage::Upstream
            };
            if let Some(policy) = &admitted.policy {
                ctx.policy = policy.clone();
            }
            ctx.user_id = admitted.identity.as_ref().map(|i| i.user_id.clone());
            Ok(admitted)
        }
        Err(rejection) => {
            ctx.stage = match rejection.stage() {
                "auth" => Stage::Auth,
                _ => Stage::Guard,
            };
            ctx.policy = match &rejection {
                Rejection::Denied { policy, .. } => policy.clone(),
                _ => state.guards.gateway.policy().name().to_string(),
            };
            Err(ctx.rejection_response(&rejection))
        }
    }
}

async fn phase_upstream(
    ctx: &mut RequestContext,
    state: &GatewayState,
    descriptor: &RequestDescriptor,
    mut parts: http::request::Parts,
    body: Incoming,
) -> Result<Response<Incoming>, Response<BoxBody>> {
    // The site gets the canonical path the guards matched, never the raw one.
    parts.uri = match state.site.target_uri(&descriptor.path_and_query()) {
        Ok(uri) => uri,
        Err(e) => {
            warn!("proxy: {}, path={}", e, ctx.uri_path);
            return Err(ctx.error_response(e.status(), "internal server error"));
        }
    };
    // The site client speaks HTTP/1.1 regardless of the inbound protocol.
    parts.version = Version::HTTP_11;

    let upstream_req = Request::from_parts(parts, body.boxed());

    ctx.upstream_start = Some(std::time::Instant::now());
    match state.site.send(upstream_req).await {
        Ok(resp) => Ok(resp),
        Err(e) => {
            warn!(
                "proxy: upstream request failed, upstream={}, path={}, error={}",
                state.site.base(),
                ctx.uri_path,
                e
            );
            let msg = match e {
                crate::error::GatewayError::UpstreamTimeout => "gateway timeout",
                _ => "bad gateway",
            };
            Err(ctx.error_response(e.status(), msg))
        }
    }
}

fn phase_log(ctx: &RequestContext, resp: &Response<BoxBody>) {
    let resp_status = resp.status().as_u16();
    ctx.finalize_metrics(resp_status);

    // Structured access log, one line per request at info level.
    let total_ms = ctx.start.elapsed().as_millis();
    let upstream_ms = ctx
        .upstream_start
        .map(|s| s.elapsed().as_millis())
        .unwrap_or(0);

    tracing::info!(
        client_ip = %ctx.client_ip,
        method = %ctx.method,
        path = %ctx.uri_path,
        status = resp_status,
        stage = ctx.stage.as_str(),
        policy = %ctx.policy,
        user_id = ctx.user_id.as_deref().unwrap_or(""),
        latency_ms = %total_ms,
        upstream_ms = %upstream_ms,
        "access"
    );
}

fn build_downstream_response(upstream_resp: Response<Incoming>) -> Response<BoxBody> {
    let (parts, body) = upstream_resp.into_parts();
    let mut resp = Response::new(body.boxed());
    *resp.status_mut() = parts.status;
    *resp.headers_mut() = parts.headers;
    remove_hop_headers(resp.headers_mut());
    resp
}

fn remove_hop_headers(headers: &mut http::HeaderMap) {
    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];

    for h in hop_headers {
        headers.remove(h);
    }
}

/// Inject standard `X-Forwarded-*` and `X-Real-IP` headers so the site can
/// identify the original client and protocol.
///
/// - `X-Forwarded-For`: append the TCP peer IP to any existing value.
/// - `X-Forwarded-Proto`: keep an incoming value, otherwise `http`.
/// - `X-Forwarded-Host`: the original `Host` header value.
/// - `X-Real-IP`: the TCP peer IP, always overwritten.
fn inject_forwarded_headers(
    headers: &mut http::HeaderMap,
    peer_addr: SocketAddr,
    original_host: &str,
) {
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
    static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");
    static XRI: HeaderName = HeaderName::from_static("x-real-ip");

    let peer_ip = peer_addr.ip().to_string();

    if let Some(existing) = headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        let mut combined = String::with_capacity(existing.len() + 2 + peer_ip.len());
        combined.push_str(existing);
        combined.push_str(", ");
        combined.push_str(&peer_ip);
        if let Ok(v) = HeaderValue::from_str(&combined) {
            headers.insert(XFF.clone(), v);
        }
    } else if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XFF.clone(), v);
    }

    if !headers.contains_key(&XFP) {
        headers.insert(XFP.clone(), HeaderValue::from_static("http"));
    }

    if !original_host.is_empty() {
        if let Ok(v) = HeaderValue::from_str(original_host) {
            headers.insert(XFH.clone(), v);
        }
    }

    if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XRI.clone(), v);
    }
}
