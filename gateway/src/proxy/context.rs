use crate::guard::Rejection;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};
use http_body_util::{BodyExt, Full};
use std::net::IpAddr;
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Pipeline stage a request ended in, for metrics and the access log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    /// Static asset or framework path: forwarded without guard or auth.
    Bypass,
    Guard,
    Auth,
    Upstream,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Bypass => "bypass",
            Stage::Guard => "guard",
            Stage::Auth => "auth",
            Stage::Upstream => "upstream",
        }
    }
}

pub struct RequestContext {
    pub method: String,
    pub uri_path: String,
    pub client_ip: IpAddr,
    /// Gateway policy that admitted or rejected the request.
    pub policy: String,
    pub stage: Stage,
    pub user_id: Option<String>,
    pub start: Instant,
    pub upstream_start: Option<Instant>,
}

impl RequestContext {
    pub fn new(method: String, uri_path: String, client_ip: IpAddr) -> Self {
        metrics::gauge!("gateway_http_requests_in_flight").increment(1.0);
        Self {
            method,
            uri_path,
            client_ip,
            policy: String::new(),
            stage: Stage::Received,
            user_id: None,
            start: Instant::now(),
            upstream_start: None,
        }
    }

    pub fn error_response(&self, status: StatusCode, msg: &str) -> hyper::Response<BoxBody> {
        let body = serde_json::json!({ "error": msg }).to_string();
        let mut resp = hyper::Response::new(full_body(body));
        *resp.status_mut() = status;
        resp.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        resp
    }

    /// Response for a guard or auth rejection. Nothing downstream runs.
    pub fn rejection_response(&self, rejection: &Rejection) -> hyper::Response<BoxBody> {
        let body = match rejection.body() {
            Some(b) => full_body(b),
            None => empty_body(),
        };
        let mut resp = hyper::Response::new(body);
        *resp.status_mut() = rejection.status();
        for (name, value) in rejection.headers() {
            resp.headers_mut().insert(name, value);
        }
        resp
    }

    pub fn finalize_metrics(&self, resp_status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(resp_status);

        metrics::counter!(
            "gateway_http_requests_total",
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
            "stage" => self.stage.as_str(),
        )
        .increment(1);

        metrics::histogram!(
            "gateway_http_request_duration_seconds",
            "stage" => self.stage.as_str(),
        )
        .record(self.start.elapsed().as_secs_f64());

        if let Some(upstream_start) = self.upstream_start {
            metrics::histogram!("gateway_upstream_request_duration_seconds")
                .record(upstream_start.elapsed().as_secs_f64());
        }

        metrics::gauge!("gateway_http_requests_in_flight").decrement(1.0);
    }
}
