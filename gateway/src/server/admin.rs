use super::GatewayState;
use crate::proxy::{full_body, BoxBody};
use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};
use hyper::{Request, Response};

fn respond(status: StatusCode, content_type: &'static str, body: String) -> Response<BoxBody> {
    let mut resp = Response::new(full_body(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

fn json<T: serde::Serialize>(value: &T) -> Response<BoxBody> {
    let body = serde_json::to_string_pretty(value).unwrap_or_default();
    respond(StatusCode::OK, "application/json", body)
}

pub fn handle_admin<B>(
    req: Request<B>,
    state: GatewayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let resp = match req.uri().path() {
        "/health" | "/healthz" => respond(
            StatusCode::OK,
            "application/json",
            r#"{"status":"ok"}"#.to_string(),
        ),

        "/ready" | "/readyz" => {
            let guards = &state.guards;
            let body = serde_json::json!({
                "status": "ready",
                "gateway_policy": guards.gateway.policy().name(),
                "mode": guards.gateway.policy().mode(),
                "policies": guards.policies.len(),
                "route_guards": guards.route_guards.len(),
                "upstream": state.site.base(),
            });
            respond(StatusCode::OK, "application/json", body.to_string())
        }

        "/metrics" => respond(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            state.metrics.render(),
        ),

        "/policies" => json(&state.guards.policy_summaries()),

        "/route-guards" => json(&state.guards.route_guards.summaries()),

        "/protected" => json(&state.guards.gateway.auth().protected_patterns()),

        _ => respond(
            StatusCode::NOT_FOUND,
            "application/json",
            r#"{"error":"not found"}"#.to_string(),
        ),
    };
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayConfig, RouteGuardConfig};
    use crate::metrics::Metrics;
    use crate::proxy::empty_body;
    use http_body_util::BodyExt;

    fn state() -> GatewayState {
        let mut cfg = GatewayConfig::default();
        cfg.guard.key = Some("ajkey_test".into());
        cfg.route_guards.push(RouteGuardConfig {
            name: "chat".into(),
            uri: "/api/chat".into(),
            methods: vec!["POST".into()],
            policy: "strict".into(),
        });
        GatewayState::new(cfg, Metrics::standalone()).unwrap()
    }

    async fn get(path: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(path).body(empty_body()).unwrap();
        let resp = handle_admin(req, state()).unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_healthz() {
        let (status, body) = get("/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_readyz_reports_gateway_policy() {
        let (status, body) = get("/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["gateway_policy"], "default");
        assert_eq!(body["mode"], "LIVE");
        assert_eq!(body["policies"], 4);
        assert_eq!(body["route_guards"], 1);
    }

    #[tokio::test]
    async fn test_policies_listing() {
        let (_, body) = get("/policies").await;
        let names: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["default", "minimal", "public", "strict"]);
    }

    #[tokio::test]
    async fn test_route_guards_listing() {
        let (_, body) = get("/route-guards").await;
        assert_eq!(body[0]["name"], "chat");
        assert_eq!(body[0]["policy"], "strict");
        assert_eq!(body[0]["methods"][0], "POST");
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let (status, body) = get("/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not found");
    }
}
