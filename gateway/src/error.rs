use crate::guard::RuleKind;
use http::StatusCode;
use std::fmt;

/// Error taxonomy of the admission layer.
///
/// `Evaluation` / `EvaluationTimeout` are per-request and fail open inside a
/// policy; `Config` is fatal at startup. `BadRequest` is a request the gateway
/// refuses to interpret. Guard denials are not errors: they travel as
/// [`Rejection`](crate::guard::Rejection).
#[derive(Debug, Clone)]
pub enum GatewayError {
    Config(String),
    Evaluation { rule: RuleKind, message: String },
    EvaluationTimeout { rule: RuleKind },
    BadRequest(String),
    Upstream(String),
    UpstreamTimeout,
    Internal(String),
}

impl GatewayError {
    pub fn evaluation(rule: RuleKind, message: impl Into<String>) -> Self {
        GatewayError::Evaluation {
            rule,
            message: message.into(),
        }
    }

    /// Status used when the error ends up as a client response.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Config(_)
            | GatewayError::Evaluation { .. }
            | GatewayError::EvaluationTimeout { .. }
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Config(msg) => write!(f, "config error: {}", msg),
            GatewayError::Evaluation { rule, message } => {
                write!(f, "{} evaluation failed: {}", rule, message)
            }
            GatewayError::EvaluationTimeout { rule } => {
                write!(f, "{} evaluation timed out", rule)
            }
            GatewayError::BadRequest(msg) => write!(f, "bad request: {}", msg),
            GatewayError::Upstream(msg) => write!(f, "upstream error: {}", msg),
            GatewayError::UpstreamTimeout => write!(f, "upstream timed out"),
            GatewayError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_config() {
        assert_eq!(
            GatewayError::Config("guard.key is required".to_string()).to_string(),
            "config error: guard.key is required"
        );
    }

    #[test]
    fn display_evaluation() {
        assert_eq!(
            GatewayError::evaluation(RuleKind::BotDetect, "classifier unreachable").to_string(),
            "bot_detect evaluation failed: classifier unreachable"
        );
    }

    #[test]
    fn display_timeout() {
        assert_eq!(
            GatewayError::EvaluationTimeout {
                rule: RuleKind::Shield
            }
            .to_string(),
            "shield evaluation timed out"
        );
    }

    #[test]
    fn display_bad_request() {
        assert_eq!(
            GatewayError::BadRequest("encoded separator: /a%2Fb".into()).to_string(),
            "bad request: encoded separator: /a%2Fb"
        );
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            GatewayError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::EvaluationTimeout {
                rule: RuleKind::Shield
            }
            .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GatewayError::Upstream("refused".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(GatewayError::UpstreamTimeout.status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
