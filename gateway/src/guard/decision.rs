use super::rule::{Mode, RuleKind};
use http::StatusCode;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    RateLimited,
    BotDetected,
    ShieldBlocked,
    Forbidden,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::RateLimited => "rate_limited",
            DenyReason::BotDetected => "bot_detected",
            DenyReason::ShieldBlocked => "shield_blocked",
            DenyReason::Forbidden => "forbidden",
        }
    }

    pub fn status(self) -> StatusCode {
        match self {
            DenyReason::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            DenyReason::BotDetected | DenyReason::ShieldBlocked | DenyReason::Forbidden => {
                StatusCode::FORBIDDEN
            }
        }
    }

    /// Client-facing error message carried in the JSON body.
    pub fn message(self) -> &'static str {
        match self {
            DenyReason::RateLimited => "Too many requests",
            DenyReason::BotDetected | DenyReason::ShieldBlocked | DenyReason::Forbidden => {
                "Forbidden"
            }
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny(DenyReason),
}

impl Verdict {
    pub fn is_deny(self) -> bool {
        matches!(self, Verdict::Deny(_))
    }

    pub fn reason(self) -> Option<DenyReason> {
        match self {
            Verdict::Allow => None,
            Verdict::Deny(r) => Some(r),
        }
    }
}

/// What an evaluator reports for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub verdict: Verdict,
    /// Tokens left after a token bucket consume.
    pub remaining: Option<f64>,
    /// Time until a denied caller may retry.
    pub retry_after: Option<Duration>,
}

impl Evaluation {
    pub fn allow() -> Self {
        Self {
            verdict: Verdict::Allow,
            remaining: None,
            retry_after: None,
        }
    }

    pub fn deny(reason: DenyReason) -> Self {
        Self {
            verdict: Verdict::Deny(reason),
            remaining: None,
            retry_after: None,
        }
    }
}

/// Per-rule outcome inside a [`Decision`].
///
/// A failed evaluation carries `error` and an `Allow` verdict: errors are
/// never treated as denials.
#[derive(Debug, Clone)]
pub struct RuleResult {
    pub rule: RuleKind,
    pub verdict: Verdict,
    pub error: Option<String>,
    pub remaining: Option<f64>,
    pub retry_after: Option<Duration>,
}

impl RuleResult {
    pub fn from_evaluation(rule: RuleKind, eval: Evaluation) -> Self {
        Self {
            rule,
            verdict: eval.verdict,
            error: None,
            remaining: eval.remaining,
            retry_after: eval.retry_after,
        }
    }

    pub fn errored(rule: RuleKind, error: impl Into<String>) -> Self {
        Self {
            rule,
            verdict: Verdict::Allow,
            error: Some(error.into()),
            remaining: None,
            retry_after: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Result of running a policy against one request.
#[derive(Debug, Clone)]
pub struct Decision {
    pub policy: String,
    pub mode: Mode,
    /// What the caller acts on. Always `Allow` in DRY_RUN.
    pub conclusion: Verdict,
    /// The denial the rules produced, regardless of mode.
    pub would_deny: Option<DenyReason>,
    pub results: Vec<RuleResult>,
}

impl Decision {
    /// Fold rule results into a decision. The first denial in declaration
    /// order wins.
    pub fn from_results(policy: impl Into<String>, mode: Mode, results: Vec<RuleResult>) -> Self {
        let would_deny = results.iter().find_map(|r| r.verdict.reason());
        let conclusion = match (mode, would_deny) {
            (Mode::Live, Some(reason)) => Verdict::Deny(reason),
            _ => Verdict::Allow,
        };
        Self {
            policy: policy.into(),
            mode,
            conclusion,
            would_deny,
            results,
        }
    }

    pub fn is_denied(&self) -> bool {
        self.conclusion.is_deny()
    }

    pub fn is_allowed(&self) -> bool {
        !self.is_denied()
    }

    pub fn reason(&self) -> Option<DenyReason> {
        self.conclusion.reason()
    }

    pub fn has_errors(&self) -> bool {
        self.results.iter().any(RuleResult::is_error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &RuleResult> {
        self.results.iter().filter(|r| r.is_error())
    }

    /// Retry hint of the rule that caused the denial.
    pub fn retry_after(&self) -> Option<Duration> {
        let reason = self.reason()?;
        self.results
            .iter()
            .find(|r| r.verdict == Verdict::Deny(reason))
            .and_then(|r| r.retry_after)
    }
}
