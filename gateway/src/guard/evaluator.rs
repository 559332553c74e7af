use super::bot::{BotClassifier, Client};
use super::decision::{DenyReason, Evaluation};
use super::limiter::TokenBucketLimiter;
use super::request::RequestDescriptor;
use super::rule::{BotCategory, Characteristics, RuleKind};
use super::shield::Shield;
use crate::error::GatewayError;
use async_trait::async_trait;
use std::sync::Arc;

/// One independent protection rule, ready to run against requests.
///
/// `Err` means the evaluator could not reach a verdict (service down, timeout).
/// It is never a denial; the policy fails open on it.
#[async_trait]
pub trait RuleEvaluator: Send + Sync {
    fn kind(&self) -> RuleKind;

    async fn evaluate(&self, req: &RequestDescriptor) -> Result<Evaluation, GatewayError>;
}

pub struct ShieldEvaluator {
    shield: Shield,
}

impl ShieldEvaluator {
    pub fn new() -> Result<Self, GatewayError> {
        Ok(Self {
            shield: Shield::compiled()?,
        })
    }
}

#[async_trait]
impl RuleEvaluator for ShieldEvaluator {
    fn kind(&self) -> RuleKind {
        RuleKind::Shield
    }

    async fn evaluate(&self, req: &RequestDescriptor) -> Result<Evaluation, GatewayError> {
        match self.shield.scan(req) {
            Some(sig) => {
                tracing::debug!(signature = sig.as_str(), path = %req.raw_path, "shield match");
                Ok(Evaluation::deny(DenyReason::ShieldBlocked))
            }
            None => Ok(Evaluation::allow()),
        }
    }
}

pub struct BotEvaluator {
    classifier: BotClassifier,
    allow: Vec<BotCategory>,
}

impl BotEvaluator {
    pub fn new(allow: Vec<BotCategory>) -> Result<Self, GatewayError> {
        Ok(Self {
            classifier: BotClassifier::compiled()?,
            allow,
        })
    }
}

#[async_trait]
impl RuleEvaluator for BotEvaluator {
    fn kind(&self) -> RuleKind {
        RuleKind::BotDetect
    }

    async fn evaluate(&self, req: &RequestDescriptor) -> Result<Evaluation, GatewayError> {
        match self.classifier.classify(req.user_agent()) {
            Client::Human => Ok(Evaluation::allow()),
            Client::Bot(cat) if self.allow.contains(&cat) => Ok(Evaluation::allow()),
            Client::Bot(cat) => {
                tracing::debug!(category = cat.as_str(), "bot denied");
                Ok(Evaluation::deny(DenyReason::BotDetected))
            }
        }
    }
}

pub struct TokenBucketEvaluator {
    limiter: Arc<TokenBucketLimiter>,
}

impl TokenBucketEvaluator {
    pub fn new(limiter: Arc<TokenBucketLimiter>) -> Self {
        Self { limiter }
    }

    pub fn limiter(&self) -> &Arc<TokenBucketLimiter> {
        &self.limiter
    }

    fn key(&self, req: &RequestDescriptor) -> String {
        match self.limiter.rule().characteristics {
            Characteristics::Source => req.source.to_string(),
            Characteristics::SourcePath => {
                let ip = req.source.to_string();
                let mut s = String::with_capacity(ip.len() + 1 + req.path.len());
                s.push_str(&ip);
                s.push(':');
                s.push_str(&req.path);
                s
            }
        }
    }
}

#[async_trait]
impl RuleEvaluator for TokenBucketEvaluator {
    fn kind(&self) -> RuleKind {
        RuleKind::TokenBucket
    }

    async fn evaluate(&self, req: &RequestDescriptor) -> Result<Evaluation, GatewayError> {
        let key = self.key(req);
        let consumed = self.limiter.consume(&key).await;
        Ok(Evaluation {
            verdict: consumed.verdict,
            remaining: Some(consumed.remaining),
            retry_after: consumed.retry_after,
        })
    }
}
