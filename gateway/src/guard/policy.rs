use super::decision::{Decision, RuleResult};
use super::evaluator::{BotEvaluator, RuleEvaluator, ShieldEvaluator, TokenBucketEvaluator};
use super::limiter::{LimiterSettings, TokenBucketLimiter};
use super::request::RequestDescriptor;
use super::rule::{Mode, Rule, RuleKind};
use crate::config::PolicyConfig;
use crate::error::GatewayError;
use futures_util::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared knobs for compiling policies.
#[derive(Debug, Clone, Copy)]
pub struct PolicyContext {
    pub evaluator_timeout: Duration,
    pub limiter: LimiterSettings,
}

impl Default for PolicyContext {
    fn default() -> Self {
        Self {
            evaluator_timeout: Duration::from_millis(500),
            limiter: LimiterSettings::default(),
        }
    }
}

/// An ordered, named bundle of rule evaluators under one mode.
///
/// Read-only after construction; the only mutable state lives inside the
/// token bucket limiters it owns.
pub struct GuardPolicy {
    name: String,
    mode: Mode,
    rules: Vec<Rule>,
    evaluators: Vec<Arc<dyn RuleEvaluator>>,
    limiters: Vec<Arc<TokenBucketLimiter>>,
    timeout: Duration,
}

/// Listing entry for the admin API.
#[derive(Debug, Serialize)]
pub struct PolicySummary {
    pub name: String,
    pub mode: Mode,
    pub rules: Vec<Rule>,
    pub evaluators: Vec<RuleKind>,
}

impl GuardPolicy {
    pub fn new(
        name: impl Into<String>,
        mode: Mode,
        evaluators: Vec<Arc<dyn RuleEvaluator>>,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            mode,
            rules: Vec::new(),
            evaluators,
            limiters: Vec::new(),
            timeout,
        }
    }

    /// Build evaluators for every configured rule. Each `TokenBucket` rule
    /// gets its own limiter, so two policies never share buckets.
    pub fn compile(
        name: &str,
        config: &PolicyConfig,
        ctx: &PolicyContext,
    ) -> Result<Self, GatewayError> {
        let mut evaluators: Vec<Arc<dyn RuleEvaluator>> = Vec::with_capacity(config.rules.len());
        let mut limiters = Vec::new();

        for rule in &config.rules {
            match rule {
                Rule::Shield => evaluators.push(Arc::new(ShieldEvaluator::new()?)),
                Rule::BotDetect { allow } => {
                    evaluators.push(Arc::new(BotEvaluator::new(allow.clone())?))
                }
                Rule::TokenBucket(tb) => {
                    if tb.capacity == 0 || tb.refill_rate == 0 || tb.interval == 0 {
                        return Err(GatewayError::Config(format!(
                            "policy '{}': token_bucket requires capacity, refill_rate and interval > 0",
                            name
                        )));
                    }
                    let limiter = Arc::new(TokenBucketLimiter::with_settings(*tb, ctx.limiter));
                    limiters.push(limiter.clone());
                    evaluators.push(Arc::new(TokenBucketEvaluator::new(limiter)));
                }
            }
        }

        tracing::debug!(
            "guard: compiled policy, name={}, mode={}, rules={}",
            name,
            config.mode.as_str(),
            config.rules.len()
        );

        Ok(Self {
            name: name.to_string(),
            mode: config.mode,
            rules: config.rules.clone(),
            evaluators,
            limiters,
            timeout: ctx.evaluator_timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn limiters(&self) -> &[Arc<TokenBucketLimiter>] {
        &self.limiters
    }

    pub fn summary(&self) -> PolicySummary {
        PolicySummary {
            name: self.name.clone(),
            mode: self.mode,
            rules: self.rules.clone(),
            evaluators: self.evaluators.iter().map(|e| e.kind()).collect(),
        }
    }

    /// Run every rule and fold the results.
    ///
    /// Rules run concurrently; `results` keeps declaration order. A rule that
    /// errors or times out is logged and counted, then treated as Allow.
    pub async fn evaluate(&self, req: &RequestDescriptor) -> Decision {
        let results = join_all(self.evaluators.iter().map(|e| self.run_rule(e.as_ref(), req))).await;
        let decision = Decision::from_results(self.name.as_str(), self.mode, results);
        self.record(&decision, req);
        decision
    }

    async fn run_rule(&self, evaluator: &dyn RuleEvaluator, req: &RequestDescriptor) -> RuleResult {
        let rule = evaluator.kind();
        let start = Instant::now();
        let outcome = match tokio::time::timeout(self.timeout, evaluator.evaluate(req)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::EvaluationTimeout { rule }),
        };
        metrics::histogram!("guard_rule_duration_seconds", "rule" => rule.as_str())
            .record(start.elapsed().as_secs_f64());

        match outcome {
            Ok(eval) => RuleResult::from_evaluation(rule, eval),
            Err(err) => {
                metrics::counter!(
                    "guard_rule_errors_total",
                    "policy" => self.name.clone(),
                    "rule" => rule.as_str()
                )
                .increment(1);
                tracing::warn!(
                    policy = %self.name,
                    rule = rule.as_str(),
                    source = %req.source,
                    path = %req.path,
                    error = %err,
                    "guard rule failed, failing open"
                );
                RuleResult::errored(rule, err.to_string())
            }
        }
    }

    fn record(&self, decision: &Decision, req: &RequestDescriptor) {
        let (conclusion, reason) = match decision.reason() {
            Some(r) => ("deny", r.as_str()),
            None => ("allow", "none"),
        };
        metrics::counter!(
            "guard_decisions_total",
            "policy" => self.name.clone(),
            "conclusion" => conclusion,
            "reason" => reason
        )
        .increment(1);

        let Some(would_deny) = decision.would_deny else {
            return;
        };
        match self.mode {
            Mode::Live => tracing::info!(
                policy = %self.name,
                reason = would_deny.as_str(),
                source = %req.source,
                method = %req.method,
                path = %req.path,
                "request denied"
            ),
            Mode::DryRun => {
                metrics::counter!(
                    "guard_dry_run_denials_total",
                    "policy" => self.name.clone(),
                    "reason" => would_deny.as_str()
                )
                .increment(1);
                tracing::info!(
                    policy = %self.name,
                    reason = would_deny.as_str(),
                    source = %req.source,
                    method = %req.method,
                    path = %req.path,
                    "dry run: request would have been denied"
                );
            }
        }
    }
}
