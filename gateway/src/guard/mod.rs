//! Request admission control: attack shield, bot detection, token-bucket
//! rate limiting, named policies, and the gateway / route guard composition
//! with the auth gate.

pub mod auth;
pub mod bot;
pub mod decision;
pub mod evaluator;
pub mod gateway;
pub mod limiter;
pub mod policy;
pub mod request;
pub mod rule;
pub mod shield;

pub use auth::{AuthFailure, AuthGate, AuthOutcome, Identity, SessionVerifier, StaticSessions};
pub use bot::{BotClassifier, Client};
pub use decision::{Decision, DenyReason, Evaluation, RuleResult, Verdict};
pub use evaluator::{BotEvaluator, RuleEvaluator, ShieldEvaluator, TokenBucketEvaluator};
pub use gateway::{Admission, Gateway, Guards, Rejection, RouteGuard, RouteGuards};
pub use limiter::{BucketState, Consumed, LimiterSettings, TokenBucketLimiter};
pub use policy::{GuardPolicy, PolicyContext, PolicySummary};
pub use request::{has_path_prefix, RequestDescriptor};
pub use rule::{BotCategory, Characteristics, Mode, Rule, RuleKind, TokenBucketRule};
pub use shield::{Shield, Signature};
