use serde::{Deserialize, Serialize};
use std::fmt;

/// Enforcement mode of a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    #[default]
    Live,
    /// Compute decisions and record would-be denials, but never block.
    DryRun,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Live => "LIVE",
            Mode::DryRun => "DRY_RUN",
        }
    }
}

/// One protection rule. Built once from configuration, shared read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rule {
    /// Attack-signature filtering (injection, XSS, traversal).
    Shield,
    BotDetect {
        /// Bot categories that are let through. Empty denies every detected bot.
        #[serde(default)]
        allow: Vec<BotCategory>,
    },
    TokenBucket(TokenBucketRule),
}

impl Rule {
    pub fn kind(&self) -> RuleKind {
        match self {
            Rule::Shield => RuleKind::Shield,
            Rule::BotDetect { .. } => RuleKind::BotDetect,
            Rule::TokenBucket(_) => RuleKind::TokenBucket,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Shield,
    BotDetect,
    TokenBucket,
    /// Evaluators supplied by callers (stubs, remote services).
    Custom,
}

impl RuleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleKind::Shield => "shield",
            RuleKind::BotDetect => "bot_detect",
            RuleKind::TokenBucket => "token_bucket",
            RuleKind::Custom => "custom",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token bucket parameters: `refill_rate` tokens are added every `interval`
/// seconds, continuously, up to `capacity`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketRule {
    pub refill_rate: u32,
    /// Seconds.
    pub interval: u64,
    pub capacity: u32,
    #[serde(default)]
    pub characteristics: Characteristics,
}

impl TokenBucketRule {
    pub const fn new(refill_rate: u32, interval: u64, capacity: u32) -> Self {
        Self {
            refill_rate,
            interval,
            capacity,
            characteristics: Characteristics::Source,
        }
    }

    /// Tokens added per second.
    pub fn rate_per_sec(&self) -> f64 {
        self.refill_rate as f64 / self.interval.max(1) as f64
    }

    /// Seconds an empty bucket needs to refill to capacity.
    pub fn full_refill_secs(&self) -> f64 {
        let rate = self.rate_per_sec();
        if rate <= 0.0 {
            return 0.0;
        }
        self.capacity as f64 / rate
    }
}

/// What a bucket is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Characteristics {
    /// One bucket per source address.
    #[default]
    Source,
    /// One bucket per source address and path.
    SourcePath,
}

/// Bot categories understood by the bot classifier and allow-lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BotCategory {
    #[serde(rename = "CATEGORY:SEARCH_ENGINE")]
    SearchEngine,
    #[serde(rename = "CATEGORY:MONITOR")]
    Monitor,
    #[serde(rename = "CATEGORY:PREVIEW")]
    Preview,
    #[serde(rename = "CATEGORY:AI")]
    Ai,
    #[serde(rename = "CATEGORY:TOOL")]
    Tool,
    /// Automation that does not identify as anything well-known.
    #[serde(rename = "CATEGORY:UNKNOWN")]
    Unknown,
}

impl BotCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            BotCategory::SearchEngine => "CATEGORY:SEARCH_ENGINE",
            BotCategory::Monitor => "CATEGORY:MONITOR",
            BotCategory::Preview => "CATEGORY:PREVIEW",
            BotCategory::Ai => "CATEGORY:AI",
            BotCategory::Tool => "CATEGORY:TOOL",
            BotCategory::Unknown => "CATEGORY:UNKNOWN",
        }
    }
}

impl fmt::Display for BotCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_serde_tagged() {
        let json = r#"[
            {"kind": "shield"},
            {"kind": "bot_detect", "allow": ["CATEGORY:SEARCH_ENGINE", "CATEGORY:PREVIEW"]},
            {"kind": "token_bucket", "refill_rate": 60, "interval": 60, "capacity": 60}
        ]"#;
        let rules: Vec<Rule> = serde_json::from_str(json).unwrap();
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0], Rule::Shield);
        assert_eq!(
            rules[1],
            Rule::BotDetect {
                allow: vec![BotCategory::SearchEngine, BotCategory::Preview]
            }
        );
        assert_eq!(rules[2], Rule::TokenBucket(TokenBucketRule::new(60, 60, 60)));
    }

    #[test]
    fn test_bot_detect_allow_defaults_empty() {
        let rule: Rule = serde_json::from_str(r#"{"kind": "bot_detect"}"#).unwrap();
        assert_eq!(rule, Rule::BotDetect { allow: vec![] });
    }

    #[test]
    fn test_token_bucket_characteristics() {
        let rule: Rule = serde_json::from_str(
            r#"{"kind": "token_bucket", "refill_rate": 5, "interval": 10, "capacity": 5, "characteristics": "source_path"}"#,
        )
        .unwrap();
        match rule {
            Rule::TokenBucket(tb) => assert_eq!(tb.characteristics, Characteristics::SourcePath),
            other => panic!("unexpected rule {:?}", other),
        }
    }

    #[test]
    fn test_mode_serde() {
        let m: Mode = serde_json::from_str(r#""DRY_RUN""#).unwrap();
        assert_eq!(m, Mode::DryRun);
        assert_eq!(serde_json::to_string(&Mode::Live).unwrap(), r#""LIVE""#);
    }

    #[test]
    fn test_rates() {
        let tb = TokenBucketRule::new(60, 60, 60);
        assert_eq!(tb.rate_per_sec(), 1.0);
        assert_eq!(tb.full_refill_secs(), 60.0);

        let tb = TokenBucketRule::new(10, 60, 5);
        assert!((tb.full_refill_secs() - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(Rule::Shield.kind().as_str(), "shield");
        assert_eq!(BotCategory::Monitor.to_string(), "CATEGORY:MONITOR");
    }
}
