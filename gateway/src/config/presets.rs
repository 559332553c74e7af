//! Built-in protection profiles.
//!
//! Each profile is a value of [`PolicyConfig`], not a type: the rule list and
//! its parameters are the only thing that distinguishes one from another.

use super::PolicyConfig;
use crate::guard::{BotCategory, Mode, Rule, TokenBucketRule};
use std::collections::HashMap;

pub const DEFAULT: &str = "default";
pub const STRICT: &str = "strict";
pub const PUBLIC: &str = "public";
pub const MINIMAL: &str = "minimal";

pub const NAMES: [&str; 4] = [DEFAULT, STRICT, PUBLIC, MINIMAL];

/// Crawlers, uptime checks and link unfurlers.
pub const WELL_KNOWN_BOTS: [BotCategory; 3] = [
    BotCategory::SearchEngine,
    BotCategory::Monitor,
    BotCategory::Preview,
];

pub const DEFAULT_BUCKET: TokenBucketRule = TokenBucketRule::new(60, 60, 60);
pub const STRICT_BUCKET: TokenBucketRule = TokenBucketRule::new(10, 60, 10);
pub const PUBLIC_BUCKET: TokenBucketRule = TokenBucketRule::new(100, 60, 100);

pub fn builtin(name: &str) -> Option<PolicyConfig> {
    let rules = match name {
        DEFAULT => vec![
            Rule::Shield,
            Rule::BotDetect {
                allow: WELL_KNOWN_BOTS.to_vec(),
            },
            Rule::TokenBucket(DEFAULT_BUCKET),
        ],
        STRICT => vec![
            Rule::Shield,
            Rule::BotDetect { allow: Vec::new() },
            Rule::TokenBucket(STRICT_BUCKET),
        ],
        PUBLIC => vec![
            Rule::Shield,
            Rule::BotDetect {
                allow: WELL_KNOWN_BOTS.to_vec(),
            },
            Rule::TokenBucket(PUBLIC_BUCKET),
        ],
        MINIMAL => vec![Rule::Shield],
        _ => return None,
    };
    Some(PolicyConfig {
        mode: Mode::Live,
        rules,
    })
}

/// Presets overlaid with the configured profiles.
pub fn resolve(configured: &HashMap<String, PolicyConfig>) -> HashMap<String, PolicyConfig> {
    let mut all: HashMap<String, PolicyConfig> = NAMES
        .iter()
        .filter_map(|name| builtin(name).map(|p| (name.to_string(), p)))
        .collect();
    for (name, policy) in configured {
        all.insert(name.clone(), policy.clone());
    }
    all
}
