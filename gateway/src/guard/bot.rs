use super::rule::BotCategory;
use crate::error::GatewayError;
use regex::Regex;
use std::sync::OnceLock;

/// Who the classifier thinks is on the other end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Client {
    Human,
    Bot(BotCategory),
}

// First match wins; specific crawlers come before the generic catch-all.
const TABLE: &[(BotCategory, &str)] = &[
    (
        BotCategory::Ai,
        r"(?i)(gptbot|chatgpt-user|oai-searchbot|claudebot|claude-web|anthropic-ai|ccbot|perplexitybot|bytespider|google-extended|cohere-ai|diffbot)",
    ),
    (
        BotCategory::SearchEngine,
        r"(?i)(googlebot|bingbot|duckduckbot|yandexbot|baiduspider|slurp|applebot|petalbot|qwantify)",
    ),
    (
        BotCategory::Monitor,
        r"(?i)(uptimerobot|pingdom|statuscake|site24x7|better ?uptime|datadog synthetics|newrelicpinger|checkly)",
    ),
    (
        BotCategory::Preview,
        r"(?i)(slackbot|twitterbot|facebookexternalhit|discordbot|linkedinbot|telegrambot|whatsapp|embedly|skypeuripreview)",
    ),
    (
        BotCategory::Tool,
        r"(?i)(^curl/|^wget/|python-requests|python-urllib|aiohttp|go-http-client|httpie|okhttp|libwww-perl|java/|axios/|node-fetch|scrapy)",
    ),
    (
        BotCategory::Unknown,
        r"(?i)(bot\b|crawler|spider|scraper|headlesschrome|phantomjs|selenium|puppeteer|playwright)",
    ),
];

/// The compiled user-agent classification table.
#[derive(Debug, Clone, Copy)]
pub struct BotClassifier {
    table: &'static [(BotCategory, Regex)],
}

impl BotClassifier {
    /// Compile the table once per process. Every row must compile: a dropped
    /// row would silently wave a whole bot category through.
    pub fn compiled() -> Result<Self, GatewayError> {
        static COMPILED: OnceLock<Result<Vec<(BotCategory, Regex)>, GatewayError>> =
            OnceLock::new();
        match COMPILED.get_or_init(|| build(TABLE)) {
            Ok(table) => Ok(Self {
                table: table.as_slice(),
            }),
            Err(e) => Err(e.clone()),
        }
    }

    /// Classify a request by its `User-Agent`. A request without one is automation.
    pub fn classify(&self, user_agent: Option<&str>) -> Client {
        let Some(ua) = user_agent else {
            return Client::Bot(BotCategory::Unknown);
        };
        self.table
            .iter()
            .find(|(_, re)| re.is_match(ua))
            .map(|(cat, _)| Client::Bot(*cat))
            .unwrap_or(Client::Human)
    }
}

fn build(rows: &[(BotCategory, &str)]) -> Result<Vec<(BotCategory, Regex)>, GatewayError> {
    rows.iter()
        .map(|(cat, pattern)| {
            Regex::new(pattern).map(|re| (*cat, re)).map_err(|e| {
                GatewayError::Config(format!("bot table: {}: {}", cat.as_str(), e))
            })
        })
        .collect()
}
