use super::request::RequestDescriptor;
use crate::error::GatewayError;
use regex::RegexSet;
use std::borrow::Cow;
use std::sync::OnceLock;

/// Attack-signature families the shield recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signature {
    SqlInjection,
    CrossSiteScripting,
    PathTraversal,
    CommandInjection,
}

impl Signature {
    pub fn as_str(self) -> &'static str {
        match self {
            Signature::SqlInjection => "sql_injection",
            Signature::CrossSiteScripting => "xss",
            Signature::PathTraversal => "path_traversal",
            Signature::CommandInjection => "command_injection",
        }
    }
}

/// Where a signature is looked for. Command-word patterns only make sense in
/// the URL: device names in user agents (`SH-M20`, `Cat S62`) look like them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Anywhere,
    UrlOnly,
}

const PATTERNS: &[(Signature, Scope, &str)] = &[
    (Signature::SqlInjection, Scope::Anywhere, r"(?i)\bunion\b[\s(/*]+(all\s+)?select\b"),
    (Signature::SqlInjection, Scope::Anywhere, r"(?i)'\s*(or|and)\s+'?\w+'?\s*=\s*'?\w+"),
    (Signature::SqlInjection, Scope::Anywhere, r"(?i)'\s*;\s*(drop|delete|insert|update|alter)\s"),
    (Signature::SqlInjection, Scope::Anywhere, r"(?i)\b(sleep|benchmark|pg_sleep)\s*\(\s*\d+"),
    (Signature::SqlInjection, Scope::Anywhere, r"(?i)'\s*--"),
    (Signature::CrossSiteScripting, Scope::Anywhere, r"(?i)<\s*script\b"),
    (Signature::CrossSiteScripting, Scope::Anywhere, r"(?i)javascript\s*:"),
    (Signature::CrossSiteScripting, Scope::Anywhere, r"(?i)<[^>]+\bon(error|load|click|mouseover|focus)\s*="),
    (Signature::CrossSiteScripting, Scope::Anywhere, r"(?i)<\s*(iframe|object|embed|svg)\b"),
    (Signature::PathTraversal, Scope::Anywhere, r"(^|[/\\])\.\.([/\\]|$)"),
    (Signature::PathTraversal, Scope::Anywhere, r"(?i)/etc/(passwd|shadow|hosts)\b"),
    (Signature::PathTraversal, Scope::Anywhere, r"(?i)\b(boot|win)\.ini\b"),
    (
        Signature::CommandInjection,
        Scope::UrlOnly,
        r"(?i)[;|`]\s*(cat|ls|id|whoami|uname|wget|curl|nc|bash|sh)(\s|$|[;|&<>`'\x22])",
    ),
    (Signature::CommandInjection, Scope::Anywhere, r"\$\([^)]*\)"),
    // Shellshock function definition.
    (Signature::CommandInjection, Scope::Anywhere, r"\(\)\s*\{[^}]*\}\s*;"),
];

/// The compiled attack-signature set.
#[derive(Debug, Clone, Copy)]
pub struct Shield {
    set: &'static RegexSet,
}

impl Shield {
    /// Compile the signature set once per process. A pattern that does not
    /// compile is a startup error, never a silently empty shield.
    pub fn compiled() -> Result<Self, GatewayError> {
        static SET: OnceLock<Result<RegexSet, GatewayError>> = OnceLock::new();
        match SET.get_or_init(|| build(PATTERNS.iter().map(|(_, _, p)| *p))) {
            Ok(set) => Ok(Self { set }),
            Err(e) => Err(e.clone()),
        }
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Scan the attacker-controlled parts of a request. Returns the first
    /// matching signature family, if any.
    pub fn scan(&self, req: &RequestDescriptor) -> Option<Signature> {
        let mut fields: Vec<(Cow<'_, str>, bool)> = Vec::with_capacity(4);
        fields.push((decode(&req.raw_path), true));
        if let Some(q) = req.query.as_deref() {
            fields.push((decode(q), true));
        }
        if let Some(ua) = req.user_agent() {
            fields.push((Cow::Borrowed(ua), false));
        }
        if let Some(referer) = req.header("referer") {
            fields.push((decode(referer), true));
        }

        fields.iter().find_map(|(field, in_url)| {
            self.set
                .matches(field)
                .iter()
                .map(|idx| PATTERNS[idx])
                .find(|(_, scope, _)| *in_url || *scope == Scope::Anywhere)
                .map(|(sig, _, _)| sig)
        })
    }
}

fn build<'a>(patterns: impl IntoIterator<Item = &'a str>) -> Result<RegexSet, GatewayError> {
    RegexSet::new(patterns)
        .map_err(|e| GatewayError::Config(format!("shield signatures: {}", e)))
}

/// Percent-decode (twice, to catch double encoding) and treat `+` as space.
fn decode(raw: &str) -> Cow<'_, str> {
    let once = match urlencoding::decode(&raw.replace('+', " ")) {
        Ok(s) => s.into_owned(),
        Err(_) => return Cow::Borrowed(raw),
    };
    if !once.contains('%') {
        return Cow::Owned(once);
    }
    match urlencoding::decode(&once) {
        Ok(s) => Cow::Owned(s.into_owned()),
        Err(_) => Cow::Owned(once),
    }
}
