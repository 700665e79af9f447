//! Deterministic entity patterns.
//!
//! Every pattern is a row in a table of `{pattern, type, confidence, metadata}`
//! processed by the same loop. Rows are evaluated in table order and a match
//! is dropped when it overlaps text already claimed by an earlier row, so more
//! specific rows (email, CIDR, vendor models) shadow the generic name rows
//! that follow them.

use crate::entity::{EntitySource, EntityType, ExtractedEntity};
use crate::error::{EnrichmentError, EnrichmentResult};
use regex::Regex;
use std::ops::Range;
use std::sync::{Arc, OnceLock};

/// One IPv4 octet, 0-255 without leading zeros.
const OCTET: &str = r"(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)";

/// Products recognised as software mentions.
pub const SOFTWARE_ALLOWLIST: &[&str] = &[
    "Active Directory",
    "Adobe Acrobat",
    "AnyConnect",
    "Azure AD",
    "Citrix",
    "Confluence",
    "Exchange Online",
    "Excel",
    "GlobalProtect",
    "Google Chrome",
    "Jira",
    "Log4j",
    "Microsoft 365",
    "Microsoft Teams",
    "MS Teams",
    "MySQL",
    "Office 365",
    "Okta",
    "OneDrive",
    "Oracle",
    "Outlook",
    "PostgreSQL",
    "PowerPoint",
    "Salesforce",
    "SAP",
    "ServiceNow",
    "SharePoint",
    "Slack",
    "SQL Server",
    "VMware",
    "Webex",
    "Workday",
    "Zoom",
];

/// Whole values never reported as host or system names.
const STOPLIST: &[&str] = &[
    "2fa", "aes256", "base64", "covid19", "covid-19", "e2e", "h264", "http2", "i18n", "ipv4",
    "ipv6", "k8s", "md5", "mp3", "mp4", "o365", "m365", "office365", "p2p", "sha1", "sha256",
    "tls12", "tls13", "utf8", "utf-8", "win7", "win10", "win11", "windows10", "windows11", "x64",
    "x86", "x86_64", "y2k",
];

/// Common English words; a name made only of these (and numbers) is ignored.
const COMMON_WORDS: &[&str] = &[
    "a", "access", "add", "after", "and", "based", "before", "built", "check", "connection",
    "cross", "date", "day", "desktop", "down", "drop", "e", "email", "end", "error", "factor",
    "fi", "follow", "for", "friendly", "full", "help", "high", "in", "install", "issue", "laptop",
    "log", "login", "long", "low", "mail", "multi", "network", "non", "of", "off", "office", "on",
    "only", "opt", "out", "page", "part", "party", "password", "please", "platform", "plug", "pop",
    "premise", "printer", "priority", "re", "read", "real", "roll", "server", "service", "set",
    "self", "short", "sign", "start", "step", "system", "term", "test", "the", "third", "time",
    "to", "two", "up", "update", "user", "version", "walk", "web", "week", "wi", "windows", "with",
    "working",
];

/// Ticket-number prefixes (INC0012345, RITM0001234, ...).
const TICKET_PREFIXES: &[&str] = &["inc", "ritm", "req", "chg", "prb", "sctask", "task", "kb", "cs"];

/// Top-level labels accepted on dotted host names besides two-letter country codes.
const HOST_SUFFIXES: &[&str] = &[
    "com", "net", "org", "edu", "gov", "mil", "int", "local", "lan", "corp", "internal", "intra",
    "home", "cloud", "io", "biz", "info",
];

/// Suffixes that mark a dotted token as a file name.
const FILE_EXTENSIONS: &[&str] = &[
    "bak", "bat", "cfg", "conf", "csv", "dll", "doc", "docx", "exe", "gif", "htm", "html", "ini",
    "jpeg", "jpg", "js", "json", "log", "msi", "pdf", "php", "png", "ps", "py", "rs", "sh", "tmp",
    "txt", "xls", "xlsx", "xml", "yaml", "yml", "zip",
];

/// A match under consideration, with its surroundings.
#[derive(Debug, Clone, Copy)]
pub struct MatchContext<'a> {
    pub value: &'a str,
    pub haystack: &'a str,
    pub start: usize,
    pub end: usize,
}

impl<'a> MatchContext<'a> {
    fn prev_char(&self) -> Option<char> {
        self.haystack[..self.start].chars().next_back()
    }

    fn next_char(&self) -> Option<char> {
        self.haystack[self.end..].chars().next()
    }

    fn char_after_next(&self) -> Option<char> {
        self.haystack[self.end..].chars().nth(1)
    }

    /// True when the match is one segment of a longer dotted token.
    fn in_dotted_run(&self) -> bool {
        let before = self.prev_char() == Some('.')
            && self.haystack[..self.start.saturating_sub(1)]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_ascii_alphanumeric());
        let after = self.next_char() == Some('.')
            && self.char_after_next().is_some_and(|c| c.is_ascii_alphanumeric());
        before || after
    }
}

/// Post-match predicate; returning false discards the match.
pub type MatchFilter = fn(&MatchContext<'_>) -> bool;

/// Maps the matched text to the reported value.
pub type Normalizer = fn(&str) -> String;

/// One row of the pattern table.
#[derive(Debug, Clone)]
pub struct PatternRule {
    pub name: &'static str,
    pub pattern: String,
    pub entity_type: EntityType,
    pub confidence: f64,
    pub metadata: Vec<(&'static str, &'static str)>,
    pub filter: Option<MatchFilter>,
    pub normalize: Option<Normalizer>,
}

impl PatternRule {
    pub fn new(
        name: &'static str,
        pattern: impl Into<String>,
        entity_type: EntityType,
        confidence: f64,
    ) -> Self {
        Self {
            name,
            pattern: pattern.into(),
            entity_type,
            confidence,
            metadata: Vec::new(),
            filter: None,
            normalize: None,
        }
    }

    pub fn meta(mut self, key: &'static str, value: &'static str) -> Self {
        self.metadata.push((key, value));
        self
    }

    pub fn filter(mut self, filter: MatchFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn normalize(mut self, normalize: Normalizer) -> Self {
        self.normalize = Some(normalize);
        self
    }

    fn device(
        name: &'static str,
        pattern: &str,
        vendor: &'static str,
        device_type: &'static str,
    ) -> Self {
        Self::new(name, pattern, EntityType::NetworkDevice, 0.85)
            .meta("vendor", vendor)
            .meta("device_type", device_type)
            .normalize(collapse_whitespace)
    }
}

struct CompiledRule {
    rule: PatternRule,
    regex: Regex,
}

/// Compiled pattern table.
pub struct PatternTable {
    rules: Vec<CompiledRule>,
}

impl PatternTable {
    /// Compiles a custom table.
    pub fn new(rules: Vec<PatternRule>) -> EnrichmentResult<Self> {
        let rules = rules
            .into_iter()
            .map(|rule| {
                Regex::new(&rule.pattern)
                    .map(|regex| CompiledRule { rule, regex })
                    .map_err(|e| EnrichmentError::Config(format!("Invalid entity pattern: {}", e)))
            })
            .collect::<EnrichmentResult<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// The built-in table, compiled once.
    pub fn builtin() -> Arc<PatternTable> {
        static INSTANCE: OnceLock<Arc<PatternTable>> = OnceLock::new();
        INSTANCE
            .get_or_init(|| {
                Arc::new(PatternTable::new(builtin_rules()).expect("Invalid built-in entity pattern"))
            })
            .clone()
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.rule.name).collect()
    }

    /// Runs every rule over `text`.
    ///
    /// The result may hold the same value more than once when it occurs
    /// repeatedly; callers deduplicate with [`merge_entities`](crate::entity::merge_entities).
    pub fn extract(&self, text: &str) -> Vec<ExtractedEntity> {
        let mut claimed: Vec<Range<usize>> = Vec::new();
        let mut found = Vec::new();

        for compiled in &self.rules {
            let rule = &compiled.rule;
            for caps in compiled.regex.captures_iter(text) {
                let Some(m) = caps.get(1).or_else(|| caps.get(0)) else {
                    continue;
                };
                if claimed
                    .iter()
                    .any(|r| m.start() < r.end && r.start < m.end())
                {
                    continue;
                }

                let ctx = MatchContext {
                    value: m.as_str(),
                    haystack: text,
                    start: m.start(),
                    end: m.end(),
                };
                if let Some(filter) = rule.filter {
                    if !filter(&ctx) {
                        continue;
                    }
                }

                let value = match rule.normalize {
                    Some(normalize) => normalize(m.as_str()),
                    None => m.as_str().trim().to_string(),
                };
                let mut entity =
                    ExtractedEntity::new(rule.entity_type, value, rule.confidence, EntitySource::Regex)
                        .with_metadata("pattern", rule.name);
                for (key, val) in &rule.metadata {
                    entity = entity.with_metadata(key, *val);
                }

                claimed.push(m.range());
                found.push(entity);
            }
        }
        found
    }
}

/// The built-in rows, in evaluation order.
pub fn builtin_rules() -> Vec<PatternRule> {
    vec![
        PatternRule::new(
            "email",
            r"\b([A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,})\b",
            EntityType::User,
            0.95,
        )
        .meta("kind", "email")
        .normalize(lowercase),
        PatternRule::new(
            "ipv4_cidr",
            format!(r"\b((?:{o}\.){{3}}{o}/(?:3[0-2]|[12]?\d))\b", o = OCTET),
            EntityType::IpAddress,
            0.9,
        )
        .meta("kind", "cidr"),
        PatternRule::new(
            "ipv4",
            format!(r"\b((?:{o}\.){{3}}{o})\b", o = OCTET),
            EntityType::IpAddress,
            0.95,
        )
        .meta("kind", "ipv4")
        .filter(|ctx| !ctx.in_dotted_run()),
        PatternRule::device(
            "fortinet_fortigate",
            r"(?i)\b(forti(?:gate|wifi)[-\s]?\d{2,4}[a-z]?)\b",
            "Fortinet",
            "firewall",
        ),
        PatternRule::device(
            "paloalto_pa",
            r"(?i)\b(pa-\d{3,4}[a-z]?)\b",
            "Palo Alto Networks",
            "firewall",
        ),
        PatternRule::device(
            "cisco_asa",
            r"(?i)\b(asa[-\s]?55\d{2}(?:-x)?)\b",
            "Cisco",
            "firewall",
        ),
        PatternRule::device(
            "sonicwall",
            r"(?i)\b(sonicwall[-\s]?(?:tz|nsa)[-\s]?\d{3,4})\b",
            "SonicWall",
            "firewall",
        ),
        PatternRule::device(
            "juniper_srx",
            r"(?i)\b(srx[-\s]?\d{3,4})\b",
            "Juniper",
            "firewall",
        ),
        PatternRule::device(
            "cisco_isr",
            r"(?i)\b(isr[-\s]?\d{4}[a-z]?)\b",
            "Cisco",
            "router",
        ),
        PatternRule::device(
            "cisco_catalyst",
            r"(?i)\b(catalyst[-\s]?\d{4}[a-z]?(?:-\d{2}[a-z]*)?)\b",
            "Cisco",
            "switch",
        ),
        PatternRule::device(
            "cisco_nexus",
            r"(?i)\b(nexus[-\s]?\d{4}[a-z]?)\b",
            "Cisco",
            "switch",
        ),
        PatternRule::device(
            "juniper_ex",
            r"(?i)\b(ex\d{4}(?:-\d{2}[a-z])?)\b",
            "Juniper",
            "switch",
        ),
        PatternRule::device(
            "aruba_switch",
            r"(?i)\b(aruba[-\s]?\d{4}[a-z]?)\b",
            "HPE Aruba",
            "switch",
        ),
        PatternRule::new(
            "hex_code",
            r"\b(0[xX][0-9A-Fa-f]{4,8})\b",
            EntityType::ErrorCode,
            0.8,
        )
        .meta("kind", "hex"),
        PatternRule::new(
            "prefixed_code",
            r"\b([A-Z]{3,6}-\d{3,6})\b",
            EntityType::ErrorCode,
            0.8,
        )
        .meta("kind", "prefixed")
        .filter(|ctx| !is_ticket_number(ctx.value)),
        PatternRule::new(
            "numeric_error",
            r"(?i)\berror(?:\s+code)?\s*[:#]?\s*(\d{3,5})\b",
            EntityType::ErrorCode,
            0.8,
        )
        .meta("kind", "numeric"),
        PatternRule::new("software", software_pattern(), EntityType::Software, 0.7)
            .normalize(canonical_software),
        PatternRule::new(
            "username",
            r"(?i)\b(?:user(?:name)?|account|login|uid|samaccountname)\s*[:=]\s*([a-z][a-z0-9._-]{2,31})\b",
            EntityType::User,
            0.5,
        )
        .meta("kind", "username")
        .normalize(lowercase),
        PatternRule::new(
            "domain_account",
            r"\b([A-Za-z][A-Za-z0-9-]{1,14}\\[A-Za-z][A-Za-z0-9._-]{1,31})\b",
            EntityType::User,
            0.5,
        )
        .meta("kind", "domain_account"),
        PatternRule::new(
            "fqdn",
            r"(?i)\b((?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z]{2,63})\b",
            EntityType::Hostname,
            0.6,
        )
        .meta("kind", "fqdn")
        .filter(accept_host_name)
        .normalize(lowercase),
        PatternRule::new(
            "system_name",
            r"(?i)\b([a-z][a-z0-9]*(?:[-_][a-z0-9]+)*)\b",
            EntityType::System,
            0.5,
        )
        .meta("kind", "system_name")
        .filter(accept_system_name),
    ]
}

fn software_pattern() -> String {
    let mut names: Vec<&str> = SOFTWARE_ALLOWLIST.to_vec();
    names.sort_by_key(|n| std::cmp::Reverse(n.len()));
    let alternation = names
        .iter()
        .map(|n| regex::escape(n).replace(' ', r"\s+"))
        .collect::<Vec<_>>()
        .join("|");
    format!(r"(?i)\b({})\b", alternation)
}

fn canonical_software(matched: &str) -> String {
    let collapsed = collapse_whitespace(matched);
    SOFTWARE_ALLOWLIST
        .iter()
        .find(|name| name.eq_ignore_ascii_case(&collapsed))
        .map(|name| name.to_string())
        .unwrap_or(collapsed)
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn lowercase(value: &str) -> String {
    value.trim().to_lowercase()
}

fn is_ticket_number(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    TICKET_PREFIXES.iter().any(|prefix| {
        lower
            .strip_prefix(prefix)
            .map(|rest| rest.trim_start_matches('-'))
            .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
    })
}

fn accept_host_name(ctx: &MatchContext<'_>) -> bool {
    if ctx.prev_char() == Some('@') || ctx.next_char() == Some('@') {
        return false;
    }
    let lower = ctx.value.to_ascii_lowercase();
    if STOPLIST.contains(&lower.as_str()) {
        return false;
    }
    let Some(suffix) = lower.rsplit('.').next() else {
        return false;
    };
    if FILE_EXTENSIONS.contains(&suffix) {
        return false;
    }
    suffix.len() == 2 || HOST_SUFFIXES.contains(&suffix)
}

fn accept_system_name(ctx: &MatchContext<'_>) -> bool {
    let lower = ctx.value.to_ascii_lowercase();
    if lower.len() < 3 || lower.len() > 63 {
        return false;
    }
    if STOPLIST.contains(&lower.as_str()) || is_ticket_number(&lower) || ctx.in_dotted_run() {
        return false;
    }

    let parts: Vec<&str> = lower.split(['-', '_']).collect();
    let has_digit = lower.chars().any(|c| c.is_ascii_digit());
    if !has_digit && parts.len() < 2 {
        return false;
    }
    !parts.iter().all(|part| {
        COMMON_WORDS.contains(part) || part.chars().all(|c| c.is_ascii_digit())
    })
}
