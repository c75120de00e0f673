//! Spam detection
//!
//! Pure, deterministic scoring of inbound messages:
//! - sender domain blacklist (short-circuit) and allowlist (bias)
//! - weighted regex rules over the analyzable text
//! - structural penalties (missing subject, short body, many links)

pub mod rules;

pub use rules::{RuleBasedFilter, RuleMatch, RuleResult, RuleTarget, SpamRule};

use helpdesk_common::config::SpamConfig;
use helpdesk_common::types::domain_of;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Write;
use std::sync::OnceLock;

/// Score assigned to blacklisted senders
pub const BLACKLIST_SCORE: f64 = 10.0;

/// Score bias for allowlisted senders
pub const ALLOWLIST_BIAS: f64 = -2.0;

const SHORT_CONTENT_CHARS: usize = 20;
const MAX_URLS: usize = 5;

/// Message fields the detector looks at
#[derive(Debug, Clone, Copy)]
pub struct SpamCheckRequest<'a> {
    pub content: &'a str,
    pub subject: Option<&'a str>,
    pub from: &'a str,
    pub html: Option<&'a str>,
}

/// Spam verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpamVerdict {
    pub is_spam: bool,
    pub score: f64,
    pub matched_rules: Vec<String>,
    pub report: String,
}

/// Rule- and list-based spam detector
pub struct SpamDetector {
    rules: RuleBasedFilter,
    threshold: f64,
    blacklist: HashSet<String>,
    allowlist: HashSet<String>,
}

impl SpamDetector {
    /// Create a detector with the default rules
    pub fn new(config: &SpamConfig) -> Self {
        Self::with_rules(config, RuleBasedFilter::new())
    }

    /// Create a detector with a custom rule set
    pub fn with_rules(config: &SpamConfig, rules: RuleBasedFilter) -> Self {
        let normalize = |domains: &[String]| {
            domains
                .iter()
                .map(|d| d.trim().trim_start_matches('@').to_lowercase())
                .filter(|d| !d.is_empty())
                .collect()
        };

        Self {
            rules,
            threshold: config.effective_threshold(),
            blacklist: normalize(&config.blacklist),
            allowlist: normalize(&config.allowlist),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Score a message
    pub fn check_spam(&self, request: &SpamCheckRequest<'_>) -> SpamVerdict {
        let domain = domain_of(request.from);

        if let Some(domain) = domain.as_deref() {
            if list_contains(&self.blacklist, domain) {
                return SpamVerdict {
                    is_spam: true,
                    score: BLACKLIST_SCORE,
                    matched_rules: vec!["BLACKLISTED_DOMAIN".to_string()],
                    report: format!("Sender domain {} is blacklisted", domain),
                };
            }
        }

        let mut score = 0.0;
        let mut matched_rules = Vec::new();
        let mut report = String::new();

        if let Some(domain) = domain.as_deref() {
            if list_contains(&self.allowlist, domain) {
                score += ALLOWLIST_BIAS;
                matched_rules.push("ALLOWLISTED_DOMAIN".to_string());
                let _ = writeln!(report, "ALLOWLISTED_DOMAIN ({:+.1})", ALLOWLIST_BIAS);
            }
        }

        let body = match request.html {
            Some(html) if !html.trim().is_empty() => strip_html(html),
            _ => request.content.to_string(),
        };
        let original = match request.html {
            Some(html) if !html.trim().is_empty() => body.clone(),
            _ => format!("{} {}", request.subject.unwrap_or_default(), request.content),
        };
        let folded = original.to_lowercase();

        let rule_result = self.rules.check(&folded, &original);
        score += rule_result.score;
        for m in &rule_result.matches {
            let _ = writeln!(
                report,
                "{} ({:+.1}, {} match{}): {}",
                m.rule_name,
                m.score,
                m.count,
                if m.count == 1 { "" } else { "es" },
                m.description
            );
        }
        matched_rules.extend(rule_result.matched_rules);

        let mut penalize = |name: &str, points: f64, why: &str| {
            score += points;
            matched_rules.push(name.to_string());
            let _ = writeln!(report, "{} ({:+.1}): {}", name, points, why);
        };

        if request.subject.map_or(true, |s| s.trim().is_empty()) {
            penalize("MISSING_SUBJECT", 1.0, "Message has no subject");
        }
        if body.trim().chars().count() < SHORT_CONTENT_CHARS {
            penalize("SHORT_CONTENT", 1.0, "Message body is very short");
        }
        let url_count = count_urls(request.content) + request.html.map_or(0, count_urls);
        if url_count > MAX_URLS {
            penalize("MANY_URLS", 2.0, "Message contains many links");
        }

        let score = score.max(0.0);
        let is_spam = score >= self.threshold;
        let report = format!(
            "Score {:.1} (threshold {:.1}){}\n{}",
            score,
            self.threshold,
            if is_spam { " SPAM" } else { "" },
            report
        )
        .trim_end()
        .to_string();

        SpamVerdict {
            is_spam,
            score,
            matched_rules,
            report,
        }
    }
}

fn list_contains(list: &HashSet<String>, domain: &str) -> bool {
    list.contains(domain)
        || list
            .iter()
            .any(|entry| domain.ends_with(&format!(".{}", entry)))
}

fn url_regex() -> &'static Regex {
    static URL: OnceLock<Regex> = OnceLock::new();
    URL.get_or_init(|| Regex::new(r#"(?i)\bhttps?://[^\s"'<>]+"#).expect("valid URL regex"))
}

fn count_urls(text: &str) -> usize {
    url_regex().find_iter(text).count()
}

/// Reduce an HTML body to its visible text
pub fn strip_html(html: &str) -> String {
    static BLOCKS: OnceLock<Regex> = OnceLock::new();
    static TAGS: OnceLock<Regex> = OnceLock::new();
    static SPACE: OnceLock<Regex> = OnceLock::new();

    let blocks = BLOCKS.get_or_init(|| {
        Regex::new(r"(?is)<(script|style|head)\b.*?</(script|style|head)\s*>")
            .expect("valid block regex")
    });
    let tags = TAGS.get_or_init(|| Regex::new(r"(?s)<[^>]*>").expect("valid tag regex"));
    let space = SPACE.get_or_init(|| Regex::new(r"\s+").expect("valid space regex"));

    let text = blocks.replace_all(html, " ");
    let text = tags.replace_all(&text, " ");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");
    space.replace_all(&text, " ").trim().to_string()
}
