//! Weighted regular-expression spam rules
//!
//! Every rule contributes `weight × min(matches, 3)`, so a single keyword
//! repeated many times cannot dominate the score.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Maximum number of matches of one rule that count towards the score
pub const MATCH_CAP: usize = 3;

/// A spam detection rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpamRule {
    /// Rule name/identifier
    pub name: String,
    /// Rule description
    pub description: String,
    /// Which text the rule runs on
    #[serde(default)]
    pub target: RuleTarget,
    /// Regular expression
    pub pattern: String,
    /// Score per match
    pub weight: f64,
    /// Whether the rule is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Text a rule is evaluated against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleTarget {
    /// Case-folded analyzable text
    #[default]
    Folded,
    /// Same text with its original casing
    Original,
}

/// Result of rule-based spam check
#[derive(Debug, Clone, Default)]
pub struct RuleResult {
    /// Aggregate spam score
    pub score: f64,
    /// Names of matched rules, in rule order
    pub matched_rules: Vec<String>,
    /// Details of each match
    pub matches: Vec<RuleMatch>,
}

/// A single rule match
#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub rule_name: String,
    pub count: usize,
    pub score: f64,
    pub description: String,
}

/// Rule-based spam filter
pub struct RuleBasedFilter {
    rules: Vec<SpamRule>,
    compiled_patterns: HashMap<String, Regex>,
}

fn rule(name: &str, description: &str, target: RuleTarget, pattern: &str, weight: f64) -> SpamRule {
    SpamRule {
        name: name.to_string(),
        description: description.to_string(),
        target,
        pattern: pattern.to_string(),
        weight,
        enabled: true,
    }
}

impl RuleBasedFilter {
    /// Create a new rule-based filter with default rules
    pub fn new() -> Self {
        let mut filter = Self {
            rules: Vec::new(),
            compiled_patterns: HashMap::new(),
        };

        filter.add_default_rules();
        filter
    }

    /// Create a filter without any rules
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            compiled_patterns: HashMap::new(),
        }
    }

    fn add_default_rules(&mut self) {
        use RuleTarget::{Folded, Original};

        let default_rules = vec![
            // Spam vocabulary per language
            rule(
                "SPAM_WORDS_EN",
                "English spam vocabulary",
                Folded,
                r"(?i)\b(free money|you have won|winner|congratulations|act now|risk[- ]free|100% free|no cost|double your income|earn extra cash|work from home|special promotion|cheap meds)\b",
                1.5,
            ),
            rule(
                "SPAM_WORDS_FR",
                "French spam vocabulary",
                Folded,
                r"(?i)\b(gratuit|gagnant|félicitations|argent facile|offre exclusive|sans frais|vous avez gagné)\b",
                1.5,
            ),
            rule(
                "SPAM_WORDS_DE",
                "German spam vocabulary",
                Folded,
                r"(?i)\b(kostenlos|gewinner|gewinnspiel|glückwunsch|schnelles geld|sie haben gewonnen)\b",
                1.5,
            ),
            rule(
                "SPAM_WORDS_ES",
                "Spanish spam vocabulary",
                Folded,
                r"(?i)\b(gratis|ganador|felicidades|dinero fácil|oferta exclusiva|sin costo|has ganado)\b",
                1.5,
            ),
            // Shouting
            rule(
                "EXCESSIVE_CAPS",
                "Words written entirely in capitals",
                Original,
                r"\b[A-Z]{5,}\b",
                0.5,
            ),
            rule(
                "URL_SHORTENER",
                "Links through URL shorteners",
                Folded,
                r"(?i)\b(bit\.ly|tinyurl\.com|goo\.gl|t\.co|ow\.ly|is\.gd|buff\.ly|rebrand\.ly|cutt\.ly)/",
                1.5,
            ),
            rule(
                "URGENCY",
                "Urgency phrasing",
                Folded,
                r"(?i)\b(urgent|immediately|act now|limited time|expires? (today|soon)|last chance|final notice|don't miss out)\b",
                1.0,
            ),
            rule(
                "SCAM_PHISHING",
                "Scam or phishing phrasing",
                Folded,
                r"(?i)(verify your account|confirm your (identity|password)|update your (password|payment|billing) (details|information)|account (has been )?(suspended|locked)|next of kin|inheritance|wire transfer|beneficiary)",
                2.5,
            ),
            rule(
                "ADULT_MEDICATION",
                "Adult or medication phrasing",
                Folded,
                r"(?i)\b(viagra|cialis|xxx|porn|nude pics|online pharmacy|weight loss pills?|enlargement)\b",
                3.0,
            ),
            rule(
                "CRYPTO_SCAM",
                "Crypto investment phrasing",
                Folded,
                r"(?i)\b(bitcoin|btc|ethereum|crypto ?currency|investment opportunity|guaranteed returns?|double your (money|bitcoin))\b",
                1.5,
            ),
            rule(
                "EXCESSIVE_PUNCTUATION",
                "Runs of exclamation or question marks",
                Folded,
                r"[!?]{3,}",
                1.0,
            ),
            rule(
                "MONEY_PATTERN",
                "Large sums of money",
                Folded,
                r"(?i)([$€£]\s?\d{1,3}(,\d{3})+|\b\d+(\.\d+)?\s?(million|billion)\b)",
                1.5,
            ),
        ];

        for rule in default_rules {
            self.add_rule(rule);
        }
    }

    /// Add a custom rule; rules with invalid patterns are skipped
    pub fn add_rule(&mut self, rule: SpamRule) {
        match Regex::new(&rule.pattern) {
            Ok(regex) => {
                self.compiled_patterns.insert(rule.name.clone(), regex);
                self.rules.push(rule);
            }
            Err(e) => warn!(rule = %rule.name, error = %e, "Invalid spam rule pattern"),
        }
    }

    /// Score `folded` (case-folded) and `original` text against all enabled rules
    pub fn check(&self, folded: &str, original: &str) -> RuleResult {
        let mut result = RuleResult::default();

        for rule in self.rules.iter().filter(|r| r.enabled) {
            let Some(regex) = self.compiled_patterns.get(&rule.name) else {
                continue;
            };
            let text = match rule.target {
                RuleTarget::Folded => folded,
                RuleTarget::Original => original,
            };

            let count = regex.find_iter(text).count();
            if count == 0 {
                continue;
            }

            let score = rule.weight * count.min(MATCH_CAP) as f64;
            debug!(rule = %rule.name, count, score, "Spam rule matched");
            result.score += score;
            result.matched_rules.push(rule.name.clone());
            result.matches.push(RuleMatch {
                rule_name: rule.name.clone(),
                count,
                score,
                description: rule.description.clone(),
            });
        }

        result
    }

    /// Get all rules
    pub fn get_rules(&self) -> &[SpamRule] {
        &self.rules
    }

    /// Enable/disable a rule by name
    pub fn set_rule_enabled(&mut self, name: &str, enabled: bool) -> bool {
        for rule in &mut self.rules {
            if rule.name == name {
                rule.enabled = enabled;
                return true;
            }
        }
        false
    }
}

impl Default for RuleBasedFilter {
    fn default() -> Self {
        Self::new()
    }
}
