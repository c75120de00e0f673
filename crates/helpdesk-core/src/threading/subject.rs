//! Subject normalization and similarity

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

fn reply_prefix() -> &'static Regex {
    static PREFIX: OnceLock<Regex> = OnceLock::new();
    PREFIX.get_or_init(|| {
        Regex::new(r"^(re|fwd|fw|tr|aw|sv|vs|antw)(\[\d+\])?\s*:\s*").expect("valid prefix regex")
    })
}

fn ticket_token() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| Regex::new(r"\[#\d+\]|\(#\d+\)").expect("valid ticket token regex"))
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Canonical subject used for thread matching.
///
/// Lower-cases, strips any number of reply/forward prefixes in several
/// languages, removes `[#123]` / `(#123)` ticket tokens and collapses
/// whitespace, repeating until nothing changes.
pub fn normalize_subject(subject: &str) -> String {
    let mut current = collapse_whitespace(&subject.to_lowercase());

    loop {
        let mut next = current.clone();
        while let Some(m) = reply_prefix().find(&next) {
            next = next[m.end()..].to_string();
        }
        next = collapse_whitespace(&ticket_token().replace_all(&next, " "));

        if next == current {
            return current;
        }
        current = next;
    }
}

/// Intersection over union of the whitespace-split word sets
pub fn token_overlap(a: &str, b: &str) -> f64 {
    let left: HashSet<&str> = a.split_whitespace().collect();
    let right: HashSet<&str> = b.split_whitespace().collect();
    let union = left.union(&right).count();
    if union == 0 {
        return 0.0;
    }
    left.intersection(&right).count() as f64 / union as f64
}

/// Whether two already-normalized subjects denote the same thread
pub fn subjects_match(a: &str, b: &str, threshold: f64) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a == b || a.contains(b) || b.contains(a) || token_overlap(a, b) >= threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_normalize_strips_prefixes_and_tokens() {
        assert_eq!(normalize_subject("Re: Re: Fwd: Order #123 [#456]"), "order #123");
        assert_eq!(normalize_subject("AW: SV: Antw: Rechnung (#77)"), "rechnung");
        assert_eq!(normalize_subject("  TR:   Question   about   export "), "question about export");
        assert_eq!(normalize_subject("Re[2]: status"), "status");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for subject in [
            "Re: Re: Fwd: Order #123 [#456]",
            "[#9] Re: fw: broken login",
            "Help with billing",
            "",
        ] {
            let once = normalize_subject(subject);
            assert_eq!(normalize_subject(&once), once);
        }
    }

    #[test]
    fn test_prefix_revealed_by_token_removal() {
        assert_eq!(normalize_subject("[#12] Re: Printer jam"), "printer jam");
    }

    #[test]
    fn test_subject_similarity() {
        assert!(subjects_match("help with billing", "help with billing", 0.7));
        assert!(subjects_match("help with billing", "urgent help with billing please", 0.7));
        assert!(subjects_match("cannot export report pdf", "cannot export report csv", 0.6));
        assert!(!subjects_match("cannot export report pdf", "password reset", 0.7));
        assert!(!subjects_match("", "anything", 0.7));
    }

    #[test]
    fn test_token_overlap() {
        assert_eq!(token_overlap("a b c d", "a b c e"), 0.6);
        assert_eq!(token_overlap("", ""), 0.0);
    }
}
