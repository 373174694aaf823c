//! Sanitizes raw handler error text before it is persisted.
//!
//! Secret assignments, emails, card numbers, SSNs and phone numbers are
//! replaced with fixed placeholders across the whole message, and only then
//! is the result clamped to the configured character bound. Clamping first
//! would leave a partial match at the cut that no pattern recognises.

use std::sync::LazyLock;

use regex::Regex;

#[allow(clippy::expect_used)]
static SECRET_ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)\b([a-z0-9_\-]*(?:(?:api|access|private|secret)[_\-]?key|secret|token|password|passwd|pwd|authorization))\s*[:=]\s*("[^"]*"|'[^']*'|(?:bearer\s+)?[^\s,;&]+)"#,
    )
    .expect("constant regex pattern is valid")
});

#[allow(clippy::expect_used)]
static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}")
        .expect("constant regex pattern is valid")
});

#[allow(clippy::expect_used)]
static CARD_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:\d[ \-]?){15}\d\b").expect("constant regex pattern is valid")
});

#[allow(clippy::expect_used)]
static SSN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("constant regex pattern is valid"));

#[allow(clippy::expect_used)]
static PHONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\+\d{1,3}[\s.\-]?)?(?:\(\d{3}\)|\b\d{3})[\s.\-]?\d{3}[\s.\-]?\d{4}\b")
        .expect("constant regex pattern is valid")
});

/// Default maximum summary length in characters.
pub const DEFAULT_MAX_LENGTH: usize = 500;

/// Bounded, PII-scrubbing sanitizer for error text.
#[derive(Debug, Clone, Copy)]
pub struct Redactor {
    max_length: usize,
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LENGTH)
    }
}

impl Redactor {
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Never fails. The result is at most `max_length` characters.
    pub fn redact(&self, message: &str) -> String {
        truncate_chars(&scrub(message), self.max_length).to_string()
    }
}

fn scrub(text: &str) -> String {
    let text = SECRET_ASSIGNMENT.replace_all(text, "${1}=[REDACTED]");
    let text = EMAIL.replace_all(&text, "[EMAIL]");
    let text = CARD_NUMBER.replace_all(&text, "[CARD]");
    let text = SSN.replace_all(&text, "[SSN]");
    PHONE.replace_all(&text, "[PHONE]").into_owned()
}

/// Truncate to at most `max` characters on a char boundary.
fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
