//! Redaction of credentials and tokens before anything reaches a log line.
//!
//! Upstream error bodies and internal error text may echo bearer tokens,
//! API keys or account identifiers. Every such string goes through
//! [`redact_sensitive`] first; the result masks secrets with a fixed-length
//! asterisk run so the original length is not leaked either.

use once_cell::sync::Lazy;
use regex::Regex;

/// Fixed mask substituted for every secret.
pub const MASK: &str = "********";

/// Maximum length of a redacted snippet that may be logged.
pub const MAX_LOGGED_CHARS: usize = 200;

static BEARER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(bearer\s+)[A-Za-z0-9._~+/=-]+").expect("valid regex"));

static KEY_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)((?:api[_-]?keys?|tokens?|secret|password|authorization)["']?\s*[:=]\s*["']?)[A-Za-z0-9._~+/=-]+"#)
        .expect("valid regex")
});

static OPENAI_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"sk-[A-Za-z0-9_-]{6,}").expect("valid regex"));

static HEX_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b[a-f0-9]{32}\b").expect("valid regex"));

static LONG_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9+/_-]{32,}").expect("valid regex"));

/// Mask anything that looks like a credential and cap the result length.
pub fn redact_sensitive(input: &str) -> String {
    let out = BEARER.replace_all(input, format!("${{1}}{}", MASK).as_str());
    let out = KEY_VALUE.replace_all(&out, format!("${{1}}{}", MASK).as_str());
    let out = OPENAI_KEY.replace_all(&out, format!("sk-{}", MASK).as_str());
    let out = HEX_ID.replace_all(&out, MASK);
    let out = LONG_TOKEN.replace_all(&out, MASK);
    truncate_chars(&out, MAX_LOGGED_CHARS)
}

/// Truncate on a char boundary.
pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    match input.char_indices().nth(max_chars) {
        Some((idx, _)) => input[..idx].to_string(),
        None => input.to_string(),
    }
}
