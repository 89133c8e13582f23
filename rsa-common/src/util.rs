//! Small string helpers shared by the dispatcher.

use regex::Regex;
use std::sync::LazyLock;

static SECRET_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"(?i)(password|passwd|pwd)[=:]\s*\S+", "$1=***REDACTED***"),
        (r"(?i)(token|secret|bearer)\s*[=:]?\s*\S{10,}", "$1 ***REDACTED***"),
        (r"(?i)(otp|code)[=:]\s*\d{4,8}", "$1=***REDACTED***"),
    ]
    .into_iter()
    .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
    .collect()
});

/// Mask all but the last four characters of an account identifier.
///
/// Strings of four characters or fewer are returned unchanged.
pub fn mask_string(s: &str) -> String {
    let count = s.chars().count();
    if count <= 4 {
        return s.to_string();
    }
    let visible: String = s.chars().skip(count - 4).collect();
    format!("{}{}", "*".repeat(count - 4), visible)
}

/// Sanitize a string for safe logging (redact credential-like patterns).
pub fn sanitize_for_log(s: &str) -> String {
    let mut result = s.to_string();
    for (re, replacement) in SECRET_PATTERNS.iter() {
        result = re.replace_all(&result, *replacement).to_string();
    }
    result
}
