//! Failure-reason classification from a failed attempt's log tail.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::ReasonCode;

static AUTH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(unauthori[sz]ed|authentication (failed|error)|invalid api key|api key (is )?(missing|invalid|expired)|\b401\b|not logged in|please (log ?in|run .*login))",
    )
    .unwrap()
});

static MODEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(model[^\n]{0,40}(not found|not available|unavailable|does not exist|unsupported)|unknown model|no such model|model_not_found)",
    )
    .unwrap()
});

static PERMISSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(permission denied|operation not permitted|\bEACCES\b|\b403\b|forbidden)")
        .unwrap()
});

static TIMEOUT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(timed out|deadline exceeded|request timeout|\bETIMEDOUT\b|\b(408|504)\b)")
        .unwrap()
});

/// Classify a non-zero exit from the tail of the job log.
///
/// Patterns are checked in a fixed order so a log mentioning both an auth
/// failure and a permission error is reported as `auth_error`.
pub fn classify_failure(log_tail: &str) -> ReasonCode {
    if AUTH_RE.is_match(log_tail) {
        ReasonCode::AuthError
    } else if MODEL_RE.is_match(log_tail) {
        ReasonCode::ModelUnavailable
    } else if PERMISSION_RE.is_match(log_tail) {
        ReasonCode::PermissionDenied
    } else if TIMEOUT_RE.is_match(log_tail) {
        ReasonCode::WaitTimeout
    } else {
        ReasonCode::ExecutorException
    }
}

/// Last `max_bytes` of `text`, cut on a char boundary.
pub fn tail(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
