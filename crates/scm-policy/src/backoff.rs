//! Error classification and retry backoff.
//!
//! The reaper classifies free-text `last_error` strings; the worker already
//! has a structured category from the adapter. Both funnel into the same
//! backoff math: `min(max_backoff, base · 2^(attempts−1) + jitter)`, with a
//! category-specific base. Jitter is injected by the caller so the math
//! stays deterministic under test.

use scm_schemas::ErrorCategory;

/// Transient backoff bases, in seconds.
pub const BACKOFF_BASE_RATE_LIMITED: f64 = 30.0;
pub const BACKOFF_BASE_TIMEOUT: f64 = 15.0;
pub const BACKOFF_BASE_NETWORK: f64 = 10.0;
pub const BACKOFF_BASE_SERVER_ERROR: f64 = 10.0;

/// Backoff base for a category. Unknown/other categories fall back to the
/// caller's configured retry delay.
pub fn backoff_base_seconds(category: ErrorCategory, default_base: f64) -> f64 {
    match category {
        ErrorCategory::RateLimited => BACKOFF_BASE_RATE_LIMITED,
        ErrorCategory::Timeout => BACKOFF_BASE_TIMEOUT,
        ErrorCategory::Network => BACKOFF_BASE_NETWORK,
        ErrorCategory::ServerError => BACKOFF_BASE_SERVER_ERROR,
        _ => default_base,
    }
}

/// Exponential backoff with a cap. `attempts` counts the attempt that just
/// failed (1-based); `jitter_seconds` is supplied by the caller, typically
/// `rand * base`.
pub fn calculate_backoff_seconds(
    attempts: u32,
    category: ErrorCategory,
    default_base: f64,
    max_backoff: f64,
    jitter_seconds: f64,
) -> f64 {
    let base = backoff_base_seconds(category, default_base);
    let exponent = attempts.max(1) - 1;
    let doubling = 2f64.powi(exponent.min(16) as i32);
    (base * doubling + jitter_seconds.max(0.0)).min(max_backoff)
}

/// Classify a stored `last_error` string. Keyword-based by necessity: by the
/// time the reaper sees it, only redacted free text is left.
pub fn classify_last_error(last_error: Option<&str>) -> ErrorCategory {
    let Some(raw) = last_error else {
        return ErrorCategory::Unknown;
    };
    let text = raw.to_ascii_lowercase();

    let has = |needle: &str| text.contains(needle);

    if has("401") || has("unauthorized") || has("invalid token") || has("auth_error") {
        ErrorCategory::AuthError
    } else if has("404") || has("not found") || has("repo_not_found") {
        ErrorCategory::RepoNotFound
    } else if has("permission denied") || has("permission_denied") || has("403") || has("forbidden")
    {
        ErrorCategory::PermissionDenied
    } else if has("429") || has("rate limit") || has("rate_limited") || has("too many requests") {
        ErrorCategory::RateLimited
    } else if has("timeout") || has("timed out") {
        ErrorCategory::Timeout
    } else if has("dns") || has("connection reset") || has("connection refused") || has("network") {
        ErrorCategory::Network
    } else if has("500") || has("502") || has("503") || has("504") || has("server error") {
        ErrorCategory::ServerError
    } else if has("content_too_large") || has("too large") {
        ErrorCategory::ContentTooLarge
    } else {
        ErrorCategory::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bases_by_category() {
        assert_eq!(backoff_base_seconds(ErrorCategory::RateLimited, 60.0), 30.0);
        assert_eq!(backoff_base_seconds(ErrorCategory::Timeout, 60.0), 15.0);
        assert_eq!(backoff_base_seconds(ErrorCategory::Network, 60.0), 10.0);
        assert_eq!(backoff_base_seconds(ErrorCategory::ServerError, 60.0), 10.0);
        assert_eq!(backoff_base_seconds(ErrorCategory::Unknown, 60.0), 60.0);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let b = |attempts| {
            calculate_backoff_seconds(attempts, ErrorCategory::Timeout, 60.0, 1800.0, 0.0)
        };
        assert_eq!(b(1), 15.0);
        assert_eq!(b(2), 30.0);
        assert_eq!(b(3), 60.0);
        assert_eq!(b(0), 15.0); // treated as first attempt
    }

    #[test]
    fn backoff_clamped_at_max() {
        let delay =
            calculate_backoff_seconds(10, ErrorCategory::RateLimited, 60.0, 1800.0, 0.0);
        assert_eq!(delay, 1800.0);
    }

    #[test]
    fn jitter_added_before_clamp() {
        let delay = calculate_backoff_seconds(1, ErrorCategory::Network, 60.0, 1800.0, 3.5);
        assert_eq!(delay, 13.5);
        let negative_jitter =
            calculate_backoff_seconds(1, ErrorCategory::Network, 60.0, 1800.0, -10.0);
        assert_eq!(negative_jitter, 10.0);
    }

    #[test]
    fn classifies_common_failures() {
        assert_eq!(
            classify_last_error(Some("HTTP 401 Unauthorized")),
            ErrorCategory::AuthError
        );
        assert_eq!(
            classify_last_error(Some("project not found (404)")),
            ErrorCategory::RepoNotFound
        );
        assert_eq!(
            classify_last_error(Some("403 Forbidden on protected branch")),
            ErrorCategory::PermissionDenied
        );
        assert_eq!(
            classify_last_error(Some("429 Too Many Requests")),
            ErrorCategory::RateLimited
        );
        assert_eq!(
            classify_last_error(Some("read timed out after 30s")),
            ErrorCategory::Timeout
        );
        assert_eq!(
            classify_last_error(Some("connection reset by peer")),
            ErrorCategory::Network
        );
        assert_eq!(
            classify_last_error(Some("upstream returned 502")),
            ErrorCategory::ServerError
        );
        assert_eq!(classify_last_error(Some("something odd")), ErrorCategory::Unknown);
        assert_eq!(classify_last_error(None), ErrorCategory::Unknown);
    }
}
