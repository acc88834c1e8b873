//! Error taxonomy shared by adapters, the finish path, and the reaper.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Category assigned to every run-level or item-level error.
///
/// Permanent categories skip backoff and send the job straight to `dead`;
/// transient categories retry with category-specific backoff bases; the rest
/// are treated as transient until attempts are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    AuthError,
    RepoNotFound,
    PermissionDenied,
    RateLimited,
    Timeout,
    Network,
    ServerError,
    ContentTooLarge,
    Validation,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::AuthError => "auth_error",
            ErrorCategory::RepoNotFound => "repo_not_found",
            ErrorCategory::PermissionDenied => "permission_denied",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Network => "network",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::ContentTooLarge => "content_too_large",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "auth_error" => Ok(ErrorCategory::AuthError),
            "repo_not_found" => Ok(ErrorCategory::RepoNotFound),
            "permission_denied" => Ok(ErrorCategory::PermissionDenied),
            "rate_limited" => Ok(ErrorCategory::RateLimited),
            "timeout" => Ok(ErrorCategory::Timeout),
            "network" => Ok(ErrorCategory::Network),
            "server_error" => Ok(ErrorCategory::ServerError),
            "content_too_large" => Ok(ErrorCategory::ContentTooLarge),
            "validation" => Ok(ErrorCategory::Validation),
            "unknown" => Ok(ErrorCategory::Unknown),
            other => Err(anyhow!("invalid error category: {}", other)),
        }
    }

    /// Permanent errors never retry.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ErrorCategory::AuthError | ErrorCategory::RepoNotFound | ErrorCategory::PermissionDenied
        )
    }

    /// Transient errors retry with category-specific backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCategory::RateLimited
                | ErrorCategory::Timeout
                | ErrorCategory::Network
                | ErrorCategory::ServerError
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_round_trip() {
        for c in [
            ErrorCategory::AuthError,
            ErrorCategory::RepoNotFound,
            ErrorCategory::PermissionDenied,
            ErrorCategory::RateLimited,
            ErrorCategory::Timeout,
            ErrorCategory::Network,
            ErrorCategory::ServerError,
            ErrorCategory::ContentTooLarge,
            ErrorCategory::Validation,
            ErrorCategory::Unknown,
        ] {
            assert_eq!(ErrorCategory::parse(c.as_str()).unwrap(), c);
        }
    }

    #[test]
    fn permanent_and_transient_are_disjoint() {
        for c in [
            ErrorCategory::AuthError,
            ErrorCategory::RateLimited,
            ErrorCategory::ContentTooLarge,
            ErrorCategory::Unknown,
        ] {
            assert!(!(c.is_permanent() && c.is_transient()));
        }
        assert!(ErrorCategory::AuthError.is_permanent());
        assert!(ErrorCategory::RateLimited.is_transient());
        assert!(!ErrorCategory::Unknown.is_permanent());
        assert!(!ErrorCategory::Unknown.is_transient());
    }
}
