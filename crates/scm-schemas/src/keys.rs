//! Canonical key construction for KV-resident control state.
//!
//! Every writer uses the canonical forms produced here; readers may fall
//! back to the legacy short keys (scope without the project prefix) that
//! older deployments wrote. Centralizing construction keeps the scheduler,
//! the admin CLI, and the status projections byte-identical on keys.

use anyhow::{anyhow, Result};
use url::Url;

// ---------------------------------------------------------------------------
// Circuit-breaker keys
// ---------------------------------------------------------------------------

/// The breaker's unit of isolation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CbScope {
    Global,
    Pool(String),
    Instance(String),
    Tenant(String),
}

impl CbScope {
    /// Scope rendered without the project prefix, e.g. `instance:gitlab.example.com`.
    pub fn as_suffix(&self) -> String {
        match self {
            CbScope::Global => "global".to_string(),
            CbScope::Pool(pool) => format!("pool:{pool}"),
            CbScope::Instance(instance) => format!("instance:{}", normalize_instance_key(instance)),
            CbScope::Tenant(tenant) => format!("tenant:{tenant}"),
        }
    }
}

/// Canonical breaker key: `<project_key>:<scope>`.
pub fn build_circuit_breaker_key(project_key: &str, scope: &CbScope) -> String {
    format!("{project_key}:{}", scope.as_suffix())
}

/// Keys to try on read, canonical first. Older deployments stored the bare
/// scope without a project prefix; writes never produce that form.
pub fn legacy_circuit_breaker_keys(project_key: &str, scope: &CbScope) -> Vec<String> {
    vec![build_circuit_breaker_key(project_key, scope), scope.as_suffix()]
}

// ---------------------------------------------------------------------------
// Pause keys
// ---------------------------------------------------------------------------

/// Pause-record key: `repo:<repo_id>:<job_type>`.
pub fn build_pause_key(repo_id: i64, job_type: &str) -> String {
    format!("repo:{repo_id}:{job_type}")
}

pub fn parse_pause_key(key: &str) -> Result<(i64, String)> {
    let rest = key
        .strip_prefix("repo:")
        .ok_or_else(|| anyhow!("not a pause key: {}", key))?;
    let (repo_id, job_type) = rest
        .split_once(':')
        .ok_or_else(|| anyhow!("malformed pause key: {}", key))?;
    if job_type.is_empty() || job_type.contains(':') {
        return Err(anyhow!("malformed pause key: {}", key));
    }
    let repo_id: i64 = repo_id
        .parse()
        .map_err(|_| anyhow!("non-numeric repo id in pause key: {}", key))?;
    Ok((repo_id, job_type.to_string()))
}

// ---------------------------------------------------------------------------
// Instance keys
// ---------------------------------------------------------------------------

/// Reduce a repository or API URL to its bucket/breaker instance key:
/// lower-cased hostname, keeping an explicit non-default port.
///
/// Inputs that are already bare hostnames pass through lower-cased.
pub fn normalize_instance_key(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    if let Ok(url) = Url::parse(trimmed) {
        if let Some(host) = url.host_str() {
            let host = host.to_ascii_lowercase();
            return match (url.port(), default_port(url.scheme())) {
                (Some(port), Some(default)) if port == default => host,
                (Some(port), _) => format!("{host}:{port}"),
                (None, _) => host,
            };
        }
    }

    // Not a URL: treat as host[:port], strip any path remnant.
    let bare = trimmed.split('/').next().unwrap_or(trimmed);
    bare.to_ascii_lowercase()
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        "ssh" => Some(22),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_key_formats() {
        assert_eq!(build_circuit_breaker_key("acme", &CbScope::Global), "acme:global");
        assert_eq!(
            build_circuit_breaker_key("acme", &CbScope::Pool("fast".into())),
            "acme:pool:fast"
        );
        assert_eq!(
            build_circuit_breaker_key("acme", &CbScope::Tenant("team-a".into())),
            "acme:tenant:team-a"
        );
    }

    #[test]
    fn instance_scope_normalizes_url() {
        let scope = CbScope::Instance("https://GitLab.Example.com/group/repo".into());
        assert_eq!(
            build_circuit_breaker_key("acme", &scope),
            "acme:instance:gitlab.example.com"
        );
    }

    #[test]
    fn legacy_candidates_canonical_first() {
        let keys = legacy_circuit_breaker_keys("acme", &CbScope::Global);
        assert_eq!(keys, vec!["acme:global".to_string(), "global".to_string()]);
    }

    #[test]
    fn pause_key_round_trip() {
        let key = build_pause_key(42, "commits");
        assert_eq!(key, "repo:42:commits");
        assert_eq!(parse_pause_key(&key).unwrap(), (42, "commits".to_string()));
    }

    #[test]
    fn pause_key_rejects_garbage() {
        assert!(parse_pause_key("repo:x:commits").is_err());
        assert!(parse_pause_key("bucket:1:commits").is_err());
        assert!(parse_pause_key("repo:1").is_err());
        assert!(parse_pause_key("repo:1:a:b").is_err());
    }

    #[test]
    fn normalize_drops_default_port_keeps_custom() {
        assert_eq!(normalize_instance_key("https://gitlab.example.com:443/x"), "gitlab.example.com");
        assert_eq!(
            normalize_instance_key("https://gitlab.example.com:8443/x"),
            "gitlab.example.com:8443"
        );
        assert_eq!(normalize_instance_key("http://git.internal:80"), "git.internal");
    }

    #[test]
    fn normalize_accepts_bare_hostnames() {
        assert_eq!(normalize_instance_key("GitLab.Example.COM"), "gitlab.example.com");
        assert_eq!(normalize_instance_key("gitlab.example.com:8080"), "gitlab.example.com:8080");
        assert_eq!(normalize_instance_key(""), "");
    }
}
