//! Prometheus text-format rendering of a [`SyncSummary`].

use std::fmt::Write;

use crate::SyncSummary;

fn breaker_state_value(state: &str) -> i64 {
    match state {
        "open" => 2,
        "half_open" => 1,
        _ => 0,
    }
}

/// Label values are quoted; embedded quotes and backslashes escaped per the
/// exposition format.
fn escape_label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

pub fn format_prometheus(summary: &SyncSummary) -> String {
    let mut out = String::new();
    let w = &mut out;

    let _ = writeln!(w, "scm_repos_total {}", summary.repos_count);
    for (repo_type, count) in &summary.repos_by_type {
        let _ = writeln!(
            w,
            "scm_repos_by_type{{repo_type=\"{}\"}} {}",
            escape_label(repo_type),
            count
        );
    }

    let jobs_total: i64 = summary.jobs_by_status.values().sum();
    let _ = writeln!(w, "scm_jobs_total {jobs_total}");
    for (status, count) in &summary.jobs_by_status {
        let _ = writeln!(
            w,
            "scm_jobs_total{{status=\"{}\"}} {}",
            escape_label(status),
            count
        );
    }

    let _ = writeln!(w, "scm_expired_locks {}", summary.locks.expired);
    let _ = writeln!(w, "scm_cursors_total {}", summary.cursors_count);

    let _ = writeln!(
        w,
        "scm_window_failed_rate{{window_minutes=\"{}\"}} {}",
        summary.window_minutes, summary.window_health.failed_rate
    );
    let _ = writeln!(
        w,
        "scm_window_rate_limit_rate{{window_minutes=\"{}\"}} {}",
        summary.window_minutes, summary.window_health.rate_limit_rate
    );

    for (instance, count) in &summary.queue_by_instance {
        let _ = writeln!(
            w,
            "scm_queue_by_instance{{instance=\"{}\"}} {}",
            escape_label(instance),
            count
        );
    }
    for (tenant, count) in &summary.queue_by_tenant {
        let _ = writeln!(
            w,
            "scm_queue_by_tenant{{tenant=\"{}\"}} {}",
            escape_label(tenant),
            count
        );
    }

    for lag in &summary.top_lag_repos {
        let _ = writeln!(
            w,
            "scm_repo_lag_seconds{{repo_id=\"{}\",repo_type=\"{}\",job_type=\"{}\"}} {}",
            lag.repo_id,
            escape_label(&lag.repo_type),
            escape_label(&lag.job_type),
            lag.lag_seconds
        );
    }

    for breaker in &summary.circuit_breakers {
        let _ = writeln!(
            w,
            "scm_breaker_state{{key=\"{}\"}} {}",
            escape_label(&breaker.key),
            breaker_state_value(&breaker.state)
        );
    }

    for bucket in &summary.rate_limit_buckets {
        let key = escape_label(&bucket.instance_key);
        let _ = writeln!(w, "scm_rate_limit_bucket_tokens{{instance_key=\"{key}\"}} {}", bucket.tokens);
        let _ = writeln!(
            w,
            "scm_rate_limit_bucket_paused{{instance_key=\"{key}\"}} {}",
            if bucket.is_paused { 1 } else { 0 }
        );
        let _ = writeln!(
            w,
            "scm_rate_limit_bucket_pause_seconds{{instance_key=\"{key}\"}} {}",
            bucket.pause_remaining_seconds
        );
    }

    for (reason, count) in &summary.pauses_by_reason {
        let _ = writeln!(
            w,
            "scm_pauses_by_reason{{reason_code=\"{}\"}} {}",
            escape_label(reason),
            count
        );
    }

    for entry in &summary.retry_backoffs {
        let _ = writeln!(
            w,
            "scm_retry_backoff_seconds{{instance_key=\"{}\",tenant_id=\"{}\",job_type=\"{}\"}} {}",
            escape_label(&entry.instance_key),
            escape_label(&entry.tenant_id),
            escape_label(&entry.job_type),
            entry.backoff_seconds
        );
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample_summary;

    #[test]
    fn emits_required_series() {
        let out = format_prometheus(&sample_summary());

        assert!(out.contains("scm_repos_total 3"));
        assert!(out.contains("scm_jobs_total 3"));
        assert!(out.contains("scm_jobs_total{status=\"pending\"} 2"));
        assert!(out.contains("scm_expired_locks 1"));
        assert!(out.contains("scm_window_failed_rate{window_minutes=\"60\"} 0.25"));
        assert!(out.contains("scm_window_rate_limit_rate{window_minutes=\"60\"} 0.1"));
        assert!(out.contains("scm_queue_by_instance{instance=\"gitlab.example.com\"} 2"));
        assert!(out.contains("scm_queue_by_tenant{tenant=\"acme\"} 2"));
        assert!(out.contains(
            "scm_repo_lag_seconds{repo_id=\"7\",repo_type=\"git\",job_type=\"commits\"} 4200"
        ));
        assert!(out.contains("scm_breaker_state{key=\"acme:instance:gitlab.example.com\"} 2"));
        assert!(out.contains("scm_rate_limit_bucket_tokens{instance_key=\"gitlab.example.com\"} 12.5"));
        assert!(out.contains("scm_rate_limit_bucket_paused{instance_key=\"gitlab.example.com\"} 1"));
        assert!(out.contains("scm_pauses_by_reason{reason_code=\"error_budget\"} 2"));
        assert!(out.contains(
            "scm_retry_backoff_seconds{instance_key=\"gitlab.example.com\",tenant_id=\"acme\",job_type=\"mrs\"} 45"
        ));
    }

    #[test]
    fn breaker_state_encoding() {
        assert_eq!(breaker_state_value("closed"), 0);
        assert_eq!(breaker_state_value("half_open"), 1);
        assert_eq!(breaker_state_value("open"), 2);
        assert_eq!(breaker_state_value("garbage"), 0);
    }

    #[test]
    fn label_escaping() {
        assert_eq!(escape_label(r#"a"b\c"#), r#"a\"b\\c"#);
    }
}
