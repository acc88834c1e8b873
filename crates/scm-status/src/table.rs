//! Console table rendering for operators who don't want JSON.

use std::fmt::Write;

use crate::SyncSummary;

pub fn format_table(summary: &SyncSummary) -> String {
    let mut out = String::new();
    let w = &mut out;

    let _ = writeln!(w, "repos: {}", summary.repos_count);
    for (repo_type, count) in &summary.repos_by_type {
        let _ = writeln!(w, "  {repo_type}: {count}");
    }

    let _ = writeln!(w, "jobs:");
    for (status, count) in &summary.jobs_by_status {
        let _ = writeln!(w, "  {status}: {count}");
    }

    let _ = writeln!(w, "runs (24h):");
    for (status, count) in &summary.runs_24h_by_status {
        let _ = writeln!(w, "  {status}: {count}");
    }

    let _ = writeln!(
        w,
        "locks: active={} expired={}",
        summary.locks.active, summary.locks.expired
    );
    let _ = writeln!(w, "cursors: {}", summary.cursors_count);
    let _ = writeln!(
        w,
        "window ({}m): runs={} failed_rate={:.2} rate_limit_rate={:.2}",
        summary.window_minutes,
        summary.window_health.total_runs,
        summary.window_health.failed_rate,
        summary.window_health.rate_limit_rate
    );

    if !summary.top_lag_repos.is_empty() {
        let _ = writeln!(w, "top lag:");
        for lag in &summary.top_lag_repos {
            let _ = writeln!(
                w,
                "  repo {} {} {}: {:.0}s",
                lag.repo_id, lag.repo_type, lag.job_type, lag.lag_seconds
            );
        }
    }

    if !summary.circuit_breakers.is_empty() {
        let _ = writeln!(w, "breakers:");
        for b in &summary.circuit_breakers {
            let _ = writeln!(w, "  {}: {}", b.key, b.state);
        }
    }

    if !summary.rate_limit_buckets.is_empty() {
        let _ = writeln!(w, "buckets:");
        for b in &summary.rate_limit_buckets {
            let paused = if b.is_paused {
                format!(" paused {:.0}s", b.pause_remaining_seconds)
            } else {
                String::new()
            };
            let _ = writeln!(
                w,
                "  {}: tokens={:.1}/{:.0} rate={:.1}/s{}",
                b.instance_key, b.tokens, b.burst, b.rate, paused
            );
        }
    }

    if !summary.pauses_by_reason.is_empty() {
        let _ = writeln!(w, "pauses:");
        for (reason, count) in &summary.pauses_by_reason {
            let _ = writeln!(w, "  {reason}: {count}");
        }
    }

    out
}
