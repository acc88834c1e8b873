// CLI argument-surface tests. No database: these only exercise parsing,
// help output, and the fail-fast path when POSTGRES_DSN is missing.

use assert_cmd::Command;
use predicates::prelude::*;

fn cmd() -> Command {
    let mut cmd = Command::cargo_bin("scm-sync").expect("binary builds");
    cmd.env_remove("POSTGRES_DSN");
    cmd
}

#[test]
fn top_level_help_lists_command_groups() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("reaper"))
        .stdout(predicate::str::contains("scheduler"))
        .stdout(predicate::str::contains("admin"));
}

#[test]
fn status_help_lists_queries() {
    cmd()
        .args(["status", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("summary"))
        .stdout(predicate::str::contains("repos"))
        .stdout(predicate::str::contains("jobs"))
        .stdout(predicate::str::contains("runs"))
        .stdout(predicate::str::contains("locks"))
        .stdout(predicate::str::contains("cursors"));
}

#[test]
fn summary_accepts_format_flag() {
    cmd()
        .args(["status", "summary", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--format"))
        .stdout(predicate::str::contains("prometheus"))
        .stdout(predicate::str::contains("--window"))
        .stdout(predicate::str::contains("--top-lag"));
}

#[test]
fn admin_help_lists_repair_groups() {
    cmd()
        .args(["admin", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("jobs"))
        .stdout(predicate::str::contains("locks"))
        .stdout(predicate::str::contains("pauses"))
        .stdout(predicate::str::contains("cursors"))
        .stdout(predicate::str::contains("rate-limit"));
}

#[test]
fn missing_dsn_fails_with_diagnostic() {
    cmd()
        .args(["status", "jobs"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("POSTGRES_DSN"));
}

#[test]
fn unknown_subcommand_is_a_usage_error() {
    cmd().arg("frobnicate").assert().failure();
}

#[test]
fn reaper_reap_accepts_policy_flags() {
    cmd()
        .args(["reaper", "reap", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--job-policy"))
        .stdout(predicate::str::contains("--max-reaper-backoff-seconds"))
        .stdout(predicate::str::contains("--locks-only"));
}

#[test]
fn scheduler_run_accepts_loop_flag() {
    cmd()
        .args(["scheduler", "run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--loop"))
        .stdout(predicate::str::contains("--scan-interval-seconds"));
}
