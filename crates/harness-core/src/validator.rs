//! Baseline validation: before any agent sees a task, confirms the task's
//! test command actually fails on a fresh checkout, so a task that is
//! already green (or broken for the wrong reason) never enters the benchmark
//! pool.
//!
//! Sequence: clone, checkout the pinned commit, run `setup.commands` with
//! network access, confirm the worktree is still clean, run the test command
//! with no network, then (time budget permitting) run it a second time to
//! rule out flakiness. Any stage failing short-circuits with a
//! [`FailureReason`] naming which one.

use std::path::Path;
use std::time::{Duration, Instant};

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::git;
use crate::model::{FailureReason, TaskSpec, ValidationSpec};
use crate::sandbox::{Network, Sandbox, SandboxCommand};

/// Wall-clock reserved for a flakiness rerun; below this, the rerun is
/// skipped rather than risking the attempt's own timeout.
const MIN_RERUN_BUDGET_SEC: f64 = 5.0;

/// Outcome of one baseline validation pass.
#[derive(Debug, Clone)]
pub struct BaselineOutcome {
    pub failed_as_expected: bool,
    pub exit_code: i32,
    pub failure_reason: Option<FailureReason>,
    pub stdout: String,
    pub stderr: String,
    /// Stable key for "this is the same failure": a sorted list of pytest
    /// `FAILED`/`ERROR` node ids when present, else a content hash.
    pub signature: String,
    pub rerun_performed: bool,
    pub rerun_matched: Option<bool>,
    pub duration_sec: f64,
}

struct StageFailure {
    exit_code: i32,
    reason: FailureReason,
    stdout: String,
    stderr: String,
}

/// Runs the full baseline-validation sequence against a fresh checkout at
/// `workspace_dir/repo`. When `artifacts_dir` is `Some`, the post-setup
/// `git diff --stat`/`git diff`, the failure signature, and (on a
/// `baseline_mismatch` or `baseline_flaky` outcome) a diagnostic file are
/// persisted under `artifacts_dir/baseline/` (`spec.md` §4.8 steps 3, 5, 6, 7).
pub async fn validate_baseline(
    sandbox: &dyn Sandbox,
    task: &TaskSpec,
    workspace_dir: &Path,
) -> BaselineOutcome {
    validate_baseline_with_artifacts(sandbox, task, workspace_dir, None).await
}

/// Same as [`validate_baseline`], with diagnostic artifact persistence.
pub async fn validate_baseline_with_artifacts(
    sandbox: &dyn Sandbox,
    task: &TaskSpec,
    workspace_dir: &Path,
    artifacts_dir: Option<&Path>,
) -> BaselineOutcome {
    let started = Instant::now();
    match run_stages(sandbox, task, workspace_dir, started, artifacts_dir).await {
        Ok(success) => BaselineOutcome {
            failed_as_expected: true,
            exit_code: success.exit_code,
            failure_reason: None,
            stdout: success.stdout,
            stderr: success.stderr,
            signature: success.signature,
            rerun_performed: success.rerun_performed,
            rerun_matched: success.rerun_matched,
            duration_sec: started.elapsed().as_secs_f64(),
        },
        Err(failure) => BaselineOutcome {
            failed_as_expected: false,
            exit_code: failure.exit_code,
            failure_reason: Some(failure.reason),
            stdout: failure.stdout,
            stderr: failure.stderr,
            signature: String::new(),
            rerun_performed: false,
            rerun_matched: None,
            duration_sec: started.elapsed().as_secs_f64(),
        },
    }
}

struct StageSuccess {
    exit_code: i32,
    stdout: String,
    stderr: String,
    signature: String,
    rerun_performed: bool,
    rerun_matched: Option<bool>,
}

async fn run_stages(
    sandbox: &dyn Sandbox,
    task: &TaskSpec,
    workspace_dir: &Path,
    started: Instant,
    artifacts_dir: Option<&Path>,
) -> Result<StageSuccess, StageFailure> {
    let repo_dir = workspace_dir.join("repo");
    let repo_dir_str = repo_dir.to_string_lossy().to_string();

    let repo_url = resolve_repo_url(&task.repo.url);
    git::clone(sandbox, &repo_url, &repo_dir_str)
        .await
        .map_err(|e| stage_failure(-1, FailureReason::GitCloneFailed, &e.message))?;

    git::checkout(sandbox, &repo_dir_str, &task.repo.commit)
        .await
        .map_err(|e| stage_failure(-1, FailureReason::GitCheckoutFailed, &e.message))?;

    if !task.setup.commands.is_empty() {
        let setup_commands = task.setup.commands.join(" && ");
        let out = run_cmd(
            sandbox,
            &setup_commands,
            &repo_dir_str,
            task.environment.timeout_sec,
            Network::Bridge,
        )
        .await
        .map_err(|e| stage_failure(-1, FailureReason::SetupFailed, &e.message))?;

        if out.exit_code != 0 {
            let reason = if out.timed_out {
                FailureReason::SetupTimeout
            } else {
                FailureReason::SetupFailed
            };
            return Err(StageFailure {
                exit_code: out.exit_code,
                reason,
                stdout: out.stdout,
                stderr: out.stderr,
            });
        }
    }

    let dirty = git::is_dirty(sandbox, &repo_dir_str)
        .await
        .map_err(|e| stage_failure(-1, FailureReason::SetupDirtyWorktree, &e.message))?;

    if let Some(dir) = artifacts_dir {
        let stat = git::diff_stat(sandbox, &repo_dir_str).await.unwrap_or_default();
        let full = git::diff(sandbox, &repo_dir_str).await.unwrap_or_default();
        write_diagnostic(dir, "post_setup_diff_stat.txt", &stat);
        write_diagnostic(dir, "post_setup_diff.txt", &full);
    }

    if dirty {
        return Err(StageFailure {
            exit_code: -1,
            reason: FailureReason::SetupDirtyWorktree,
            stdout: String::new(),
            stderr: "setup modified tracked files; baseline invalid".to_string(),
        });
    }

    let run = run_cmd(
        sandbox,
        &task.run.command,
        &repo_dir_str,
        task.environment.timeout_sec,
        Network::None,
    )
    .await
    .map_err(|e| stage_failure(-1, FailureReason::Unknown, &e.message))?;

    if run.exit_code == 0 {
        return Err(StageFailure {
            exit_code: 0,
            reason: FailureReason::BaselineNotFailing,
            stdout: run.stdout,
            stderr: run.stderr,
        });
    }

    if let Some(reason) = pytest_failure_reason(run.exit_code) {
        return Err(StageFailure {
            exit_code: run.exit_code,
            reason,
            stdout: run.stdout,
            stderr: run.stderr,
        });
    }

    let mismatches = evaluate_expectations(&task.validation, run.exit_code, &run.stdout, &run.stderr);
    if !mismatches.is_empty() {
        if let Some(dir) = artifacts_dir {
            write_diagnostic(dir, "mismatch.txt", &mismatches.join("\n"));
        }
        return Err(StageFailure {
            exit_code: run.exit_code,
            reason: FailureReason::BaselineMismatch,
            stdout: run.stdout,
            stderr: run.stderr,
        });
    }

    let signature = failure_signature(&run.stdout, &run.stderr);
    if let Some(dir) = artifacts_dir {
        write_diagnostic(dir, "signature.txt", &signature);
    }

    let elapsed = started.elapsed().as_secs_f64();
    let remaining = task.environment.timeout_sec as f64 - elapsed;
    if remaining < MIN_RERUN_BUDGET_SEC {
        return Ok(StageSuccess {
            exit_code: run.exit_code,
            stdout: run.stdout,
            stderr: run.stderr,
            signature,
            rerun_performed: false,
            rerun_matched: None,
        });
    }

    let rerun_timeout = remaining.max(1.0) as u64;
    let rerun = run_cmd(sandbox, &task.run.command, &repo_dir_str, rerun_timeout, Network::None)
        .await
        .map_err(|e| stage_failure(-1, FailureReason::Unknown, &e.message))?;
    let rerun_signature = failure_signature(&rerun.stdout, &rerun.stderr);
    let matched = rerun.exit_code == run.exit_code && rerun_signature == signature;

    if !matched {
        if let Some(dir) = artifacts_dir {
            let comparison = serde_json::json!({
                "first": {"exit_code": run.exit_code, "signature": signature},
                "rerun": {"exit_code": rerun.exit_code, "signature": rerun_signature},
            });
            write_diagnostic(
                dir,
                "flaky_comparison.json",
                &serde_json::to_string_pretty(&comparison).unwrap_or_default(),
            );
        }
        return Err(StageFailure {
            exit_code: rerun.exit_code,
            reason: FailureReason::BaselineFlaky,
            stdout: rerun.stdout,
            stderr: rerun.stderr,
        });
    }

    Ok(StageSuccess {
        exit_code: run.exit_code,
        stdout: run.stdout,
        stderr: run.stderr,
        signature,
        rerun_performed: true,
        rerun_matched: Some(true),
    })
}

/// Best-effort write of one diagnostic artifact under `artifacts_dir/baseline/`.
/// Failure to persist a diagnostic never fails baseline validation itself.
fn write_diagnostic(artifacts_dir: &Path, name: &str, contents: &str) {
    let dir = artifacts_dir.join("baseline");
    if std::fs::create_dir_all(&dir).is_ok() {
        let _ = std::fs::write(dir.join(name), contents);
    }
}

fn stage_failure(exit_code: i32, reason: FailureReason, message: &str) -> StageFailure {
    StageFailure {
        exit_code,
        reason,
        stdout: String::new(),
        stderr: message.to_string(),
    }
}

async fn run_cmd(
    sandbox: &dyn Sandbox,
    command: &str,
    cwd: &str,
    timeout_sec: u64,
    network: Network,
) -> Result<crate::sandbox::SandboxOutput, crate::model::ToolError> {
    let cmd = SandboxCommand::new(command, cwd, Duration::from_secs(timeout_sec)).with_network(network);
    sandbox.run(cmd).await
}

/// `file://` and absolute paths pass through unchanged; anything else is
/// handed to `git` as-is (a normal remote URL). Exists mainly so local
/// fixture repos (used by this crate's own tests) resolve the same way a
/// real clone target would.
fn resolve_repo_url(repo_url: &str) -> String {
    if repo_url.starts_with("file://") {
        return repo_url.strip_prefix("file://").unwrap().to_string();
    }
    repo_url.to_string()
}

/// Maps a pytest process exit code onto a [`FailureReason`], for the codes
/// that mean something other than "tests ran and some failed" (exit 1,
/// which is the expected baseline outcome and returns `None`).
fn pytest_failure_reason(exit_code: i32) -> Option<FailureReason> {
    match exit_code {
        1 => None,
        2 => Some(FailureReason::Interrupted),
        3 => Some(FailureReason::Internal),
        4 | 5 => Some(FailureReason::CollectionError),
        _ => None,
    }
}

fn evaluate_expectations(validation: &ValidationSpec, exit_code: i32, stdout: &str, stderr: &str) -> Vec<String> {
    let mut mismatches = Vec::new();
    let combined = format!("{stdout}\n{stderr}");

    if !validation.expected_exit_codes.is_empty() && !validation.expected_exit_codes.contains(&exit_code) {
        mismatches.push(format!(
            "exit_code {exit_code} not in expected_exit_codes {:?}",
            validation.expected_exit_codes
        ));
    }
    if let Some(pattern) = &validation.expected_failure_regex {
        if !regex_matches(pattern, &combined) {
            mismatches.push(format!("expected_failure_regex did not match: {pattern}"));
        }
    }
    if let Some(pattern) = &validation.expected_stdout_regex {
        if !regex_matches(pattern, stdout) {
            mismatches.push(format!("expected_stdout_regex did not match: {pattern}"));
        }
    }
    if let Some(pattern) = &validation.expected_stderr_regex {
        if !regex_matches(pattern, stderr) {
            mismatches.push(format!("expected_stderr_regex did not match: {pattern}"));
        }
    }
    for pattern in &validation.disallowed_failure_regex {
        if regex_matches(pattern, &combined) {
            mismatches.push(format!("disallowed_failure_regex matched: {pattern}"));
        }
    }
    for expected_test in &validation.expected_failing_tests {
        if !combined.contains(expected_test.as_str()) {
            mismatches.push(format!("expected_failing_tests missing: {expected_test}"));
        }
    }
    mismatches
}

fn regex_matches(pattern: &str, text: &str) -> bool {
    Regex::new(pattern).map(|re| re.is_match(text)).unwrap_or(false)
}

/// Extracts a sorted, deduplicated list of pytest `FAILED`/`ERROR` node ids
/// from combined stdout/stderr. Returns `None` when no such line is found.
pub fn extract_failing_node_id(stderr: &str, stdout: &str) -> Option<String> {
    let node_id_line = Regex::new(r"^(FAILED|ERROR)\s+(.+?)(?:\s+-\s+.*)?$").unwrap();
    let combined = format!("{stdout}\n{stderr}");
    let mut ids: Vec<String> = combined
        .lines()
        .filter_map(|line| node_id_line.captures(line).map(|c| format!("{} {}", &c[1], c[2].trim())))
        .collect();
    if ids.is_empty() {
        return None;
    }
    ids.sort();
    ids.dedup();
    Some(format!("nodeids:{}", ids.join("|")))
}

/// A stable signature for "the same test failure happened again": the
/// extracted node-id list when present, `"empty-output"` for a silent
/// failure, else a SHA-256 of the combined output.
pub fn failure_signature(stdout: &str, stderr: &str) -> String {
    if let Some(node_ids) = extract_failing_node_id(stderr, stdout) {
        return node_ids;
    }
    let combined = format!("{stdout}\n{stderr}");
    if combined.trim().is_empty() {
        return "empty-output".to_string();
    }
    let mut hasher = Sha256::new();
    hasher.update(combined.trim().as_bytes());
    format!("sha256:{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgentSpec, EnvironmentSpec, RepoSpec, RunSpec, SetupSpec};
    use crate::sandbox::HostSandbox;
    use std::process::Command;

    fn init_repo_with_file(dir: &Path, contents: &str) -> String {
        Command::new("git").args(["init", "-q"]).current_dir(dir).output().unwrap();
        Command::new("git").args(["config", "user.email", "t@example.com"]).current_dir(dir).output().unwrap();
        Command::new("git").args(["config", "user.name", "t"]).current_dir(dir).output().unwrap();
        std::fs::write(dir.join("a.py"), contents).unwrap();
        Command::new("git").args(["add", "."]).current_dir(dir).output().unwrap();
        Command::new("git").args(["commit", "-q", "-m", "init"]).current_dir(dir).output().unwrap();
        let out = Command::new("git").args(["rev-parse", "HEAD"]).current_dir(dir).output().unwrap();
        String::from_utf8(out.stdout).unwrap().trim().to_string()
    }

    fn task(source_dir: &Path, commit: &str, command: &str) -> TaskSpec {
        TaskSpec {
            task_spec_version: "1".to_string(),
            id: "t1".to_string(),
            suite: "fixtures".to_string(),
            repo: RepoSpec {
                url: format!("file://{}", source_dir.to_string_lossy()),
                commit: commit.to_string(),
            },
            environment: EnvironmentSpec {
                docker_image: "unused".to_string(),
                workdir: "/workspace".to_string(),
                timeout_sec: 30,
            },
            setup: SetupSpec::default(),
            run: RunSpec { command: command.to_string() },
            validation: ValidationSpec::default(),
            harness_min_version: None,
            labels: Vec::new(),
            agent: AgentSpec::default(),
        }
    }

    #[tokio::test]
    async fn a_genuinely_broken_baseline_passes_validation() {
        let source = tempfile::tempdir().unwrap();
        let commit = init_repo_with_file(source.path(), "def add(a, b):\n    return a - b\n");
        let workspace = tempfile::tempdir().unwrap();
        let t = task(source.path(), &commit, "python3 -c \"import a; assert a.add(2,3)==5\"");

        let outcome = validate_baseline(&HostSandbox::new(), &t, workspace.path()).await;
        assert!(outcome.failed_as_expected);
        assert_ne!(outcome.exit_code, 0);
        assert!(outcome.failure_reason.is_none());
    }

    #[tokio::test]
    async fn a_passing_baseline_is_invalid() {
        let source = tempfile::tempdir().unwrap();
        let commit = init_repo_with_file(source.path(), "def add(a, b):\n    return a + b\n");
        let workspace = tempfile::tempdir().unwrap();
        let t = task(source.path(), &commit, "python3 -c \"import a; assert a.add(2,3)==5\"");

        let outcome = validate_baseline(&HostSandbox::new(), &t, workspace.path()).await;
        assert!(!outcome.failed_as_expected);
        assert_eq!(outcome.failure_reason, Some(FailureReason::BaselineNotFailing));
    }

    #[tokio::test]
    async fn a_flaky_failure_signature_rejects_the_baseline() {
        // The test command fails every run but names a different pytest
        // node id each time (the script writes a script during setup that
        // increments a counter file), so the rerun's failure signature never
        // matches the first run's — the baseline is flaky, not reliably
        // broken.
        let source = tempfile::tempdir().unwrap();
        let commit = init_repo_with_file(source.path(), "x = 1\n");
        let workspace = tempfile::tempdir().unwrap();
        let mut t = task(source.path(), &commit, "python3 check.py");
        t.setup.commands = vec![concat!(
            "cat > check.py <<'EOF'\n",
            "import os, sys\n",
            "p = \"flaky_counter.txt\"\n",
            "n = int(open(p).read()) if os.path.exists(p) else 0\n",
            "open(p, \"w\").write(str(n + 1))\n",
            "sys.stderr.write(\"FAILED tests/test_x.py::test_%d - AssertionError\" % n)\n",
            "sys.exit(1)\n",
            "EOF",
        )
        .to_string()];

        let outcome = validate_baseline(&HostSandbox::new(), &t, workspace.path()).await;
        assert!(!outcome.failed_as_expected);
        assert_eq!(outcome.failure_reason, Some(FailureReason::BaselineFlaky));
    }

    #[tokio::test]
    async fn an_unresolvable_commit_fails_at_the_checkout_stage() {
        let source = tempfile::tempdir().unwrap();
        init_repo_with_file(source.path(), "x = 1\n");
        let workspace = tempfile::tempdir().unwrap();
        let t = task(source.path(), "0000000000000000000000000000000000000000", "true");

        let outcome = validate_baseline(&HostSandbox::new(), &t, workspace.path()).await;
        assert!(!outcome.failed_as_expected);
        assert_eq!(outcome.failure_reason, Some(FailureReason::GitCheckoutFailed));
    }

    #[test]
    fn node_id_signature_sorts_and_dedupes() {
        let stderr = "FAILED tests/test_a.py::test_one - AssertionError\nFAILED tests/test_a.py::test_one - AssertionError\nERROR tests/test_b.py::test_two\n";
        let sig = failure_signature("", stderr);
        assert_eq!(
            sig,
            "nodeids:ERROR tests/test_b.py::test_two|FAILED tests/test_a.py::test_one"
        );
    }

    #[test]
    fn falls_back_to_content_hash_without_node_ids() {
        let sig = failure_signature("some output", "Traceback (most recent call last):\n");
        assert!(sig.starts_with("sha256:"));
    }

    #[test]
    fn empty_output_has_a_sentinel_signature() {
        assert_eq!(failure_signature("", ""), "empty-output");
    }

    #[tokio::test]
    async fn a_valid_baseline_persists_diff_and_signature_artifacts() {
        let source = tempfile::tempdir().unwrap();
        let commit = init_repo_with_file(source.path(), "def add(a, b):\n    return a - b\n");
        let workspace = tempfile::tempdir().unwrap();
        let artifacts = tempfile::tempdir().unwrap();
        let t = task(source.path(), &commit, "python3 -c \"import a; assert a.add(2,3)==5\"");

        let outcome = validate_baseline_with_artifacts(
            &HostSandbox::new(),
            &t,
            workspace.path(),
            Some(artifacts.path()),
        )
        .await;
        assert!(outcome.failed_as_expected);

        let baseline_dir = artifacts.path().join("baseline");
        assert!(baseline_dir.join("post_setup_diff_stat.txt").exists());
        assert!(baseline_dir.join("post_setup_diff.txt").exists());
        let sig = std::fs::read_to_string(baseline_dir.join("signature.txt")).unwrap();
        assert_eq!(sig, outcome.signature);
    }

    #[tokio::test]
    async fn a_mismatched_baseline_persists_a_diagnostic_file() {
        let source = tempfile::tempdir().unwrap();
        let commit = init_repo_with_file(source.path(), "def add(a, b):\n    return a - b\n");
        let workspace = tempfile::tempdir().unwrap();
        let artifacts = tempfile::tempdir().unwrap();
        let mut t = task(source.path(), &commit, "python3 -c \"import a; assert a.add(2,3)==5\"");
        t.validation.expected_exit_codes = vec![7];

        let outcome = validate_baseline_with_artifacts(
            &HostSandbox::new(),
            &t,
            workspace.path(),
            Some(artifacts.path()),
        )
        .await;
        assert_eq!(outcome.failure_reason, Some(FailureReason::BaselineMismatch));
        let diagnostic = std::fs::read_to_string(artifacts.path().join("baseline").join("mismatch.txt")).unwrap();
        assert!(diagnostic.contains("expected_exit_codes"));
    }

    #[test]
    fn disallowed_pattern_list_flags_any_match() {
        let validation = ValidationSpec {
            disallowed_failure_regex: vec!["SyntaxError".to_string(), "ImportError".to_string()],
            ..ValidationSpec::default()
        };
        let mismatches = evaluate_expectations(&validation, 1, "", "ImportError: no module named foo");
        assert_eq!(mismatches.len(), 1);
        assert!(mismatches[0].contains("ImportError"));
    }
}
