//! Git plumbing used to materialize a task's repository: clone, checkout,
//! and the dirty/diff checks the baseline validator and attempt recorder
//! rely on.
//!
//! Every operation here is a single, literal git subcommand — no porcelain
//! shortcuts — so its output is stable to parse. Clone and checkout need
//! outbound network and so run with `Network::Bridge`; status and diff are
//! local-only and run with `Network::None`.

use std::time::Duration;

use crate::model::{ToolError, ToolErrorKind};
use crate::sandbox::{Network, Sandbox, SandboxCommand};

const GIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Clones `url` into `dest`, which must not already exist.
pub async fn clone(sandbox: &dyn Sandbox, url: &str, dest: &str) -> Result<(), ToolError> {
    let cmd = SandboxCommand::new(format!("git clone {url} {dest}"), ".", GIT_TIMEOUT)
        .with_network(Network::Bridge);
    run_expect_success(sandbox, cmd, "git clone").await?;
    Ok(())
}

/// Checks out `commit` inside the repository at `repo_dir`.
pub async fn checkout(sandbox: &dyn Sandbox, repo_dir: &str, commit: &str) -> Result<(), ToolError> {
    let cmd = SandboxCommand::new(format!("git checkout {commit}"), repo_dir, GIT_TIMEOUT)
        .with_network(Network::Bridge);
    run_expect_success(sandbox, cmd, "git checkout").await?;
    Ok(())
}

/// Returns `true` if the working tree has any tracked-file modifications.
/// Untracked files are excluded, matching `--untracked-files=no`.
pub async fn is_dirty(sandbox: &dyn Sandbox, repo_dir: &str) -> Result<bool, ToolError> {
    let cmd = SandboxCommand::new(
        "git status --porcelain --untracked-files=no",
        repo_dir,
        GIT_TIMEOUT,
    );
    let out = sandbox.run(cmd).await?;
    Ok(!out.stdout.trim().is_empty())
}

/// Returns the `git diff --stat` summary of the working tree against HEAD.
pub async fn diff_stat(sandbox: &dyn Sandbox, repo_dir: &str) -> Result<String, ToolError> {
    let cmd = SandboxCommand::new("git diff --stat", repo_dir, GIT_TIMEOUT);
    let out = sandbox.run(cmd).await?;
    Ok(out.stdout)
}

/// Returns the full unified diff of the working tree against HEAD.
pub async fn diff(sandbox: &dyn Sandbox, repo_dir: &str) -> Result<String, ToolError> {
    let cmd = SandboxCommand::new("git diff", repo_dir, GIT_TIMEOUT);
    let out = sandbox.run(cmd).await?;
    Ok(out.stdout)
}

async fn run_expect_success(
    sandbox: &dyn Sandbox,
    cmd: SandboxCommand,
    op: &str,
) -> Result<crate::sandbox::SandboxOutput, ToolError> {
    let out = sandbox.run(cmd).await?;
    if out.exit_code != 0 {
        return Err(ToolError::new(
            ToolErrorKind::SandboxError,
            format!("{op} failed (exit {}): {}", out.exit_code, out.stderr),
        ));
    }
    Ok(out)
}

/// Host-direct git helper: the same literal subcommands as above, run with
/// `std::process::Command` instead of through a [`Sandbox`] — used by the
/// baseline validator's own clone/checkout step, which needs real outbound
/// network and runs before any task-owned code (and so before there's
/// anything worth sandboxing) is in the loop.
pub mod host {
    use std::process::Output;

    use tokio::time::timeout;

    use crate::model::{ToolError, ToolErrorKind};

    use super::GIT_TIMEOUT;

    async fn run_git(args: &[&str], cwd: &str) -> Result<Output, ToolError> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let cwd = cwd.to_string();
        let spawn = tokio::task::spawn_blocking(move || {
            std::process::Command::new("git").args(&args).current_dir(&cwd).output()
        });
        match timeout(GIT_TIMEOUT, spawn).await {
            Ok(join) => join
                .map_err(|e| ToolError::new(ToolErrorKind::SandboxError, format!("git helper panicked: {e}")))?
                .map_err(|e| ToolError::new(ToolErrorKind::SandboxError, format!("failed to spawn git: {e}"))),
            Err(_) => Err(ToolError::new(ToolErrorKind::SandboxError, "git command timed out")),
        }
    }

    fn expect_success(op: &str, output: Output) -> Result<Output, ToolError> {
        if !output.status.success() {
            return Err(ToolError::new(
                ToolErrorKind::SandboxError,
                format!(
                    "{op} failed (exit {}): {}",
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr)
                ),
            ));
        }
        Ok(output)
    }

    /// Clones `url` into `dest`, which must not already exist.
    pub async fn clone(url: &str, dest: &str) -> Result<(), ToolError> {
        let out = run_git(&["clone", url, dest], ".").await?;
        expect_success("git clone", out)?;
        Ok(())
    }

    /// Checks out `commit` inside the repository at `repo_dir`.
    pub async fn checkout(repo_dir: &str, commit: &str) -> Result<(), ToolError> {
        let out = run_git(&["checkout", commit], repo_dir).await?;
        expect_success("git checkout", out)?;
        Ok(())
    }

    /// Returns `true` if the working tree has any tracked-file modifications.
    pub async fn is_dirty(repo_dir: &str) -> Result<bool, ToolError> {
        let out = run_git(&["status", "--porcelain", "--untracked-files=no"], repo_dir).await?;
        let out = expect_success("git status", out)?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Returns the `git diff --stat` summary of the working tree against HEAD.
    pub async fn diff_stat(repo_dir: &str) -> Result<String, ToolError> {
        let out = run_git(&["diff", "--stat"], repo_dir).await?;
        let out = expect_success("git diff --stat", out)?;
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    /// Returns the full unified diff of the working tree against HEAD.
    pub async fn diff(repo_dir: &str) -> Result<String, ToolError> {
        let out = run_git(&["diff"], repo_dir).await?;
        let out = expect_success("git diff", out)?;
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::HostSandbox;
    use std::process::Command;

    fn init_repo_with_commit(dir: &std::path::Path) -> String {
        Command::new("git").args(["init", "-q"]).current_dir(dir).output().unwrap();
        Command::new("git")
            .args(["config", "user.email", "test@example.com"])
            .current_dir(dir)
            .output()
            .unwrap();
        Command::new("git")
            .args(["config", "user.name", "test"])
            .current_dir(dir)
            .output()
            .unwrap();
        std::fs::write(dir.join("a.txt"), "hello\n").unwrap();
        Command::new("git").args(["add", "."]).current_dir(dir).output().unwrap();
        Command::new("git")
            .args(["commit", "-q", "-m", "init"])
            .current_dir(dir)
            .output()
            .unwrap();
        let out = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(dir)
            .output()
            .unwrap();
        String::from_utf8(out.stdout).unwrap().trim().to_string()
    }

    #[tokio::test]
    async fn is_dirty_false_on_clean_checkout() {
        let dir = tempfile::tempdir().unwrap();
        init_repo_with_commit(dir.path());
        let sandbox = HostSandbox::new();
        let dirty = is_dirty(&sandbox, dir.path().to_str().unwrap()).await.unwrap();
        assert!(!dirty);
    }

    #[tokio::test]
    async fn is_dirty_true_after_modification() {
        let dir = tempfile::tempdir().unwrap();
        init_repo_with_commit(dir.path());
        std::fs::write(dir.path().join("a.txt"), "changed\n").unwrap();
        let sandbox = HostSandbox::new();
        let dirty = is_dirty(&sandbox, dir.path().to_str().unwrap()).await.unwrap();
        assert!(dirty);
    }

    #[tokio::test]
    async fn checkout_moves_head_to_requested_commit() {
        let dir = tempfile::tempdir().unwrap();
        let commit = init_repo_with_commit(dir.path());
        let sandbox = HostSandbox::new();
        checkout(&sandbox, dir.path().to_str().unwrap(), &commit).await.unwrap();
        let diff_text = diff(&sandbox, dir.path().to_str().unwrap()).await.unwrap();
        assert!(diff_text.is_empty());
    }

    #[tokio::test]
    async fn host_is_dirty_false_on_clean_checkout() {
        let dir = tempfile::tempdir().unwrap();
        init_repo_with_commit(dir.path());
        let dirty = host::is_dirty(dir.path().to_str().unwrap()).await.unwrap();
        assert!(!dirty);
    }

    #[tokio::test]
    async fn host_is_dirty_true_after_modification() {
        let dir = tempfile::tempdir().unwrap();
        init_repo_with_commit(dir.path());
        std::fs::write(dir.path().join("a.txt"), "changed\n").unwrap();
        let dirty = host::is_dirty(dir.path().to_str().unwrap()).await.unwrap();
        assert!(dirty);
    }

    #[tokio::test]
    async fn host_checkout_moves_head_to_requested_commit() {
        let dir = tempfile::tempdir().unwrap();
        let commit = init_repo_with_commit(dir.path());
        host::checkout(dir.path().to_str().unwrap(), &commit).await.unwrap();
        let diff_text = host::diff(dir.path().to_str().unwrap()).await.unwrap();
        assert!(diff_text.is_empty());
    }

    #[tokio::test]
    async fn host_clone_materializes_a_working_tree() {
        let src = tempfile::tempdir().unwrap();
        init_repo_with_commit(src.path());
        let dest = tempfile::tempdir().unwrap();
        let dest_path = dest.path().join("clone");
        host::clone(src.path().to_str().unwrap(), dest_path.to_str().unwrap())
            .await
            .unwrap();
        assert!(dest_path.join("a.txt").exists());
    }

    #[tokio::test]
    async fn host_diff_stat_reports_changed_files() {
        let dir = tempfile::tempdir().unwrap();
        init_repo_with_commit(dir.path());
        std::fs::write(dir.path().join("a.txt"), "changed\n").unwrap();
        let stat = host::diff_stat(dir.path().to_str().unwrap()).await.unwrap();
        assert!(stat.contains("a.txt"));
    }
}
