//! Host-direct sandbox: runs commands as a plain child process on the host,
//! with no container isolation at all.
//!
//! Not one of `spec.md` §4.1's two sandbox modes — it backs `--no-sandbox`,
//! a local dev/smoke-test escape hatch for running a task without Docker
//! installed. Nothing here is hardened; a command gets full host process
//! authority.

use std::time::Instant;

use async_trait::async_trait;

use super::{spawn_error, with_timeout, Sandbox, SandboxCommand, SandboxOutput};
use crate::model::ToolError;

pub struct HostSandbox;

impl HostSandbox {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HostSandbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sandbox for HostSandbox {
    async fn run(&self, cmd: SandboxCommand) -> Result<SandboxOutput, ToolError> {
        with_timeout(cmd.timeout, run_once(cmd)).await
    }
}

async fn run_once(cmd: SandboxCommand) -> Result<SandboxOutput, ToolError> {
    let started = Instant::now();
    let command = cmd.command.clone();
    let cwd = cmd.cwd.clone();
    let env = cmd.env.clone();

    let output = tokio::task::spawn_blocking(move || {
        std::process::Command::new("sh")
            .args(["-c", &command])
            .current_dir(&cwd)
            .envs(&env)
            .output()
    })
    .await
    .map_err(|e| spawn_error(std::io::Error::other(e.to_string())))?
    .map_err(spawn_error)?;

    Ok(SandboxOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        duration: started.elapsed(),
        timed_out: false,
    })
}
