//! Command execution, either directly on the host or inside a hardened
//! Docker container.
//!
//! Both implementations share one trait so the rest of the crate (tools,
//! git helper, baseline validator) never branches on which is in play.

mod bind;
mod docker;
mod host;

pub use bind::BindSandbox;
pub use docker::DockerSandbox;
pub use host::HostSandbox;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::model::{ToolError, ToolErrorKind};

/// Network policy for a single command invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// No network access; container filesystem also mounted read-only.
    None,
    /// Outbound network access permitted (git clone, package installs).
    Bridge,
}

/// One command to run, with its own timeout and environment overlay.
#[derive(Debug, Clone)]
pub struct SandboxCommand {
    pub command: String,
    pub cwd: String,
    pub timeout: Duration,
    pub network: Network,
    pub env: HashMap<String, String>,
}

impl SandboxCommand {
    pub fn new(command: impl Into<String>, cwd: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.into(),
            timeout,
            network: Network::None,
            env: default_env(),
        }
    }

    pub fn with_network(mut self, network: Network) -> Self {
        self.network = network;
        self
    }
}

/// Deterministic environment defaults applied to every sandboxed command,
/// confirmed against the reference harness's sandbox wrapper.
fn default_env() -> HashMap<String, String> {
    HashMap::from([
        ("PYTHONHASHSEED".to_string(), "0".to_string()),
        ("TZ".to_string(), "UTC".to_string()),
        ("LC_ALL".to_string(), "C".to_string()),
        ("LANG".to_string(), "C".to_string()),
        ("PIP_DISABLE_PIP_VERSION_CHECK".to_string(), "1".to_string()),
    ])
}

/// Outcome of one sandboxed invocation. `exit_code` is `124` on timeout, by
/// convention, with a synthetic line appended to `stderr`.
#[derive(Debug, Clone)]
pub struct SandboxOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
}

pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn run(&self, cmd: SandboxCommand) -> Result<SandboxOutput, ToolError>;
}

/// Wraps a future with `tokio::time::timeout`, converting elapsed time into
/// the conventional 124 exit code rather than a tool error, since a command
/// timing out is an ordinary (if unsuccessful) tool outcome.
pub(crate) async fn with_timeout<F>(
    timeout: Duration,
    fut: F,
) -> Result<SandboxOutput, ToolError>
where
    F: std::future::Future<Output = Result<SandboxOutput, ToolError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Ok(SandboxOutput {
            exit_code: TIMEOUT_EXIT_CODE,
            stdout: String::new(),
            stderr: format!("command timed out after {:.0}s", timeout.as_secs_f64()),
            duration: timeout,
            timed_out: true,
        }),
    }
}

pub(crate) fn spawn_error(err: std::io::Error) -> ToolError {
    ToolError::new(ToolErrorKind::SandboxError, format!("failed to spawn command: {err}"))
}
