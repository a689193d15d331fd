//! Ephemeral persistent Docker sandbox (`spec.md` §4.1 mode 2): one
//! long-lived, hardened container is started lazily on the first command and
//! kept alive for the lifetime of this struct. Every later command runs
//! through `docker exec` against that same container rather than spawning a
//! fresh one, and the container's network is flipped between `none` and
//! `bridge` with `docker network connect`/`disconnect` only when a command's
//! requested network differs from whatever the container is currently set
//! to — an idle container never pays for a toggle it didn't ask for.
//!
//! The container's workspace is a `--tmpfs` mount at the same absolute path
//! the rest of the crate already uses as `cwd` (the host-side scratch
//! directory), so paths built against the host workspace resolve unchanged
//! inside the container without this sandbox needing to know the attempt's
//! directory layout. Because that tmpfs starts empty, the host's own copy of
//! the directory (if anything was staged into it before the first command
//! runs) is mirrored in with `docker cp` at container start; [`copy_out`]
//! exists for the reverse direction, since nothing written inside the
//! container's tmpfs is otherwise visible to the host.
//!
//! The hardening flag set is the same one `bind.rs`'s sibling mode relies on
//! conceptually carrying: capabilities dropped, no new privileges, a bounded
//! PID table, private IPC, a writable `/tmp`. Root-filesystem read-only
//! toggling per command (mode 1's trick, since it gets a fresh container
//! every time) doesn't apply here — this container survives across commands
//! with differing network needs, so its rootfs is left writable for the
//! life of the container rather than attempting a live remount.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;

use super::{spawn_error, with_timeout, Network, Sandbox, SandboxCommand, SandboxOutput};
use crate::model::{ToolError, ToolErrorKind};

#[derive(Debug, Clone)]
struct ContainerState {
    id: String,
    network: Network,
}

pub struct DockerSandbox {
    image: String,
    host_workspace: String,
    state: Mutex<Option<ContainerState>>,
}

impl DockerSandbox {
    /// `host_workspace` is the absolute path every command's `cwd` falls
    /// under; it becomes the container's tmpfs mount point.
    pub fn new(image: impl Into<String>, host_workspace: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            host_workspace: host_workspace.into(),
            state: Mutex::new(None),
        }
    }

    fn snapshot(&self) -> Option<ContainerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn store(&self, state: ContainerState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = Some(state);
    }

    /// Starts the container on first use; every later call reuses its id.
    async fn ensure_container(&self) -> Result<ContainerState, ToolError> {
        if let Some(state) = self.snapshot() {
            return Ok(state);
        }
        let id = run_docker(create_args(&self.image, &self.host_workspace))
            .await
            .and_then(expect_id)?;

        // Best-effort: the host workspace may still be empty (e.g. before a
        // clone has run), in which case this copies nothing and is a no-op.
        let _ = run_docker(vec![
            "cp".to_string(),
            format!("{}/.", self.host_workspace),
            format!("{id}:{}", self.host_workspace),
        ])
        .await;

        let state = ContainerState { id, network: Network::None };
        self.store(state.clone());
        Ok(state)
    }

    /// Connects or disconnects the container's `bridge` network so it
    /// matches `wanted`, skipping the call entirely when it already does.
    async fn ensure_network(&self, wanted: Network) -> Result<(), ToolError> {
        let Some(mut state) = self.snapshot() else {
            return Err(ToolError::new(ToolErrorKind::SandboxError, "container not started"));
        };
        if state.network == wanted {
            return Ok(());
        }
        if let Some(args) = network_toggle_args(&state.id, state.network, wanted) {
            run_docker(args).await?;
        }
        state.network = wanted;
        self.store(state);
        Ok(())
    }

    /// Copies `container_path` out of the running container to `host_dest`
    /// — the explicit file-transfer path `spec.md` §4.1 names for this mode,
    /// since nothing written to the container's tmpfs workspace is visible
    /// to the host any other way.
    pub async fn copy_out(&self, container_path: &str, host_dest: &str) -> Result<(), ToolError> {
        let state = self
            .snapshot()
            .ok_or_else(|| ToolError::new(ToolErrorKind::SandboxError, "container not started"))?;
        run_docker(vec![
            "cp".to_string(),
            format!("{}:{container_path}", state.id),
            host_dest.to_string(),
        ])
        .await?;
        Ok(())
    }
}

impl Drop for DockerSandbox {
    /// Best-effort container teardown. `docker run -d --rm` only removes the
    /// container once it stops, and `sleep infinity` never stops on its own,
    /// so this has to ask explicitly.
    fn drop(&mut self) {
        if let Some(state) = self.snapshot() {
            let _ = std::process::Command::new("docker").args(["rm", "-f", &state.id]).output();
        }
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn run(&self, cmd: SandboxCommand) -> Result<SandboxOutput, ToolError> {
        with_timeout(cmd.timeout, self.run_once(cmd)).await
    }
}

impl DockerSandbox {
    async fn run_once(&self, cmd: SandboxCommand) -> Result<SandboxOutput, ToolError> {
        let started = Instant::now();
        let state = self.ensure_container().await?;
        self.ensure_network(cmd.network).await?;

        let output = run_docker(exec_args(&state.id, &cmd)).await?;
        Ok(SandboxOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: started.elapsed(),
            timed_out: false,
        })
    }
}

/// `docker run -d` arguments that create the long-lived, hardened container.
/// Its own process is `sleep infinity` — everything real happens through
/// later `docker exec` calls.
fn create_args(image: &str, host_workspace: &str) -> Vec<String> {
    vec![
        "run".into(),
        "-d".into(),
        "--rm".into(),
        "--cap-drop=ALL".into(),
        "--security-opt".into(),
        "no-new-privileges".into(),
        "--pids-limit=512".into(),
        "--ipc=none".into(),
        "--tmpfs".into(),
        "/tmp".into(),
        "--tmpfs".into(),
        host_workspace.to_string(),
        "--network".into(),
        "none".into(),
        image.to_string(),
        "sleep".into(),
        "infinity".into(),
    ]
}

/// `docker exec` arguments for one command against an already-running
/// container, carrying the command's working directory and environment
/// overlay.
fn exec_args(container_id: &str, cmd: &SandboxCommand) -> Vec<String> {
    let mut args: Vec<String> = vec!["exec".into(), "-w".into(), cmd.cwd.clone()];
    for (key, value) in sorted_env(&cmd.env) {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }
    args.push(container_id.to_string());
    args.push("sh".into());
    args.push("-c".into());
    args.push(cmd.command.clone());
    args
}

/// Deterministic ordering for `-e` flags so tests (and logs) don't depend on
/// `HashMap` iteration order.
fn sorted_env(env: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut pairs: Vec<_> = env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    pairs.sort();
    pairs
}

/// `docker network connect|disconnect bridge <id>` arguments, or `None` when
/// `from == to` and nothing needs to change.
fn network_toggle_args(container_id: &str, from: Network, to: Network) -> Option<Vec<String>> {
    match (from, to) {
        (Network::None, Network::Bridge) => Some(vec![
            "network".into(),
            "connect".into(),
            "bridge".into(),
            container_id.to_string(),
        ]),
        (Network::Bridge, Network::None) => Some(vec![
            "network".into(),
            "disconnect".into(),
            "bridge".into(),
            container_id.to_string(),
        ]),
        _ => None,
    }
}

fn expect_id(output: std::process::Output) -> Result<String, ToolError> {
    if !output.status.success() {
        return Err(ToolError::new(
            ToolErrorKind::SandboxError,
            format!("docker run failed: {}", String::from_utf8_lossy(&output.stderr)),
        ));
    }
    let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if id.is_empty() {
        return Err(ToolError::new(ToolErrorKind::SandboxError, "docker run produced no container id"));
    }
    Ok(id)
}

async fn run_docker(args: Vec<String>) -> Result<std::process::Output, ToolError> {
    tokio::task::spawn_blocking(move || std::process::Command::new("docker").args(&args).output())
        .await
        .map_err(|e| spawn_error(std::io::Error::other(e.to_string())))?
        .map_err(spawn_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn base_cmd(network: Network) -> SandboxCommand {
        SandboxCommand {
            command: "echo hi".into(),
            cwd: "/workspace".into(),
            timeout: Duration::from_secs(5),
            network,
            env: HashMap::new(),
        }
    }

    #[test]
    fn create_args_carry_hardening_flags_and_tmpfs_workspace() {
        let args = create_args("example:latest", "/host/checkout");
        for flag in [
            "--cap-drop=ALL",
            "no-new-privileges",
            "--pids-limit=512",
            "--ipc=none",
        ] {
            assert!(args.iter().any(|a| a == flag), "missing {flag}");
        }
        let pos = args.iter().rposition(|a| a == "--tmpfs").expect("missing --tmpfs");
        assert_eq!(args[pos + 1], "/host/checkout");
        assert!(args.iter().any(|a| a == "sleep"));
    }

    #[test]
    fn create_args_start_with_network_none() {
        let args = create_args("example:latest", "/host/checkout");
        let pos = args.iter().position(|a| a == "--network").unwrap();
        assert_eq!(args[pos + 1], "none");
    }

    #[test]
    fn exec_args_run_through_sh_dash_c_in_the_requested_cwd() {
        let args = exec_args("abc123", &base_cmd(Network::None));
        assert_eq!(args[0], "exec");
        assert_eq!(args[1], "-w");
        assert_eq!(args[2], "/workspace");
        assert_eq!(args[args.len() - 4], "abc123");
        assert_eq!(args[args.len() - 3], "sh");
        assert_eq!(args[args.len() - 2], "-c");
        assert_eq!(args[args.len() - 1], "echo hi");
    }

    #[test]
    fn exec_args_pass_env_as_repeated_flags() {
        let mut cmd = base_cmd(Network::None);
        cmd.env.insert("FOO".into(), "bar".into());
        let args = exec_args("abc123", &cmd);
        let pos = args.iter().position(|a| a == "FOO=bar").expect("missing env flag");
        assert_eq!(args[pos - 1], "-e");
    }

    #[test]
    fn no_toggle_needed_when_network_already_matches() {
        assert!(network_toggle_args("id", Network::None, Network::None).is_none());
        assert!(network_toggle_args("id", Network::Bridge, Network::Bridge).is_none());
    }

    #[test]
    fn toggle_from_none_to_bridge_connects() {
        let args = network_toggle_args("abc123", Network::None, Network::Bridge).unwrap();
        assert_eq!(args, vec!["network", "connect", "bridge", "abc123"]);
    }

    #[test]
    fn toggle_from_bridge_to_none_disconnects() {
        let args = network_toggle_args("abc123", Network::Bridge, Network::None).unwrap();
        assert_eq!(args, vec!["network", "disconnect", "bridge", "abc123"]);
    }

    #[cfg(unix)]
    #[test]
    fn expect_id_trims_trailing_newline_from_docker_run_output() {
        use std::os::unix::process::ExitStatusExt;
        let output = std::process::Output {
            status: std::process::ExitStatus::from_raw(0),
            stdout: b"abcdef1234567890\n".to_vec(),
            stderr: Vec::new(),
        };
        assert_eq!(expect_id(output).unwrap(), "abcdef1234567890");
    }

    #[cfg(unix)]
    #[test]
    fn expect_id_rejects_a_failed_run() {
        use std::os::unix::process::ExitStatusExt;
        let output = std::process::Output {
            status: std::process::ExitStatus::from_raw(256),
            stdout: Vec::new(),
            stderr: b"no such image".to_vec(),
        };
        assert!(expect_id(output).is_err());
    }
}
