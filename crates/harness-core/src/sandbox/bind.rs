//! Bind-mode Docker sandbox (`spec.md` §4.1 mode 1): launches a fresh,
//! hardened container for every command, bind-mounts the host workspace
//! read-write at the same path the rest of the crate already uses as `cwd`,
//! runs one `sh -c <command>`, and lets the container exit — there is no
//! state carried between calls, unlike [`super::DockerSandbox`]'s long-lived
//! container.
//!
//! Hardening matches `SPEC_FULL.md` supplement #8 exactly: capabilities
//! dropped, no new privileges, a bounded PID table, private IPC, a writable
//! tmpfs at `/tmp`, and the rootfs itself made read-only whenever the
//! command has no network (a command with network access may need to write
//! outside the bind-mounted workspace, e.g. package caches, so read-only is
//! only safe to assume when it's also offline).

use std::time::Instant;

use async_trait::async_trait;

use super::{spawn_error, with_timeout, Network, Sandbox, SandboxCommand, SandboxOutput};
use crate::model::ToolError;

pub struct BindSandbox {
    image: String,
}

impl BindSandbox {
    pub fn new(image: impl Into<String>) -> Self {
        Self { image: image.into() }
    }
}

#[async_trait]
impl Sandbox for BindSandbox {
    async fn run(&self, cmd: SandboxCommand) -> Result<SandboxOutput, ToolError> {
        with_timeout(cmd.timeout, run_once(self.image.clone(), cmd)).await
    }
}

async fn run_once(image: String, cmd: SandboxCommand) -> Result<SandboxOutput, ToolError> {
    let started = Instant::now();
    let args = run_args(&image, &cmd);

    let output = tokio::task::spawn_blocking(move || {
        std::process::Command::new("docker").args(&args).output()
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

/// `docker run` arguments for one fresh, hardened container: bind-mounts
/// `cmd.cwd` read-write at the same absolute path, applies the hardening
/// flag set, toggles `--read-only` when the command is offline, passes
/// environment as repeated `-e KEY=VALUE`, and runs `sh -c <command>`.
fn run_args(image: &str, cmd: &SandboxCommand) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "run".into(),
        "--rm".into(),
        "--cap-drop=ALL".into(),
        "--security-opt".into(),
        "no-new-privileges".into(),
        "--pids-limit=512".into(),
        "--ipc=none".into(),
        "--tmpfs".into(),
        "/tmp".into(),
        "-v".into(),
        format!("{}:{}", cmd.cwd, cmd.cwd),
        "-w".into(),
        cmd.cwd.clone(),
    ];

    if cmd.network == Network::None {
        args.push("--read-only".into());
    }

    args.push("--network".into());
    args.push(match cmd.network {
        Network::None => "none".into(),
        Network::Bridge => "bridge".into(),
    });

    for (key, value) in sorted_env(&cmd.env) {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }

    args.push(image.to_string());
    args.push("sh".into());
    args.push("-c".into());
    args.push(cmd.command.clone());
    args
}

/// Deterministic ordering for `-e` flags, matching `docker.rs`'s sibling
/// helper so tests (and logs) don't depend on `HashMap` iteration order.
fn sorted_env(env: &std::collections::HashMap<String, String>) -> Vec<(String, String)> {
    let mut pairs: Vec<_> = env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    pairs.sort();
    pairs
}
