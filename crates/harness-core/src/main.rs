//! Thin smoke-test entrypoint: wires sandbox, baseline validator, agent
//! loop, event log, and attempt recorder together for a single task
//! directory passed on argv.
//!
//! Task-suite discovery, scheduling, and result aggregation across many
//! tasks are out of scope here (`spec.md` §1 names them as collaborators
//! outside this crate) — this binary exists so the pieces above can be
//! exercised end to end without a second harness to drive them.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use harness_core::agent::{Agent, LlmAgent, ScriptedAgent};
use harness_core::agent_loop::{self, LoopInputs};
use harness_core::attempt::{self, AttemptRecord, AttemptVariant};
use harness_core::config::HarnessConfig;
use harness_core::events::{EventLogger, EventSink};
use harness_core::model::TaskSpec;
use harness_core::sandbox::{BindSandbox, DockerSandbox, HostSandbox, Sandbox};
use harness_core::validator;

#[derive(Parser, Debug)]
#[command(name = "harness-core", about = "Run one benchmark task through the agent execution engine")]
struct Cli {
    /// Directory containing `task.json`. Results are written under
    /// `<task_dir>/attempts/<run_id>/` unless `--artifacts-dir` overrides it.
    task_dir: PathBuf,

    /// Which driver sits in the agent loop's decide step.
    #[arg(long, value_enum, default_value_t = AgentKind::Scripted)]
    agent: AgentKind,

    #[arg(long)]
    artifacts_dir: Option<PathBuf>,

    /// Run commands directly on the host instead of inside a Docker
    /// container. Only sensible for local smoke-testing against a
    /// throwaway checkout; overrides `--sandbox-mode`.
    #[arg(long)]
    no_sandbox: bool,

    /// Which of `spec.md` §4.1's two sandbox modes to run under.
    #[arg(long, value_enum, default_value_t = SandboxMode::Persistent)]
    sandbox_mode: SandboxMode,
}

#[derive(Copy, Clone, Debug, clap::ValueEnum)]
enum AgentKind {
    Scripted,
    Llm,
}

#[derive(Copy, Clone, Debug, clap::ValueEnum)]
enum SandboxMode {
    /// Fresh hardened container per command.
    Bind,
    /// One long-lived container, commands run via `docker exec`.
    Persistent,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let run_id = uuid::Uuid::new_v4().to_string();
    let task_path = cli.task_dir.join("task.json");
    let task: TaskSpec = serde_json::from_str(
        &std::fs::read_to_string(&task_path)
            .with_context(|| format!("reading task spec at {}", task_path.display()))?,
    )
    .with_context(|| format!("parsing task spec at {}", task_path.display()))?;

    let artifacts_dir = cli
        .artifacts_dir
        .unwrap_or_else(|| cli.task_dir.join("attempts").join(&run_id));
    std::fs::create_dir_all(&artifacts_dir)?;

    let config = HarnessConfig::default();
    let events = EventLogger::new(&run_id, &artifacts_dir, config.log_llm_transcripts, config.output_truncation_chars)
        .context("initializing event log")?;

    info!(run_id = %run_id, task_id = %task.id, "starting attempt");
    events.log(
        harness_core::model::EventKind::TaskStarted,
        serde_json::json!({"task_id": task.id, "suite": task.suite}),
    );

    let workspace_dir = tempfile::tempdir().context("creating scratch workspace")?;
    let sandbox: Arc<dyn Sandbox> = if cli.no_sandbox {
        Arc::new(HostSandbox::new())
    } else {
        match cli.sandbox_mode {
            SandboxMode::Bind => Arc::new(BindSandbox::new(task.environment.docker_image.clone())),
            SandboxMode::Persistent => Arc::new(DockerSandbox::new(
                task.environment.docker_image.clone(),
                workspace_dir.path().to_string_lossy().into_owned(),
            )),
        }
    };

    let baseline_started = chrono::Utc::now();
    let baseline = validator::validate_baseline_with_artifacts(
        sandbox.as_ref(),
        &task,
        workspace_dir.path(),
        Some(&artifacts_dir),
    )
    .await;
    let baseline_ended = chrono::Utc::now();

    let baseline_record = AttemptRecord::from_baseline_outcome(
        &task,
        &run_id,
        &config,
        baseline_started,
        baseline_ended,
        &baseline,
    );
    attempt::write_attempt_record(&artifacts_dir, &baseline_record).context("writing baseline attempt record")?;

    if !baseline.failed_as_expected {
        warn!(reason = ?baseline.failure_reason, "baseline did not fail as expected; skipping agent");
        events.log(
            harness_core::model::EventKind::TaskFinished,
            serde_json::json!({"passed": false, "stage": "baseline"}),
        );
        std::process::exit(1);
    }

    let repo_dir = workspace_dir.path().join("repo");
    let agent = match cli.agent {
        AgentKind::Scripted => Agent::Scripted(ScriptedAgent::fixture(
            "README.md",
            &task.run.command,
            "",
            &task.run.command,
        )),
        AgentKind::Llm => Agent::Llm(LlmAgent::new(&config.model).context("building LLM agent")?),
    };
    let variant = match cli.agent {
        AgentKind::Scripted => AttemptVariant::Scripted,
        AgentKind::Llm => AttemptVariant::Llm,
    };

    let cancel = tokio_util::sync::CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("received interrupt signal; stopping at the next step boundary");
                cancel.cancel();
            }
        });
    }

    let loop_started = chrono::Utc::now();
    let result = agent_loop::run(LoopInputs {
        agent: &agent,
        sandbox: sandbox.clone(),
        workspace_root: repo_dir.to_string_lossy().into_owned(),
        config: config.clone(),
        test_command: task.run.command.clone(),
        artifacts_dir: Some(artifacts_dir.clone()),
        run_id: run_id.clone(),
        task_id: task.id.clone(),
        events: &events,
        cancel: Some(cancel),
    })
    .await;
    let loop_ended = chrono::Utc::now();

    let record = AttemptRecord::from_agent_result(
        &task, &run_id, variant, &config, loop_started, loop_ended, &result,
    );
    attempt::write_attempt_record(&artifacts_dir, &record).context("writing attempt record")?;

    // agent_loop::run already logged `agent_finished` as the run's terminal
    // event; nothing should log after it.
    info!(run_id = %run_id, success = result.success, steps = result.steps_taken, "attempt finished");

    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}
