//! Shared data-model types: task specification, tool contract, agent state,
//! stop/failure taxonomy, and the patch representation.
//!
//! These are value types passed between every other module; nothing here
//! talks to the filesystem or a sandbox.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A Git repository locator plus the commit it must be checked out at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoSpec {
    pub url: String,
    pub commit: String,
}

/// Container image and resource envelope for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    pub docker_image: String,
    #[serde(default = "default_workdir")]
    pub workdir: String,
    pub timeout_sec: u64,
}

fn default_workdir() -> String {
    "/workspace".to_string()
}

/// Ordered shell commands run once, before the test command, to prepare a
/// fresh checkout (install dependencies, build, etc.).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SetupSpec {
    #[serde(default)]
    pub commands: Vec<String>,
}

/// The single command whose exit code decides pass/fail for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSpec {
    pub command: String,
}

/// Optional cross-checks on the baseline (pre-agent) failing run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ValidationSpec {
    #[serde(default)]
    pub expected_exit_codes: Vec<i32>,
    pub expected_failure_regex: Option<String>,
    pub expected_stdout_regex: Option<String>,
    pub expected_stderr_regex: Option<String>,
    /// Each pattern is checked independently; any match invalidates the
    /// baseline. A list, not a single pattern — matching the original
    /// validator's semantics rather than a distilled singular field.
    #[serde(default)]
    pub disallowed_failure_regex: Vec<String>,
    #[serde(default)]
    pub expected_failing_tests: Vec<String>,
}

/// Agent entrypoint selection and step budget, as named in the task file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentSpec {
    pub entrypoint: Option<String>,
    pub max_steps: Option<u32>,
}

/// Immutable task specification: everything needed to attempt one task.
///
/// Created by an upstream loader (task YAML parsing is out of scope here,
/// see `spec.md` §1); read-only for the lifetime of an attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_spec_version: String,
    pub id: String,
    pub suite: String,
    pub repo: RepoSpec,
    pub environment: EnvironmentSpec,
    #[serde(default)]
    pub setup: SetupSpec,
    pub run: RunSpec,
    #[serde(default)]
    pub validation: ValidationSpec,
    pub harness_min_version: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub agent: AgentSpec,
}

/// The five tool kinds the agent may invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    ListFiles,
    ReadFile,
    Search,
    ApplyPatch,
    Run,
}

impl ToolName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ListFiles => "LIST_FILES",
            Self::ReadFile => "READ_FILE",
            Self::Search => "SEARCH",
            Self::ApplyPatch => "APPLY_PATCH",
            Self::Run => "RUN",
        }
    }
}

/// A request for one of the five tools, carrying a caller-supplied id that
/// is stable per request and used to correlate started/finished events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRequest {
    pub request_id: String,
    pub tool: ToolName,
    pub params: serde_json::Value,
}

/// Closed set of tool-level error kinds (`spec.md` §7).
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "error_type", rename_all = "snake_case")]
pub enum ToolErrorKind {
    #[error("path escapes workspace root")]
    PathEscape,
    #[error("path traverses a symlink")]
    SymlinkBlocked,
    #[error("file not found")]
    FileNotFound,
    #[error("file is not valid UTF-8 text")]
    BinaryFile,
    #[error("tool call timed out")]
    Timeout,
    #[error("ripgrep binary not found on PATH")]
    RipgrepUnavailable,
    #[error("ripgrep exited with an error")]
    RipgrepError,
    #[error("failed to parse tool output")]
    ParseError,
    #[error("patch did not apply cleanly")]
    PatchHunkFail,
    #[error("command exited non-zero")]
    AbnormalExit,
    #[error("sandbox invocation failed")]
    SandboxError,
    #[error("unclassified error: {type_name}")]
    Other { type_name: String },
}

/// A tool error with a human-readable message and an arbitrary details map
/// (e.g. `exit_code`, `stderr`, the offending path).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolError {
    #[serde(flatten)]
    pub kind: ToolErrorKind,
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: serde_json::Map::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    /// Wraps an error that doesn't fit any named kind, tagging it with the
    /// underlying error type's name — the catch-all spec.md §7 describes.
    pub fn catch_all<E: std::fmt::Display>(type_name: &str, err: E) -> Self {
        Self::new(
            ToolErrorKind::Other {
                type_name: type_name.to_string(),
            },
            err.to_string(),
        )
    }
}

/// Success/error result of one executed tool request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub request_id: String,
    pub tool: ToolName,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_sec: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_path: Option<String>,
}

impl ToolResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// One (request, result) pair, as stored in agent-state history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolHistoryEntry {
    pub request: ToolRequest,
    pub result: ToolResult,
}

/// Snapshot between agent-loop steps. Treated as a value type: each step
/// produces a new `AgentState`, never an in-place mutation.
#[derive(Debug, Clone)]
pub struct AgentState {
    pub run_id: String,
    pub task_id: String,
    pub step: u32,
    pub started_at: DateTime<Utc>,
    pub history: Vec<ToolHistoryEntry>,
    pub patches_applied: Vec<PathBuf>,
    pub last_test_exit_code: Option<i32>,
    pub last_test_output: Option<String>,
    pub budget_remaining_steps: u32,
    pub budget_remaining_sec: f64,
}

impl AgentState {
    pub fn new(run_id: impl Into<String>, task_id: impl Into<String>, max_steps: u32, max_time_sec: f64) -> Self {
        Self {
            run_id: run_id.into(),
            task_id: task_id.into(),
            step: 0,
            started_at: Utc::now(),
            history: Vec::new(),
            patches_applied: Vec::new(),
            last_test_exit_code: None,
            last_test_output: None,
            budget_remaining_steps: max_steps,
            budget_remaining_sec: max_time_sec,
        }
    }
}

/// Tagged union the agent's `decide` returns: either invoke a tool, or stop.
#[derive(Debug, Clone)]
pub enum AgentAction {
    CallTool(ToolRequest),
    Stop { reason: StopReason, rationale: String },
}

/// The precise internal condition under which the loop terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopReason {
    Success,
    MaxSteps,
    MaxTime,
    AgentGaveUp,
    RepeatedFailure,
    ToolError,
    LlmError,
    Interrupted,
}

/// User-facing classification of a non-success outcome; closed set.
///
/// The first eight variants cover the agent loop (`StopReason::failure_reason`);
/// the rest are baseline-validation-only outcomes, named after the stages in
/// `validate_baseline` that can invalidate a task before an agent ever runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    Timeout,
    AgentGaveUp,
    ToolError,
    LlmError,
    Interrupted,
    TestsFailed,
    CollectionError,
    Internal,
    GitCloneFailed,
    GitCheckoutFailed,
    SetupFailed,
    SetupTimeout,
    SetupDirtyWorktree,
    BaselineNotFailing,
    BaselineMismatch,
    BaselineFlaky,
    Unknown,
}

impl StopReason {
    /// Maps a stop reason to a failure reason per the table in `spec.md` §7.
    /// Returns `None` for `Success`.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Self::Success => None,
            Self::MaxTime => Some(FailureReason::Timeout),
            Self::MaxSteps | Self::AgentGaveUp | Self::RepeatedFailure => {
                Some(FailureReason::AgentGaveUp)
            }
            Self::ToolError => Some(FailureReason::ToolError),
            Self::LlmError => Some(FailureReason::LlmError),
            Self::Interrupted => Some(FailureReason::Interrupted),
        }
    }
}

/// Terminal value produced by one run of the agent loop.
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub success: bool,
    pub stop_reason: StopReason,
    pub steps_taken: u32,
    pub patches_applied: Vec<PathBuf>,
    pub duration_sec: f64,
    pub final_exit_code: Option<i32>,
    pub failure_reason: Option<FailureReason>,
}

/// One per-file patch: `old_path`/`new_path` may be the sentinel
/// `"/dev/null"` for create/delete, plus an ordered list of hunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilePatch {
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub hunks: Vec<PatchHunk>,
}

/// A contiguous block of a unified diff with its own old/new coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchHunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<PatchLine>,
}

/// A single body line of a hunk, classified by its leading-character role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PatchLine {
    Context(String),
    Removal(String),
    Addition(String),
    NoNewlineMarker,
}

pub const DEV_NULL: &str = "/dev/null";

/// Append-only record describing one transition (`spec.md` §3, §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventKind,
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub step_id: u64,
    #[serde(default = "default_event_version")]
    pub event_version: String,
    pub payload: serde_json::Value,
}

fn default_event_version() -> String {
    "1.0".to_string()
}

/// Enumerated event kinds (`spec.md` §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ToolCallStarted,
    ToolCallFinished,
    AgentTurnStarted,
    AgentTurnFinished,
    AgentFinished,
    PatchApplied,
    TestsStarted,
    TestsFinished,
    CommandStarted,
    CommandFinished,
    LlmRequestStarted,
    LlmRequestFinished,
    LlmRequestFailed,
    TaskStarted,
    TaskFinished,
}
