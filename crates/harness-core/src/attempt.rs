//! Assembles the final typed attempt record and appends it to
//! `attempts.jsonl`.
//!
//! One record is written per scripted or LLM agent run, plus one more
//! "baseline" record per task — the validator's own outcome, stored in the
//! same stream so downstream analysis never needs a second file format to
//! know a task was thrown out before an agent touched it.
//!
//! Shares the append-lock-fsync discipline [`crate::events::EventLogger`]
//! uses for `events.jsonl`: a record is a decision, not telemetry, so a
//! write either lands whole or not at all.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::config::HarnessConfig;
use crate::model::{AgentResult, FailureReason, StopReason, TaskSpec};
use crate::validator::BaselineOutcome;

/// Current shape of the attempt record. Bumped whenever a field is added,
/// removed, or changes meaning.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Which of the three kinds of attempt produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptVariant {
    Scripted,
    Llm,
    /// The baseline validator's own pass/fail, recorded before any agent
    /// runs so a discarded task leaves a trace in the same stream.
    Baseline,
}

/// Model identity carried only by the `llm` variant; `None` in every field
/// for `scripted` and `baseline`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelInfo {
    pub provider: Option<String>,
    pub name: Option<String>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u64>,
    pub prompt_version: Option<String>,
}

impl ModelInfo {
    fn from_config(config: &HarnessConfig) -> Self {
        Self {
            provider: Some("openai".to_string()),
            name: Some(config.model.model.clone()),
            temperature: config.model.temperature,
            top_p: config.model.top_p,
            max_tokens: config.model.max_tokens,
            prompt_version: None,
        }
    }
}

/// Budgets in effect for this attempt, echoed so a record is
/// self-describing even if the harness's defaults change later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsInfo {
    pub timeout_sec: f64,
    pub tool_timeout_sec: u64,
}

impl LimitsInfo {
    fn from_config(config: &HarnessConfig) -> Self {
        Self {
            timeout_sec: config.max_time_sec,
            tool_timeout_sec: config.tool_timeouts.run_sec,
        }
    }
}

/// Trimmed, JSON-serializable view of a [`BaselineOutcome`] — stdout/stderr
/// are dropped (the raw captures already live in the validator's own
/// artifact files; duplicating them here would blow past the truncation
/// budget for no benefit).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineSummary {
    pub failed_as_expected: bool,
    pub exit_code: i32,
    pub failure_reason: Option<FailureReason>,
    pub signature: String,
    pub rerun_performed: bool,
    pub rerun_matched: Option<bool>,
    pub duration_sec: f64,
}

impl From<&BaselineOutcome> for BaselineSummary {
    fn from(outcome: &BaselineOutcome) -> Self {
        Self {
            failed_as_expected: outcome.failed_as_expected,
            exit_code: outcome.exit_code,
            failure_reason: outcome.failure_reason,
            signature: outcome.signature.clone(),
            rerun_performed: outcome.rerun_performed,
            rerun_matched: outcome.rerun_matched,
            duration_sec: outcome.duration_sec,
        }
    }
}

/// One row of `attempts.jsonl` (`spec.md` §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub schema_version: String,
    pub run_id: String,
    pub task_id: String,
    pub suite: String,
    pub task_spec_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub harness_min_version: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    pub variant: AttemptVariant,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelInfo>,
    pub limits: LimitsInfo,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps_taken: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub patches_applied: Vec<String>,
    pub duration_sec: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline: Option<BaselineSummary>,
}

impl AttemptRecord {
    /// Builds the record for one scripted-or-LLM agent run.
    pub fn from_agent_result(
        task: &TaskSpec,
        run_id: impl Into<String>,
        variant: AttemptVariant,
        config: &HarnessConfig,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        result: &AgentResult,
    ) -> Self {
        assert!(
            variant != AttemptVariant::Baseline,
            "baseline records are built with AttemptRecord::from_baseline_outcome"
        );
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            run_id: run_id.into(),
            task_id: task.id.clone(),
            suite: task.suite.clone(),
            task_spec_version: task.task_spec_version.clone(),
            harness_min_version: task.harness_min_version.clone(),
            labels: task.labels.clone(),
            variant,
            model: matches!(variant, AttemptVariant::Llm).then(|| ModelInfo::from_config(config)),
            limits: LimitsInfo::from_config(config),
            started_at,
            ended_at,
            success: result.success,
            stop_reason: Some(result.stop_reason),
            steps_taken: Some(result.steps_taken),
            patches_applied: result
                .patches_applied
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
            duration_sec: result.duration_sec,
            final_exit_code: result.final_exit_code,
            failure_reason: result.failure_reason,
            baseline: None,
        }
    }

    /// Builds the "baseline" variant record: there is no agent step count or
    /// stop reason, only the validator's own pass/fail.
    pub fn from_baseline_outcome(
        task: &TaskSpec,
        run_id: impl Into<String>,
        config: &HarnessConfig,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        outcome: &BaselineOutcome,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            run_id: run_id.into(),
            task_id: task.id.clone(),
            suite: task.suite.clone(),
            task_spec_version: task.task_spec_version.clone(),
            harness_min_version: task.harness_min_version.clone(),
            labels: task.labels.clone(),
            variant: AttemptVariant::Baseline,
            model: None,
            limits: LimitsInfo::from_config(config),
            started_at,
            ended_at,
            success: outcome.failed_as_expected,
            stop_reason: None,
            steps_taken: None,
            patches_applied: Vec::new(),
            duration_sec: outcome.duration_sec,
            final_exit_code: Some(outcome.exit_code),
            failure_reason: outcome.failure_reason,
            baseline: Some(BaselineSummary::from(outcome)),
        }
    }
}

/// Appends one record as a line of `attempts.jsonl` under `artifacts_dir`.
pub fn write_attempt_record(artifacts_dir: &Path, record: &AttemptRecord) -> std::io::Result<()> {
    std::fs::create_dir_all(artifacts_dir)?;
    let path = artifacts_dir.join("attempts.jsonl");
    let line = serde_json::to_string(record)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    file.lock_exclusive()?;
    let result = (|| {
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()
    })();
    let _ = FileExt::unlock(&file);
    result
}
