//! Drives one attempt: repeatedly asks an [`Agent`] what to do next,
//! executes it through [`tools::dispatch`], and folds the outcome back into
//! [`AgentState`] until a stop condition fires.
//!
//! Termination is the union of several independent checks, each mapped onto
//! a [`StopReason`]: the agent itself choosing to stop, the step or time
//! budget running out, the configured test command passing (an early
//! success — the loop doesn't wait for the agent to notice), the last
//! `repeated_failure_threshold` `RUN` outputs in the history being
//! byte-for-byte identical (see [`detect_repeated_failure`] — this is a
//! literal string comparison, not a derived signature, and is checked fresh
//! against the full history every iteration rather than carried as a
//! counter), or `APPLY_PATCH` being attempted more than `max_patch_attempts`
//! times. The latter reuses [`StopReason::RepeatedFailure`] — the closed
//! enum has no dedicated "too many patch attempts" variant, and budget
//! exhaustion on patching is a repeated-failure condition in substance.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::agent::Agent;
use crate::config::HarnessConfig;
use crate::events::EventSink;
use crate::model::{
    AgentAction, AgentResult, AgentState, EventKind, StopReason, ToolHistoryEntry, ToolName,
    ToolRequest, ToolResult,
};
use crate::sandbox::Sandbox;
use crate::tools::{self, ToolContext};

/// Everything the loop needs to drive one attempt from a fresh checkout.
pub struct LoopInputs<'a> {
    pub agent: &'a Agent,
    pub sandbox: Arc<dyn Sandbox>,
    pub workspace_root: String,
    pub config: HarnessConfig,
    pub test_command: String,
    /// `None` disables artifact persistence (tool stdout/stderr, patches).
    pub artifacts_dir: Option<PathBuf>,
    pub run_id: String,
    pub task_id: String,
    pub events: &'a dyn EventSink,
    /// Cancelled by the embedding process (e.g. on SIGINT) to stop the loop
    /// between steps with `StopReason::Interrupted` rather than mid-tool.
    /// `None` when the caller has no interruption source to wire up (tests,
    /// the baseline validator's own sub-runs).
    pub cancel: Option<tokio_util::sync::CancellationToken>,
}

/// Runs the agent loop to completion and returns the terminal outcome.
pub async fn run(inputs: LoopInputs<'_>) -> AgentResult {
    let LoopInputs {
        agent,
        sandbox,
        workspace_root,
        config,
        test_command,
        artifacts_dir,
        run_id,
        task_id,
        events,
        cancel,
    } = inputs;

    let wall_clock = Instant::now();
    let mut state = AgentState::new(run_id.clone(), task_id.clone(), config.max_steps, config.max_time_sec);
    let mut patch_attempts: u32 = 0;

    events.log(
        EventKind::TaskStarted,
        serde_json::json!({"task_id": task_id, "run_id": run_id, "test_command": test_command}),
    );

    let stop_reason = 'outer: loop {
        if cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
            break StopReason::Interrupted;
        }
        if state.budget_remaining_steps == 0 {
            break StopReason::MaxSteps;
        }
        if state.budget_remaining_sec <= 0.0 {
            break StopReason::MaxTime;
        }
        if let Some(reason) = detect_repeated_failure(&state.history, config.repeated_failure_threshold) {
            break reason;
        }

        let step_id = events.advance_step();
        events.log(EventKind::AgentTurnStarted, serde_json::json!({"step": state.step}));

        let is_llm = matches!(agent, Agent::Llm(_));
        if is_llm {
            events.log(EventKind::LlmRequestStarted, serde_json::json!({"step": state.step}));
        }

        let action = match agent.decide(&state, &test_command).await {
            Ok(action) => {
                if is_llm {
                    events.log(EventKind::LlmRequestFinished, serde_json::json!({"step": state.step}));
                }
                action
            }
            Err(err) => {
                events.log(EventKind::LlmRequestFailed, serde_json::json!({"error": err.to_string()}));
                break StopReason::LlmError;
            }
        };

        let request = match action {
            AgentAction::Stop { reason, rationale } => {
                events.log(
                    EventKind::AgentTurnFinished,
                    serde_json::json!({"step": state.step, "action": "stop", "rationale": rationale}),
                );
                break reason;
            }
            AgentAction::CallTool(request) => request,
        };

        if request.tool == ToolName::ApplyPatch {
            patch_attempts += 1;
            if patch_attempts > config.max_patch_attempts {
                break 'outer StopReason::RepeatedFailure;
            }
        }

        let tool_ctx = ToolContext {
            sandbox: sandbox.clone(),
            workspace_root: workspace_root.clone(),
            config: config.clone(),
            test_command: Some(test_command.clone()),
            artifacts_dir: artifacts_dir.clone(),
            step_id,
        };

        let run_is_test = request.tool == ToolName::Run
            && tools::run::is_test_command(
                request.params.get("command").and_then(|v| v.as_str()).unwrap_or(""),
                Some(&test_command),
            );
        if request.tool == ToolName::Run {
            log_run_started(events, &request.params, run_is_test);
        }

        events.log(
            EventKind::ToolCallStarted,
            serde_json::json!({"tool": request.tool.as_str(), "params": request.params}),
        );

        let result = tools::dispatch(&tool_ctx, request.clone()).await;

        events.log(
            EventKind::ToolCallFinished,
            serde_json::json!({
                "tool": result.tool.as_str(),
                "success": result.is_success(),
                "duration_sec": result.duration_sec,
                "exit_code": result.exit_code,
            }),
        );

        if request.tool == ToolName::Run {
            log_run_finished(events, run_is_test, result.exit_code);
        }

        // A tool error is tolerated only when it's a RUN call that merely
        // observed a failing test (`abnormal_exit`) — every other tool
        // error, on any tool including APPLY_PATCH, terminates the run.
        let tolerated = result.is_success()
            || (request.tool == ToolName::Run
                && matches!(
                    result.error.as_ref().map(|e| &e.kind),
                    Some(crate::model::ToolErrorKind::AbnormalExit)
                ));
        if !tolerated {
            state.history.push(ToolHistoryEntry { request, result });
            break 'outer StopReason::ToolError;
        }

        let mut auto_run_entry: Option<ToolHistoryEntry> = None;
        let mut early_stop: Option<StopReason> = None;

        if request.tool == ToolName::ApplyPatch {
            if let Some(changed) = result.data.as_ref().and_then(|d| d.get("changed_files")) {
                events.log(EventKind::PatchApplied, serde_json::json!({"changed_files": changed}));
                if let Some(files) = changed.as_array() {
                    state.patches_applied.extend(
                        files
                            .iter()
                            .filter_map(|v| v.as_str())
                            .map(PathBuf::from),
                    );
                }

                // A successful patch is checked immediately rather than
                // waiting for the agent to separately think to run tests:
                // synthesize the same RUN the agent would have issued next.
                let auto_request = ToolRequest {
                    request_id: format!("auto_run_{}", state.step),
                    tool: ToolName::Run,
                    params: serde_json::json!({"command": test_command}),
                };
                log_run_started(events, &auto_request.params, true);
                events.log(
                    EventKind::ToolCallStarted,
                    serde_json::json!({"tool": "RUN", "params": &auto_request.params}),
                );
                let auto_result = tools::dispatch(&tool_ctx, auto_request.clone()).await;
                events.log(
                    EventKind::ToolCallFinished,
                    serde_json::json!({
                        "tool": "RUN",
                        "success": auto_result.is_success(),
                        "duration_sec": auto_result.duration_sec,
                        "exit_code": auto_result.exit_code,
                    }),
                );
                log_run_finished(events, true, auto_result.exit_code);
                early_stop = classify_run_result(&mut state, &auto_result);
                auto_run_entry = Some(ToolHistoryEntry { request: auto_request, result: auto_result });
            }
        }

        if request.tool == ToolName::Run && early_stop.is_none() {
            early_stop = classify_run_result(&mut state, &result);
        }

        state.history.push(ToolHistoryEntry { request, result });
        if let Some(entry) = auto_run_entry {
            state.history.push(entry);
        }
        if let Some(reason) = early_stop {
            break 'outer reason;
        }

        state.step += 1;
        state.budget_remaining_steps = state.budget_remaining_steps.saturating_sub(1);
        state.budget_remaining_sec = (config.max_time_sec - wall_clock.elapsed().as_secs_f64()).max(0.0);

        events.log(EventKind::AgentTurnFinished, serde_json::json!({"step": state.step}));
    };

    let success = stop_reason == StopReason::Success;
    let duration_sec = wall_clock.elapsed().as_secs_f64();
    let result = AgentResult {
        success,
        stop_reason,
        steps_taken: state.step,
        patches_applied: state.patches_applied.clone(),
        duration_sec,
        final_exit_code: state.last_test_exit_code,
        failure_reason: stop_reason.failure_reason(),
    };

    // `agent_finished` is the terminal summary and must be the last event
    // logged in a run — carries everything a caller would otherwise have to
    // tail-scan the event stream to reconstruct.
    events.log(
        EventKind::AgentFinished,
        serde_json::json!({
            "success": result.success,
            "stop_reason": result.stop_reason,
            "steps_taken": result.steps_taken,
            "final_exit_code": result.final_exit_code,
            "failure_reason": result.failure_reason,
        }),
    );

    result
}

/// Logs the started half of a RUN's started/finished event pair, before
/// dispatch — `tests_started` for the task's own test command, otherwise
/// `command_started`.
fn log_run_started(events: &dyn EventSink, params: &serde_json::Value, is_test_command: bool) {
    let command = params.get("command").and_then(|v| v.as_str()).unwrap_or("");
    let kind = if is_test_command { EventKind::TestsStarted } else { EventKind::CommandStarted };
    events.log(kind, serde_json::json!({"command": command}));
}

/// Logs the finished half of a RUN's started/finished event pair, after
/// dispatch.
fn log_run_finished(events: &dyn EventSink, is_test_command: bool, exit_code: Option<i32>) {
    let kind = if is_test_command { EventKind::TestsFinished } else { EventKind::CommandFinished };
    events.log(kind, serde_json::json!({"exit_code": exit_code, "is_test_command": is_test_command}));
}

/// Folds one RUN result (agent-issued or the loop's own auto-run after a
/// successful patch) into `state`, returning the stop reason if this result
/// ends the attempt. Only a RUN of the task's own test command updates
/// `last_test_exit_code`/`last_test_output` or can produce `Success` —
/// repeated-failure detection is handled separately, over the full history,
/// by [`detect_repeated_failure`].
fn classify_run_result(state: &mut AgentState, result: &ToolResult) -> Option<StopReason> {
    let payload = result_payload(result);
    let is_test_command = payload.get("is_test_command").and_then(|v| v.as_bool()).unwrap_or(false);

    if !is_test_command {
        return None;
    }

    state.last_test_exit_code = result.exit_code;
    state.last_test_output = payload.get("stdout").and_then(|v| v.as_str()).map(String::from);

    if result.exit_code == Some(0) {
        return Some(StopReason::Success);
    }
    None
}

/// Returns a tool result's success data, or its error details if it failed —
/// the two places a `RUN` result's `is_test_command`/`stdout`/`stderr`/
/// `combined_output` can live, depending on whether the command exited zero.
fn result_payload(result: &ToolResult) -> serde_json::Value {
    if let Some(data) = &result.data {
        data.clone()
    } else if let Some(err) = &result.error {
        serde_json::Value::Object(err.details.clone())
    } else {
        serde_json::Value::Null
    }
}

/// Mirrors the reference loop's stop-condition check literally: collects
/// every RUN tool-history entry's `combined_output` string, in order, and
/// fires `RepeatedFailure` only when the last `threshold` of them are
/// byte-for-byte identical — no signature extraction, no hashing, just
/// string equality, per `spec.md` §4.7 Phase 1.
fn detect_repeated_failure(history: &[ToolHistoryEntry], threshold: u32) -> Option<StopReason> {
    let threshold = threshold as usize;
    if threshold == 0 {
        return None;
    }
    let outputs: Vec<String> = history
        .iter()
        .filter(|entry| entry.request.tool == ToolName::Run)
        .filter_map(|entry| {
            result_payload(&entry.result)
                .get("combined_output")
                .and_then(|v| v.as_str())
                .map(str::to_string)
        })
        .collect();
    if outputs.len() < threshold {
        return None;
    }
    let tail = &outputs[outputs.len() - threshold..];
    if tail.windows(2).all(|w| w[0] == w[1]) {
        Some(StopReason::RepeatedFailure)
    } else {
        None
    }
}
