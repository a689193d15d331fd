//! Agent execution engine for the code-repair benchmark harness.
//!
//! Given one task (a repo, a commit, a failing test command, a budget), this
//! crate validates the task's baseline, runs an agent — scripted or
//! LLM-backed — through a sandboxed read/search/patch/run tool loop until it
//! succeeds or exhausts its budget, and writes the full trace: an append-only
//! event log and one typed attempt record per run.
//!
//! Module map:
//! - [`model`] — shared data types (task spec, tool contract, agent state,
//!   stop/failure taxonomy, patch representation).
//! - [`config`] — harness-wide tunables, environment-variable overridable.
//! - [`path_safety`] — workspace-root confinement for every filesystem tool.
//! - [`sandbox`] — command execution, bind mode or hardened Docker.
//! - [`git`] — clone/checkout/dirty-check/diff, host or sandbox-routed.
//! - [`patch`] — unified-diff parsing, dialect normalization, application.
//! - [`tools`] — the five tools an agent can call.
//! - [`events`] — append-only `events.jsonl` writer.
//! - [`agent`] — scripted and LLM-backed agent implementations.
//! - [`agent_loop`] — drives one agent through to a terminal [`model::AgentResult`].
//! - [`validator`] — pre-agent baseline validation.
//! - [`attempt`] — assembles and writes the final `attempts.jsonl` record.
//! - [`truncate`] — shared output-truncation helper.

pub mod agent;
pub mod agent_loop;
pub mod attempt;
pub mod config;
pub mod events;
pub mod git;
pub mod model;
pub mod patch;
pub mod path_safety;
pub mod sandbox;
pub mod tools;
pub mod truncate;
pub mod validator;
