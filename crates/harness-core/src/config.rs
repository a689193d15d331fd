//! Harness-wide tunables: step/time budgets, per-tool timeouts, truncation
//! limits, and the LLM endpoint the scripted agent never needs but the LLM
//! agent does.
//!
//! Every field has a default matching `spec.md` §6 and can be overridden by
//! an environment variable, following the cluster-endpoint config this crate
//! started from.

use anyhow::{Context, Result};
use rig::providers::openai;

/// Model endpoint for the LLM-backed agent.
#[derive(Debug, Clone)]
pub struct ModelEndpoint {
    pub url: String,
    pub model: String,
    pub api_key: String,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl Default for ModelEndpoint {
    fn default() -> Self {
        Self {
            url: std::env::var("HARNESS_LLM_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            model: std::env::var("HARNESS_LLM_MODEL").unwrap_or_else(|_| "gpt-4o".into()),
            api_key: std::env::var("HARNESS_LLM_API_KEY").unwrap_or_else(|_| "not-needed".into()),
            temperature: std::env::var("HARNESS_LLM_TEMPERATURE")
                .ok()
                .and_then(|s| s.parse().ok()),
            top_p: std::env::var("HARNESS_LLM_TOP_P")
                .ok()
                .and_then(|s| s.parse().ok()),
            max_tokens: std::env::var("HARNESS_LLM_MAX_TOKENS")
                .ok()
                .and_then(|s| s.parse().ok()),
        }
    }
}

/// Per-tool invocation timeouts.
#[derive(Debug, Clone)]
pub struct ToolTimeouts {
    pub list_files_sec: u64,
    pub read_file_sec: u64,
    pub search_sec: u64,
    pub apply_patch_sec: u64,
    pub run_sec: u64,
}

impl Default for ToolTimeouts {
    fn default() -> Self {
        Self {
            list_files_sec: env_u64("HARNESS_TIMEOUT_LIST_FILES", 10),
            read_file_sec: env_u64("HARNESS_TIMEOUT_READ_FILE", 10),
            search_sec: env_u64("HARNESS_TIMEOUT_SEARCH", 30),
            apply_patch_sec: env_u64("HARNESS_TIMEOUT_APPLY_PATCH", 10),
            run_sec: env_u64("HARNESS_TIMEOUT_RUN", 600),
        }
    }
}

/// Top-level harness configuration: agent-loop budgets, timeouts, and
/// output-handling limits.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Maximum number of agent-loop steps before stopping with `MAX_STEPS`.
    pub max_steps: u32,
    /// Wall-clock budget for the whole attempt, in seconds.
    pub max_time_sec: f64,
    /// Consecutive identical RUN-tool failures before stopping with
    /// `REPEATED_FAILURE`.
    pub repeated_failure_threshold: u32,
    /// Maximum APPLY_PATCH attempts across the run, successful or not.
    pub max_patch_attempts: u32,
    /// When set, APPLY_PATCH skips the fuzzy-matching fallback stages and
    /// only accepts exact or context-trimmed matches.
    pub strict_patch_mode: bool,
    pub tool_timeouts: ToolTimeouts,
    /// Budget, in characters, applied to any tool output field before it is
    /// written to the event log or handed back to the agent.
    pub output_truncation_chars: usize,
    /// Budget, in lines, applied to `READ_FILE` content and `RUN` combined
    /// output previews before the head/tail split (`spec.md` §6 "Output
    /// truncation: max lines").
    pub output_truncation_lines: usize,
    /// When set, full LLM request/response bodies are written to the
    /// artifact directory; off by default since prompts can be large and
    /// sensitive.
    pub log_llm_transcripts: bool,
    pub model: ModelEndpoint,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            max_steps: env_u32("HARNESS_MAX_STEPS", 20),
            max_time_sec: std::env::var("HARNESS_MAX_TIME_SEC")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(600.0),
            repeated_failure_threshold: env_u32("HARNESS_REPEATED_FAILURE_THRESHOLD", 3),
            max_patch_attempts: env_u32("HARNESS_MAX_PATCH_ATTEMPTS", 10),
            strict_patch_mode: std::env::var("HARNESS_STRICT_PATCH_MODE")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            tool_timeouts: ToolTimeouts::default(),
            output_truncation_chars: env_u32("HARNESS_OUTPUT_TRUNCATION_CHARS", 8000) as usize,
            output_truncation_lines: env_u32("HARNESS_OUTPUT_TRUNCATION_LINES", 200) as usize,
            log_llm_transcripts: std::env::var("HARNESS_LOG_LLM_TRANSCRIPTS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            model: ModelEndpoint::default(),
        }
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

impl HarnessConfig {
    /// Configuration with short budgets, suited to integration tests that
    /// exercise the full loop against a local fixture repo.
    pub fn test_config() -> Self {
        Self {
            max_steps: 5,
            max_time_sec: 30.0,
            repeated_failure_threshold: 2,
            max_patch_attempts: 5,
            strict_patch_mode: false,
            tool_timeouts: ToolTimeouts {
                list_files_sec: 5,
                read_file_sec: 5,
                search_sec: 5,
                apply_patch_sec: 5,
                run_sec: 30,
            },
            output_truncation_chars: 2000,
            output_truncation_lines: 40,
            log_llm_transcripts: false,
            model: ModelEndpoint {
                url: "http://localhost:0/v1".into(),
                model: "test-model".into(),
                api_key: "not-needed".into(),
                temperature: None,
                top_p: None,
                max_tokens: None,
            },
        }
    }
}

/// Builds the rig completions client the LLM-backed agent sends requests
/// through.
pub fn build_completions_client(endpoint: &ModelEndpoint) -> Result<openai::CompletionsClient> {
    openai::CompletionsClient::builder()
        .api_key(&endpoint.api_key)
        .base_url(&endpoint.url)
        .build()
        .context("failed to build LLM completions client")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        std::env::remove_var("HARNESS_MAX_STEPS");
        std::env::remove_var("HARNESS_REPEATED_FAILURE_THRESHOLD");
        let config = HarnessConfig::default();
        assert_eq!(config.max_steps, 20);
        assert_eq!(config.max_time_sec, 600.0);
        assert_eq!(config.repeated_failure_threshold, 3);
        assert_eq!(config.max_patch_attempts, 10);
        assert!(!config.strict_patch_mode);
        assert_eq!(config.tool_timeouts.run_sec, 600);
        assert_eq!(config.tool_timeouts.list_files_sec, 10);
    }

    #[test]
    fn env_override_takes_precedence() {
        std::env::set_var("HARNESS_MAX_STEPS", "42");
        let config = HarnessConfig::default();
        assert_eq!(config.max_steps, 42);
        std::env::remove_var("HARNESS_MAX_STEPS");
    }

    #[test]
    fn zero_env_value_falls_back_to_default() {
        std::env::set_var("HARNESS_MAX_STEPS", "0");
        let config = HarnessConfig::default();
        assert_eq!(config.max_steps, 20);
        std::env::remove_var("HARNESS_MAX_STEPS");
    }

    #[test]
    fn test_config_is_fast_and_self_contained() {
        let config = HarnessConfig::test_config();
        assert_eq!(config.max_steps, 5);
        assert_eq!(config.max_time_sec, 30.0);
    }
}
