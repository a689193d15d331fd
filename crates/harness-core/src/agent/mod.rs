//! The two things that can sit in the "decide what to do next" seat of the
//! agent loop: a fixed [`scripted::ScriptedAgent`] and a model-backed
//! [`llm::LlmAgent`].
//!
//! Modeled as a sum type rather than a trait object — there are exactly two
//! variants, selected once at attempt start from `TaskSpec.agent.entrypoint`,
//! and the loop never needs to treat them polymorphically beyond this one
//! `decide` call.

pub mod llm;
pub mod scripted;

use crate::model::AgentAction;

pub use llm::LlmAgent;
pub use scripted::{ScriptedAgent, ScriptedStep};

/// Either driver behind the agent loop's `decide` step.
pub enum Agent {
    Scripted(ScriptedAgent),
    Llm(LlmAgent),
}

impl Agent {
    /// Decides the next action. `test_command` is threaded through rather
    /// than read off `AgentState` — it's task data, not step-to-step
    /// mutable state, and only the LLM agent's prompt needs it; the
    /// scripted agent already has its own command baked into its script.
    pub async fn decide(
        &self,
        state: &crate::model::AgentState,
        test_command: &str,
    ) -> anyhow::Result<AgentAction> {
        match self {
            Agent::Scripted(agent) => Ok(agent.decide(state)),
            Agent::Llm(agent) => agent.decide(state, test_command).await,
        }
    }
}
