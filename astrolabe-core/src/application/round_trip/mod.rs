//! One conversational round trip: ask, run any requested tools, ask again.

mod state;

pub use state::RoundTripState;

use crate::application::extractor::ToolCallExtractor;
use crate::application::registry::ToolRegistry;
use crate::domain::types::{ChatMessage, ToolCallOutcome, ToolCallRequest};
use crate::infrastructure::model::{ModelClient, ModelError, ModelRequest, ModelResponse};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RoundTripOutcome {
    /// Final assistant text shown to the user.
    pub content: String,
    /// Input messages plus everything this round trip appended.
    pub messages: Vec<ChatMessage>,
    pub outcomes: Vec<ToolCallOutcome>,
    pub state: RoundTripState,
}

impl RoundTripOutcome {
    pub fn used_tools(&self) -> bool {
        !self.outcomes.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct AgentRoundTripController {
    model: String,
    native_tools: bool,
}

impl AgentRoundTripController {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            native_tools: true,
        }
    }

    /// Offer the registry's tools through the model API's native tool calling.
    pub fn with_native_tools(mut self, enabled: bool) -> Self {
        self.native_tools = enabled;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Run one round trip. Tool failures are reported to the model; only
    /// model errors abort.
    pub async fn run(
        &self,
        mut messages: Vec<ChatMessage>,
        model: &dyn ModelClient,
        registry: &ToolRegistry,
    ) -> Result<RoundTripOutcome, ModelError> {
        let mut state = RoundTripState::Idle;

        state.advance(RoundTripState::AwaitingFirstCompletion);
        let tools = if self.native_tools {
            registry.tool_descriptors()
        } else {
            Vec::new()
        };
        let first = model
            .chat(ModelRequest::new(&self.model, messages.clone()).with_tools(tools))
            .await?;

        let calls = requested_calls(&first);
        if calls.is_empty() {
            state.advance(RoundTripState::Done);
            let content = first.message.content.clone();
            messages.push(first.message);
            return Ok(RoundTripOutcome {
                content,
                messages,
                outcomes: Vec::new(),
                state,
            });
        }

        state.advance(RoundTripState::ExtractingCalls);
        info!(calls = calls.len(), "Model requested tool calls");

        state.advance(RoundTripState::ExecutingTools);
        let mut outcomes = Vec::with_capacity(calls.len());
        for call in &calls {
            let outcome = registry
                .call_tool(&call.tool_name, call.arguments.clone())
                .await;
            if outcome.is_success() {
                info!(tool = %call.tool_name, "Tool call succeeded");
            } else {
                warn!(tool = %call.tool_name, outcome = %outcome, "Tool call failed");
            }
            outcomes.push(outcome);
        }

        messages.push(assistant_turn(first, &calls));
        messages.push(ChatMessage::user(format_outcomes(&outcomes)));

        state.advance(RoundTripState::AwaitingFollowupCompletion);
        let followup = model
            .chat(ModelRequest::new(&self.model, messages.clone()))
            .await?;

        state.advance(RoundTripState::Done);
        let content = followup.message.content.clone();
        messages.push(followup.message);
        Ok(RoundTripOutcome {
            content,
            messages,
            outcomes,
            state,
        })
    }
}

/// Native `tool_calls` win; the text is only scanned when there are none.
fn requested_calls(response: &ModelResponse) -> Vec<ToolCallRequest> {
    let native = ToolCallExtractor::from_native(&response.tool_calls);
    if native.is_empty() {
        ToolCallExtractor::extract(&response.message.content)
    } else {
        native
    }
}

/// The assistant's tool-requesting turn. Native calls with no text get their
/// directives written out so the follow-up sees what was asked.
fn assistant_turn(response: ModelResponse, calls: &[ToolCallRequest]) -> ChatMessage {
    if !response.message.content.trim().is_empty() {
        return response.message;
    }
    let directives: Vec<String> = calls.iter().map(ToolCallExtractor::format_directive).collect();
    ChatMessage::assistant(directives.join("\n"))
}

/// The single user-role message carrying every outcome back to the model.
pub fn format_outcomes(outcomes: &[ToolCallOutcome]) -> String {
    let mut text = String::from("Tool results:");
    for outcome in outcomes {
        text.push_str("\n\n");
        text.push_str(&outcome.to_string());
    }
    text.push_str("\n\nUse these results to answer the original request.");
    text
}
