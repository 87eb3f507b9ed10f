//! In-memory doubles shared by the application unit tests.

use crate::application::tooling::ToolClient;
use crate::domain::types::{FailureKind, ToolCallOutcome, ToolContent, ToolDescriptor};
use crate::infrastructure::model::{ModelClient, ModelError, ModelRequest, ModelResponse};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy)]
pub enum StubBehaviour {
    /// Echo `"<server>:<tool>"` plus the arguments.
    Answer,
    /// Fail with the given kind.
    Fail(FailureKind),
}

pub struct StubToolClient {
    id: String,
    tools: Vec<ToolDescriptor>,
    connected: AtomicBool,
    behaviour: StubBehaviour,
    pub calls: Mutex<Vec<(String, Map<String, Value>)>>,
}

impl StubToolClient {
    pub fn new(id: &str, tools: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            tools: tools
                .iter()
                .map(|name| ToolDescriptor::new(*name, format!("{name} from {id}")))
                .collect(),
            connected: AtomicBool::new(true),
            behaviour: StubBehaviour::Answer,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(mut self, kind: FailureKind) -> Self {
        self.behaviour = StubBehaviour::Fail(kind);
        self
    }

    pub fn disconnected(self) -> Self {
        self.connected.store(false, Ordering::SeqCst);
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }
}

#[async_trait]
impl ToolClient for StubToolClient {
    fn server_id(&self) -> &str {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn list_tools(&self, _use_cache: bool) -> Vec<ToolDescriptor> {
        self.tools.clone()
    }

    async fn call_tool(&self, tool_name: &str, arguments: Map<String, Value>) -> ToolCallOutcome {
        self.calls
            .lock()
            .expect("calls lock")
            .push((tool_name.to_string(), arguments.clone()));
        match self.behaviour {
            StubBehaviour::Answer => ToolCallOutcome::Success {
                tool_name: tool_name.to_string(),
                server_id: self.id.clone(),
                result: vec![ToolContent::text(format!(
                    "{}:{tool_name} {}",
                    self.id,
                    Value::Object(arguments)
                ))],
            },
            StubBehaviour::Fail(kind) => {
                ToolCallOutcome::failure(tool_name, kind, format!("{} is broken", self.id))
            }
        }
    }

    async fn shutdown(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// Replays canned responses and records every request.
#[derive(Clone, Default)]
pub struct ScriptedModel {
    responses: Arc<Mutex<VecDeque<Result<ModelResponse, ModelError>>>>,
    pub requests: Arc<Mutex<Vec<ModelRequest>>>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<ModelResponse>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into_iter().map(Ok).collect())),
            requests: Arc::default(),
        }
    }

    pub fn replying(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|text| ModelResponse::new(*text)).collect())
    }

    pub fn then_fail(self, error: ModelError) -> Self {
        self.responses.lock().expect("responses lock").push_back(Err(error));
        self
    }

    pub fn recorded(&self) -> Vec<ModelRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        self.requests.lock().expect("requests lock").push(request);
        self.responses
            .lock()
            .expect("responses lock")
            .pop_front()
            .unwrap_or_else(|| Err(ModelError::unavailable("scripted", "script exhausted")))
    }
}
