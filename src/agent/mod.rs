//! Stock analysis agent - the reasoning loop
//!
//! INPUT → LOAD THREAD → MODEL ⇄ TOOLS → CHECKPOINT → COMPLETE
//!
//! Text deltas are pushed onto the caller's channel the moment the model
//! produces them; the full answer is never buffered before delivery.

use crate::checkpoint::CheckpointStore;
use crate::config::DEFAULT_MAX_TOOL_ROUNDS;
use crate::error::ChatAgentError;
use crate::llm::{ChatModel, CompletionEvent, CompletionRequest, CompletionResponse};
use crate::models::{ChatMessage, ChatTurn, MessageRole, ToolCall, ToolOutput};
use crate::tools::ToolRegistry;
use crate::Result;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const SYSTEM_PROMPT: &str = "You are a stock analysis assistant. You have the ability to get real-time stock prices, historical stock prices (given a date range), news and balance sheet data for a given ticker symbol.";

/// Instruction for agents running without market-data tools.
pub const PLAIN_SYSTEM_PROMPT: &str = "You are a stock analysis assistant. You do not have access to live market data, so answer from general knowledge and say so when a question needs current figures.";

/// What a finished run did, for logging and tests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub model_rounds: usize,
    pub tool_calls: usize,
    pub fragments: usize,
}

pub struct StockAgent {
    model: Arc<dyn ChatModel>,
    tools: Arc<ToolRegistry>,
    checkpoints: Arc<dyn CheckpointStore>,
    system_prompt: String,
    max_tool_rounds: usize,
}

impl StockAgent {
    pub fn new(
        model: Arc<dyn ChatModel>,
        tools: ToolRegistry,
        checkpoints: Arc<dyn CheckpointStore>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            model,
            tools: Arc::new(tools),
            checkpoints,
            system_prompt: system_prompt.into(),
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
        }
    }

    pub fn with_max_tool_rounds(mut self, max_tool_rounds: usize) -> Self {
        self.max_tool_rounds = max_tool_rounds;
        self
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.list()
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Run one user turn on `thread_id`, forwarding text fragments to `sink`.
    ///
    /// Turns on the same thread are serialized. A closed sink does not stop
    /// the run: generation and checkpointing still complete.
    pub async fn run(
        &self,
        thread_id: &str,
        turn: &ChatTurn,
        sink: mpsc::Sender<String>,
    ) -> Result<RunSummary> {
        let lock = self.checkpoints.thread_lock(thread_id).await;
        let _guard = lock.lock().await;

        let state = self.checkpoints.state(thread_id).await?;
        info!(
            thread_id = %thread_id,
            thread_state = ?state,
            model = %self.model.model_id(),
            "Starting agent run"
        );

        let mut messages = self
            .checkpoints
            .load(thread_id)
            .await?
            .map(|checkpoint| checkpoint.messages)
            .unwrap_or_default();

        self.ensure_system_prompt(&mut messages);
        messages.push(ChatMessage::user(turn.content.clone()));
        self.checkpoints
            .save(thread_id, messages.clone(), false)
            .await?;

        let definitions = self.tools.definitions();
        let mut summary = RunSummary::default();
        let mut sink_open = true;
        let mut tool_rounds = 0;

        loop {
            summary.model_rounds += 1;
            debug!(thread_id = %thread_id, round = summary.model_rounds, "Calling model");

            let response = self
                .stream_round(
                    CompletionRequest {
                        messages: messages.clone(),
                        tools: definitions.clone(),
                    },
                    &sink,
                    &mut sink_open,
                    &mut summary,
                )
                .await?;

            if response.tool_calls.is_empty() {
                messages.push(ChatMessage::assistant(response.content, Vec::new()));
                self.checkpoints.save(thread_id, messages, true).await?;

                info!(
                    thread_id = %thread_id,
                    model_rounds = summary.model_rounds,
                    tool_calls = summary.tool_calls,
                    fragments = summary.fragments,
                    "Agent run completed"
                );
                return Ok(summary);
            }

            if tool_rounds >= self.max_tool_rounds {
                return Err(ChatAgentError::AgentError(format!(
                    "Model kept requesting tools after {} rounds",
                    self.max_tool_rounds
                )));
            }
            tool_rounds += 1;

            let calls = normalize_tool_calls(response.tool_calls);
            messages.push(ChatMessage::assistant(response.content, calls.clone()));

            for call in &calls {
                let output = self.invoke_tool(call).await;
                messages.push(ChatMessage::tool(
                    call.id.clone(),
                    serde_json::to_string(&output)?,
                ));
                summary.tool_calls += 1;
            }

            self.checkpoints
                .save(thread_id, messages.clone(), false)
                .await?;
        }
    }

    fn ensure_system_prompt(&self, messages: &mut Vec<ChatMessage>) {
        match messages.first_mut() {
            Some(first) if first.role == MessageRole::System => {
                first.content = self.system_prompt.clone();
            }
            _ => messages.insert(0, ChatMessage::system(self.system_prompt.clone())),
        }
    }

    /// Stream one model call, forwarding deltas, and return its completion.
    async fn stream_round(
        &self,
        request: CompletionRequest,
        sink: &mpsc::Sender<String>,
        sink_open: &mut bool,
        summary: &mut RunSummary,
    ) -> Result<CompletionResponse> {
        let mut stream = self.model.stream(request).await?;

        while let Some(event) = stream.next().await {
            match event? {
                CompletionEvent::TextDelta(text) => {
                    summary.fragments += 1;
                    if *sink_open && sink.send(text).await.is_err() {
                        *sink_open = false;
                        debug!("Client disconnected; finishing run without streaming");
                    }
                }
                CompletionEvent::Completed(response) => return Ok(response),
            }
        }

        Err(ChatAgentError::LlmError(
            "Model stream ended without a completion".to_string(),
        ))
    }

    /// Execute a tool; failures become an error result for the model.
    async fn invoke_tool(&self, call: &ToolCall) -> ToolOutput {
        let started = Instant::now();
        let result = self.tools.execute(&call.name, call.arguments.clone()).await;
        let execution_time_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                info!(
                    tool_name = %call.name,
                    execution_time_ms,
                    success = output.success,
                    "Tool executed"
                );
                output
            }
            Err(e) => {
                warn!(
                    tool_name = %call.name,
                    execution_time_ms,
                    error = %e,
                    "Tool failed"
                );
                ToolOutput::failed(e.to_string())
            }
        }
    }
}

/// Providers occasionally omit call ids; tool messages need one to answer.
fn normalize_tool_calls(calls: Vec<ToolCall>) -> Vec<ToolCall> {
    calls
        .into_iter()
        .map(|mut call| {
            if call.id.is_empty() {
                call.id = format!("call_{}", Uuid::new_v4().simple());
            }
            call
        })
        .collect()
}
