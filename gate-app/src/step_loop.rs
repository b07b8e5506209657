//! Bounded generate/resolve cycle for one turn.

use crate::approval::{ApprovalGate, Decisions, InvariantViolation, format_tool_error};
use crate::emitter::{EventSink, FinishReason, StreamEvent};
use futures_util::StreamExt;
use gate_llm::{
    ConversationId, LanguageModel, LlmError, Message, ModelRequest, Part, StreamChunk,
    ToolCallId, ToolDefinition, ToolInvocation,
};
use gate_tools::{Approval, ToolRegistry};
use std::collections::HashSet;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    Done,
    ToolPending(ToolCallId),
    StepBudgetExhausted,
    Cancelled,
}

impl LoopOutcome {
    pub fn finish_reason(&self) -> FinishReason {
        match self {
            LoopOutcome::Done => FinishReason::Done,
            LoopOutcome::ToolPending(_) => FinishReason::ToolPending,
            LoopOutcome::StepBudgetExhausted => FinishReason::StepLimit,
            LoopOutcome::Cancelled => FinishReason::Cancelled,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopRun {
    pub outcome: LoopOutcome,
    /// Model invocations that completed.
    pub steps: usize,
    pub violations: Vec<InvariantViolation>,
}

pub struct StepLoop<'a> {
    pub model: &'a dyn LanguageModel,
    pub registry: &'a ToolRegistry,
    pub system_prompt: &'a str,
    pub max_steps: usize,
    pub max_error_chars: usize,
}

struct StreamingCall {
    provider_id: ToolCallId,
    id: ToolCallId,
    name: String,
    arguments: String,
}

impl StepLoop<'_> {
    /// Drives the model until it stops proposing calls, a confirmed call
    /// pauses the turn, the budget runs out, or `cancel` fires.
    ///
    /// A partially streamed reply is never added to `history`.
    #[tracing::instrument(level = "info", skip_all, fields(conversation_id = %conversation_id, model = %self.model.model()))]
    pub async fn run(
        &self,
        conversation_id: &ConversationId,
        history: &mut Vec<Message>,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<LoopRun, LlmError> {
        let tools = self.registry.definitions();
        let gate = ApprovalGate::new(self.registry, self.max_error_chars);
        let mut violations = Vec::new();

        for step in 1..=self.max_steps {
            if cancel.is_cancelled() {
                return Ok(LoopRun {
                    outcome: LoopOutcome::Cancelled,
                    steps: step - 1,
                    violations,
                });
            }

            let started = Instant::now();
            let generated = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                reply = self.generate(history, &tools, sink) => Some(reply?),
            };
            let Some(mut parts) = generated else {
                tracing::info!(step, "turn cancelled while the model was streaming");
                return Ok(LoopRun {
                    outcome: LoopOutcome::Cancelled,
                    steps: step - 1,
                    violations,
                });
            };
            tracing::debug!(
                step,
                part_count = parts.len(),
                latency_ms = started.elapsed().as_millis() as u64,
                "model step completed"
            );

            let rejected = self.keep_single_confirmed(&mut parts);
            let proposed_calls = parts.iter().any(|p| p.as_tool_invocation().is_some());
            if !parts.is_empty() {
                history.push(Message::assistant(parts));
            }
            sink.emit_all(rejected.iter().map(StreamEvent::tool_delta)).await;

            if !proposed_calls {
                return Ok(LoopRun {
                    outcome: LoopOutcome::Done,
                    steps: step,
                    violations,
                });
            }

            let pass = gate
                .resolve(conversation_id, history, &Decisions::new())
                .await;
            sink.emit_all(pass.deltas.iter().map(StreamEvent::tool_delta)).await;
            violations.extend(pass.violations);
            if let Some(paused) = pass.paused {
                return Ok(LoopRun {
                    outcome: LoopOutcome::ToolPending(paused),
                    steps: step,
                    violations,
                });
            }
        }

        tracing::warn!(max_steps = self.max_steps, "step budget exhausted");
        Ok(LoopRun {
            outcome: LoopOutcome::StepBudgetExhausted,
            steps: self.max_steps,
            violations,
        })
    }

    /// Streams one model reply into message parts, forwarding deltas as they
    /// arrive.
    async fn generate(
        &self,
        history: &[Message],
        tools: &[ToolDefinition],
        sink: &EventSink,
    ) -> Result<Vec<Part>, LlmError> {
        let mut stream = self
            .model
            .stream(ModelRequest {
                system_prompt: self.system_prompt,
                messages: history,
                tools,
            })
            .await?;

        let mut used: HashSet<ToolCallId> = history
            .iter()
            .flat_map(Message::tool_invocations)
            .map(|inv| inv.tool_call_id().clone())
            .collect();
        let mut text = String::new();
        let mut calls: Vec<StreamingCall> = Vec::new();
        let mut finished = false;

        while let Some(chunk) = stream.next().await {
            match chunk? {
                StreamChunk::Delta { content } => {
                    text.push_str(&content);
                    sink.emit(StreamEvent::TextDelta { delta: content }).await;
                }
                StreamChunk::ToolCallStart { id, name } => {
                    let local = if used.contains(&id) {
                        ToolCallId::generate()
                    } else {
                        id.clone()
                    };
                    used.insert(local.clone());
                    sink.emit(StreamEvent::tool_delta(&ToolInvocation::streaming(
                        local.clone(),
                        name.clone(),
                    )))
                    .await;
                    calls.push(StreamingCall {
                        provider_id: id,
                        id: local,
                        name,
                        arguments: String::new(),
                    });
                }
                StreamChunk::ToolCallDelta { id, arguments } => {
                    let Some(call) = calls.iter_mut().rev().find(|c| c.provider_id == id) else {
                        return Err(LlmError::StreamParse(format!(
                            "arguments for unknown tool call {id}"
                        )));
                    };
                    call.arguments.push_str(&arguments);
                }
                StreamChunk::Done { usage } => {
                    tracing::debug!(
                        prompt_tokens = usage.prompt_tokens,
                        completion_tokens = usage.completion_tokens,
                        "model reply finished"
                    );
                    finished = true;
                    break;
                }
            }
        }
        if !finished {
            return Err(LlmError::Truncated);
        }

        let mut parts = Vec::with_capacity(calls.len() + 1);
        if !text.is_empty() {
            parts.push(Part::text(text));
        }
        for call in calls {
            let mut inv = ToolInvocation::streaming(call.id, call.name);
            if let Err(e) = inv.mark_input_available(parse_arguments(&call.arguments)) {
                tracing::error!(error = %e, "fresh tool call rejected input");
                continue;
            }
            sink.emit(StreamEvent::tool_delta(&inv)).await;
            parts.push(Part::ToolInvocation(inv));
        }
        Ok(parts)
    }

    /// Keeps the first confirmed call pending and moves it to the end of the
    /// reply; any further confirmed calls are resolved with an error asking
    /// the model to propose them again. Returns the calls resolved here.
    fn keep_single_confirmed(&self, parts: &mut Vec<Part>) -> Vec<ToolInvocation> {
        let mut first: Option<usize> = None;
        let mut rejected = Vec::new();
        for (i, part) in parts.iter_mut().enumerate() {
            let Some(inv) = part.as_tool_invocation_mut() else {
                continue;
            };
            let confirmed = self
                .registry
                .lookup(inv.tool_name())
                .is_some_and(|t| t.approval() == Approval::Confirmed);
            if !confirmed {
                continue;
            }
            if first.is_none() {
                first = Some(i);
                continue;
            }
            let message = format!(
                "only one call may await approval at a time; propose '{}' again after the pending call is decided",
                inv.tool_name()
            );
            let output = serde_json::Value::String(format_tool_error(&message, self.max_error_chars));
            if inv.complete(output).is_ok() {
                rejected.push(inv.clone());
            }
        }
        if let Some(i) = first {
            let pending = parts.remove(i);
            parts.push(pending);
        }
        rejected
    }
}

/// Empty arguments mean `{}`; text that is not JSON is kept as a string so
/// schema validation reports it.
fn parse_arguments(raw: &str) -> serde_json::Value {
    if raw.trim().is_empty() {
        return serde_json::json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}
