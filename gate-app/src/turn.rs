//! One request against one conversation, start to finish.
//!
//! Turns for the same conversation are serialized by a per-conversation
//! mutex; different conversations never contend. Each turn runs in its own
//! task so a client disconnect cannot drop it mid-await.

use crate::approval::{ApprovalGate, Decisions, InvariantViolation};
use crate::emitter::{EventSink, FinishReason, StreamEvent};
use crate::error::TurnError;
use crate::sanitizer::{SanitizeReport, sanitize};
use crate::step_loop::{LoopOutcome, StepLoop};
use crate::store::{MessageStore, StoreError};
use dashmap::DashMap;
use gate_llm::{ConversationId, LanguageModel, Message, MessageId, Part, Role, ToolInvocation};
use gate_tools::ToolRegistry;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct ConversationLocks {
    inner: DashMap<ConversationId, Arc<Mutex<()>>>,
}

impl ConversationLocks {
    pub async fn acquire(&self, id: &ConversationId) -> OwnedMutexGuard<()> {
        let lock = self.inner.entry(id.clone()).or_default().clone();
        lock.lock_owned().await
    }

    /// Drops the entry unless another task still holds or awaits it.
    pub fn prune(&self, id: &ConversationId) {
        self.inner.remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub system_prompt: String,
    pub max_steps: usize,
    pub max_error_chars: usize,
    pub event_buffer: usize,
}

#[derive(Debug, Clone)]
pub struct UserInput {
    /// Client-chosen id; a retry with the same id is not appended twice.
    pub id: Option<MessageId>,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub conversation_id: ConversationId,
    pub message: Option<UserInput>,
    pub decisions: Decisions,
}

impl TurnRequest {
    pub fn validate(&self) -> Result<(), TurnError> {
        if self.conversation_id.trim().is_empty() {
            return Err(TurnError::InvalidRequest(
                "conversationId must not be empty".to_string(),
            ));
        }
        if let Some(message) = &self.message {
            if message.text.trim().is_empty() {
                return Err(TurnError::InvalidRequest(
                    "message.text must not be empty".to_string(),
                ));
            }
        }
        if self.message.is_none() && self.decisions.is_empty() {
            return Err(TurnError::InvalidRequest(
                "request needs a message, decisions, or both".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct TurnEngine {
    store: Arc<dyn MessageStore>,
    model: Arc<dyn LanguageModel>,
    registry: Arc<ToolRegistry>,
    locks: ConversationLocks,
    settings: TurnSettings,
}

impl TurnEngine {
    pub fn new(
        store: Arc<dyn MessageStore>,
        model: Arc<dyn LanguageModel>,
        registry: Arc<ToolRegistry>,
        settings: TurnSettings,
    ) -> Self {
        Self {
            store,
            model,
            registry,
            locks: ConversationLocks::default(),
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn model_name(&self) -> &str {
        self.model.model()
    }

    /// Spawns the turn and returns its event stream. Cancelling `cancel`
    /// stops the turn at the next step boundary.
    pub fn start(
        self: &Arc<Self>,
        request: TurnRequest,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<StreamEvent> {
        let (sink, rx) = EventSink::channel(self.settings.event_buffer);
        let engine = self.clone();
        tokio::spawn(async move {
            let conversation_id = request.conversation_id.clone();
            if let Err(e) = engine.run_turn(request, &sink, &cancel).await {
                tracing::error!(
                    conversation_id = %conversation_id,
                    error = %e,
                    retryable = e.is_retryable(),
                    "turn aborted"
                );
                sink.emit(StreamEvent::Error {
                    message: e.public_message(),
                })
                .await;
            }
        });
        rx
    }

    /// Runs one turn to completion and commits the resulting history. On
    /// error nothing is written, except the checkpoint taken after an
    /// approved call executed.
    #[tracing::instrument(level = "info", skip_all, fields(conversation_id = %request.conversation_id))]
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<LoopOutcome, TurnError> {
        request.validate()?;
        let id = request.conversation_id.clone();
        let guard = self.locks.acquire(&id).await;
        let result = self.run_locked(request, sink, cancel).await;
        drop(guard);
        self.locks.prune(&id);
        result
    }

    async fn run_locked(
        &self,
        request: TurnRequest,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<LoopOutcome, TurnError> {
        let id = request.conversation_id;

        let stored = self.store.load(&id).await?;
        let (mut history, report) = sanitize(stored);
        log_repairs(&id, "load", &report);

        let gate = ApprovalGate::new(&self.registry, self.settings.max_error_chars);
        let pass = gate.resolve(&id, &mut history, &request.decisions).await;
        sink.emit_all(pass.deltas.iter().map(StreamEvent::tool_delta)).await;
        self.flag_violations(&id, &pass.violations).await;
        if pass.approved_executed {
            // The side effect happened; keep it even if the model call fails.
            self.store.replace(&id, &history).await?;
            tracing::debug!("approved execution checkpointed");
        }

        let mut appended = false;
        if let Some(input) = request.message {
            let message = match input.id {
                Some(message_id) => Message::user(input.text).with_id(message_id),
                None => Message::user(input.text),
            };
            let last_user = history.iter().rev().find(|m| m.role == Role::User);
            if last_user.is_some_and(|m| m.id == message.id) {
                tracing::info!(message_id = %message.id, "duplicate user message ignored");
            } else {
                history.push(message);
                appended = true;
            }
            // An undecided call is abandoned once the user moves on.
            let (repaired, report) = sanitize(history);
            history = repaired;
            log_repairs(&id, "append", &report);
        }

        let still_paused = pass
            .paused
            .filter(|paused| crate::store::pending_call(&history).as_ref() == Some(paused));
        let outcome = match still_paused {
            Some(paused) => LoopOutcome::ToolPending(paused),
            None if appended || !pass.deltas.is_empty() || awaits_model_reply(&history) => {
                let step_loop = StepLoop {
                    model: self.model.as_ref(),
                    registry: &self.registry,
                    system_prompt: &self.settings.system_prompt,
                    max_steps: self.settings.max_steps,
                    max_error_chars: self.settings.max_error_chars,
                };
                let run = step_loop.run(&id, &mut history, sink, cancel).await?;
                self.flag_violations(&id, &run.violations).await;
                tracing::info!(steps = run.steps, outcome = ?run.outcome, "step loop finished");
                run.outcome
            }
            None => LoopOutcome::Done,
        };

        self.store.replace(&id, &history).await?;
        sink.emit(StreamEvent::Messages {
            conversation_id: id.clone(),
            messages: history,
        })
        .await;
        sink.emit(StreamEvent::Finish {
            reason: outcome.finish_reason(),
        })
        .await;
        if outcome.finish_reason() == FinishReason::Cancelled {
            tracing::info!("turn cancelled; last consistent history committed");
        }
        Ok(outcome)
    }

    /// Deletes a conversation once no turn holds it.
    pub async fn delete_conversation(&self, id: &ConversationId) -> Result<bool, StoreError> {
        let deleted = {
            let _guard = self.locks.acquire(id).await;
            self.store.delete(id).await?
        };
        self.locks.prune(id);
        Ok(deleted)
    }

    async fn flag_violations(&self, id: &ConversationId, violations: &[InvariantViolation]) {
        for violation in violations {
            tracing::error!(
                conversation_id = %id,
                violation = %violation,
                "conversation invariant violated; flagging for operator review"
            );
            if let Err(e) = self.store.mark_inconsistent(id, &violation.to_string()).await {
                tracing::error!(conversation_id = %id, error = %e, "failed to flag conversation");
            }
        }
    }
}

/// The history ends in tool output the model has not answered yet, as after
/// an approved call whose follow-up model request failed.
fn awaits_model_reply(history: &[Message]) -> bool {
    let Some(last) = history.last() else {
        return false;
    };
    last.role == Role::Assistant
        && last
            .parts
            .iter()
            .rev()
            .find(|p| p.is_meaningful())
            .and_then(Part::as_tool_invocation)
            .is_some_and(ToolInvocation::is_terminal)
}

fn log_repairs(id: &ConversationId, stage: &str, report: &SanitizeReport) {
    if report.is_clean() {
        return;
    }
    tracing::warn!(
        conversation_id = %id,
        stage,
        dropped_calls = ?report.dropped_calls,
        duplicate_calls = ?report.duplicate_calls,
        removed_messages = ?report.removed_messages,
        "history repaired"
    );
}
