//! Approval-gated resolution of pending tool calls.
//!
//! One pass walks the history in document order. Autonomous calls run at
//! once; confirmed calls run, are denied, or pause the pass depending on the
//! decision supplied for them. Failures become the call's output and never
//! abort the pass.

use gate_llm::{ConversationId, Message, ToolCallId, ToolInvocation, ToolState};
use gate_tools::{Approval, RegisteredTool, ToolContext, ToolRegistry};
use std::collections::{BTreeMap, HashSet};
use std::time::Instant;
use thiserror::Error;

/// Output written into a call the user rejected.
pub const DENIED_MARKER: &str = "Error: User denied access to tool execution";

const TRUNCATION_SUFFIX: &str = "... [truncated]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approved,
    Rejected,
}

impl Decision {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "APPROVAL.YES" | "YES" => Some(Decision::Approved),
            "APPROVAL.NO" | "NO" => Some(Decision::Rejected),
            _ => None,
        }
    }
}

pub type Decisions = BTreeMap<ToolCallId, Decision>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    /// A second unresolved call was found after the pass had already paused.
    #[error("tool call {also_pending} is unresolved while {paused} awaits approval")]
    MultipleOutstanding {
        paused: ToolCallId,
        also_pending: ToolCallId,
    },
    /// A decision names a call that does not exist in the history.
    #[error("decision references unknown tool call {tool_call_id}")]
    UnknownDecision { tool_call_id: ToolCallId },
}

#[derive(Debug, Clone, Default)]
pub struct ResolvePass {
    /// Calls that reached `output-available`, in the order they resolved.
    pub deltas: Vec<ToolInvocation>,
    /// The confirmed call still waiting for a decision.
    pub paused: Option<ToolCallId>,
    pub violations: Vec<InvariantViolation>,
    /// An approved call ran, so an external side effect may have happened.
    pub approved_executed: bool,
}

/// Prefixes `Error: ` and bounds the message to `max_chars` characters.
pub fn format_tool_error(message: &str, max_chars: usize) -> String {
    let full = format!("Error: {message}");
    if full.chars().count() <= max_chars {
        return full;
    }
    let keep = max_chars.saturating_sub(TRUNCATION_SUFFIX.chars().count());
    let mut out: String = full.chars().take(keep).collect();
    out.push_str(TRUNCATION_SUFFIX);
    out
}

pub struct ApprovalGate<'a> {
    registry: &'a ToolRegistry,
    max_error_chars: usize,
}

impl<'a> ApprovalGate<'a> {
    pub fn new(registry: &'a ToolRegistry, max_error_chars: usize) -> Self {
        Self {
            registry,
            max_error_chars,
        }
    }

    fn error_output(&self, message: &str) -> serde_json::Value {
        serde_json::Value::String(format_tool_error(message, self.max_error_chars))
    }

    /// Advances every resolvable call in `messages`. Safe to run on every
    /// turn: resolved calls are skipped and their decisions ignored.
    #[tracing::instrument(level = "debug", skip_all, fields(conversation_id = %conversation_id))]
    pub async fn resolve(
        &self,
        conversation_id: &ConversationId,
        messages: &mut [Message],
        decisions: &Decisions,
    ) -> ResolvePass {
        let mut pass = ResolvePass::default();
        let mut known = HashSet::new();

        for message in messages.iter_mut() {
            for part in message.parts.iter_mut() {
                let Some(inv) = part.as_tool_invocation_mut() else {
                    continue;
                };
                known.insert(inv.tool_call_id().clone());
                if inv.state() != ToolState::InputAvailable {
                    continue;
                }
                if let Some(paused) = &pass.paused {
                    pass.violations.push(InvariantViolation::MultipleOutstanding {
                        paused: paused.clone(),
                        also_pending: inv.tool_call_id().clone(),
                    });
                    continue;
                }

                let output = match self.registry.lookup(inv.tool_name()) {
                    None => {
                        tracing::warn!(
                            tool_call_id = %inv.tool_call_id(),
                            tool_name = %inv.tool_name(),
                            "model proposed an unregistered tool"
                        );
                        serde_json::Value::String(format_tool_error(
                            &format!("unknown tool '{}'", inv.tool_name()),
                            self.max_error_chars,
                        ))
                    }
                    Some(tool) => match tool.approval() {
                        Approval::Autonomous => self.run(conversation_id, tool, inv).await,
                        Approval::Confirmed => match decisions.get(inv.tool_call_id()) {
                            None => {
                                tracing::info!(
                                    tool_call_id = %inv.tool_call_id(),
                                    tool_name = %inv.tool_name(),
                                    "tool call awaiting approval"
                                );
                                pass.paused = Some(inv.tool_call_id().clone());
                                continue;
                            }
                            Some(Decision::Rejected) => {
                                tracing::info!(
                                    tool_call_id = %inv.tool_call_id(),
                                    tool_name = %inv.tool_name(),
                                    "tool call rejected by user"
                                );
                                serde_json::Value::String(DENIED_MARKER.to_string())
                            }
                            Some(Decision::Approved) => {
                                pass.approved_executed = true;
                                self.run(conversation_id, tool, inv).await
                            }
                        },
                    },
                };

                if let Err(e) = inv.complete(output) {
                    tracing::error!(tool_call_id = %inv.tool_call_id(), error = %e, "tool call state rejected");
                    continue;
                }
                pass.deltas.push(inv.clone());
            }
        }

        for tool_call_id in decisions.keys() {
            if !known.contains(tool_call_id) {
                pass.violations.push(InvariantViolation::UnknownDecision {
                    tool_call_id: tool_call_id.clone(),
                });
            }
        }
        pass
    }

    /// Validates and executes one call; every failure becomes the output.
    async fn run(
        &self,
        conversation_id: &ConversationId,
        tool: &RegisteredTool,
        inv: &ToolInvocation,
    ) -> serde_json::Value {
        if let Err(e) = tool.validate_input(inv.input()) {
            tracing::info!(
                tool_call_id = %inv.tool_call_id(),
                tool_name = %inv.tool_name(),
                error = %e,
                "tool input failed validation"
            );
            return self.error_output(&e.to_string());
        }
        let Some(executor) = tool.executor() else {
            return self.error_output(&format!(
                "no executor is bound to tool '{}'",
                inv.tool_name()
            ));
        };

        let ctx = ToolContext::new(conversation_id.clone(), inv.tool_call_id().clone());
        let started = Instant::now();
        match executor.execute(&ctx, inv.input().clone()).await {
            Ok(output) => {
                tracing::info!(
                    tool_call_id = %inv.tool_call_id(),
                    tool_name = %inv.tool_name(),
                    latency_ms = started.elapsed().as_millis() as u64,
                    "tool call executed"
                );
                output
            }
            Err(e) => {
                tracing::warn!(
                    tool_call_id = %inv.tool_call_id(),
                    tool_name = %inv.tool_name(),
                    latency_ms = started.elapsed().as_millis() as u64,
                    error = %e,
                    "tool call failed"
                );
                self.error_output(&e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sanitizer::sanitize;
    use crate::testing::CountingTool;
    use gate_llm::Part;
    use serde_json::json;
    use std::sync::Arc;

    fn conv() -> ConversationId {
        ConversationId::from("conv")
    }

    fn call(id: &str, tool: &str) -> Part {
        Part::ToolInvocation(ToolInvocation::available(id, tool, json!({"title": "lunch"})))
    }

    fn find<'m>(messages: &'m [Message], id: &str) -> &'m ToolInvocation {
        messages
            .iter()
            .flat_map(Message::tool_invocations)
            .find(|inv| inv.tool_call_id().as_str() == id)
            .expect("call present")
    }

    struct Fixture {
        registry: ToolRegistry,
        calendar: Arc<CountingTool>,
        clock: Arc<CountingTool>,
    }

    fn fixture() -> Fixture {
        let calendar = Arc::new(CountingTool::new(
            "createCalendarEvent",
            Approval::Confirmed,
            json!("OK"),
        ));
        let clock = Arc::new(CountingTool::new(
            "getCurrentTime",
            Approval::Autonomous,
            json!("12:00"),
        ));
        let mut registry = ToolRegistry::new();
        registry.register_tool(calendar.clone()).expect("calendar");
        registry.register_tool(clock.clone()).expect("clock");
        Fixture {
            registry,
            calendar,
            clock,
        }
    }

    fn decisions(id: &str, decision: Decision) -> Decisions {
        Decisions::from([(ToolCallId::from(id), decision)])
    }

    #[test]
    fn decision_literals() {
        assert_eq!(Decision::parse("APPROVAL.YES"), Some(Decision::Approved));
        assert_eq!(Decision::parse("NO"), Some(Decision::Rejected));
        assert_eq!(Decision::parse(" YES "), Some(Decision::Approved));
        assert_eq!(Decision::parse("maybe"), None);
    }

    #[test]
    fn long_errors_are_truncated() {
        let out = format_tool_error(&"x".repeat(1000), 50);
        assert_eq!(out.chars().count(), 50);
        assert!(out.starts_with("Error: xxx"));
        assert!(out.ends_with(TRUNCATION_SUFFIX));
        assert_eq!(format_tool_error("boom", 50), "Error: boom");
    }

    #[tokio::test]
    async fn rejected_call_gets_marker_without_execution() {
        let f = fixture();
        let mut history = vec![Message::assistant(vec![call("C", "createCalendarEvent")])];
        let pass = ApprovalGate::new(&f.registry, 500)
            .resolve(&conv(), &mut history, &decisions("C", Decision::Rejected))
            .await;

        let c = find(&history, "C");
        assert_eq!(c.state(), ToolState::OutputAvailable);
        assert_eq!(c.output(), Some(&json!(DENIED_MARKER)));
        assert_eq!(f.calendar.calls(), 0);
        assert_eq!(pass.deltas.len(), 1);
        assert!(!pass.approved_executed);
        assert!(pass.violations.is_empty());
    }

    #[tokio::test]
    async fn approved_call_runs_exactly_once() {
        let f = fixture();
        let gate = ApprovalGate::new(&f.registry, 500);
        let mut history = vec![Message::assistant(vec![call("C", "createCalendarEvent")])];
        let approve = decisions("C", Decision::Approved);

        let pass = gate.resolve(&conv(), &mut history, &approve).await;
        assert_eq!(find(&history, "C").output(), Some(&json!("OK")));
        assert_eq!(f.calendar.calls(), 1);
        assert!(pass.approved_executed);
        assert_eq!(f.calendar.last_context().map(|c| c.conversation_id), Some(conv()));

        // Replaying the same decision is a no-op.
        let replay = gate.resolve(&conv(), &mut history, &approve).await;
        assert!(replay.deltas.is_empty());
        assert!(replay.violations.is_empty());
        assert_eq!(f.calendar.calls(), 1);
    }

    #[tokio::test]
    async fn undecided_call_never_resolves() {
        let f = fixture();
        let gate = ApprovalGate::new(&f.registry, 500);
        let mut history = vec![Message::assistant(vec![call("C", "createCalendarEvent")])];
        for _ in 0..5 {
            let pass = gate.resolve(&conv(), &mut history, &Decisions::new()).await;
            assert_eq!(pass.paused, Some(ToolCallId::from("C")));
            assert!(pass.deltas.is_empty());
        }
        assert_eq!(find(&history, "C").state(), ToolState::InputAvailable);
        assert_eq!(f.calendar.calls(), 0);
    }

    #[tokio::test]
    async fn autonomous_call_resolves_in_the_same_pass() {
        let f = fixture();
        let mut history = vec![Message::assistant(vec![call("T", "getCurrentTime")])];
        let pass = ApprovalGate::new(&f.registry, 500)
            .resolve(&conv(), &mut history, &Decisions::new())
            .await;
        assert_eq!(find(&history, "T").output(), Some(&json!("12:00")));
        assert_eq!(f.clock.calls(), 1);
        assert_eq!(pass.paused, None);
        assert_eq!(pass.deltas[0].tool_call_id().as_str(), "T");
    }

    #[tokio::test]
    async fn unknown_tool_and_invalid_input_become_outputs() {
        let f = fixture();
        let mut history = vec![Message::assistant(vec![
            call("U", "launchRockets"),
            Part::ToolInvocation(ToolInvocation::available(
                "V",
                "getCurrentTime",
                json!("not an object"),
            )),
        ])];
        let pass = ApprovalGate::new(&f.registry, 500)
            .resolve(&conv(), &mut history, &Decisions::new())
            .await;

        assert_eq!(
            find(&history, "U").output(),
            Some(&json!("Error: unknown tool 'launchRockets'"))
        );
        let v = find(&history, "V").output().and_then(|o| o.as_str()).expect("text output");
        assert!(v.starts_with("Error: validation failed"));
        assert_eq!(f.clock.calls(), 0);
        assert_eq!(pass.deltas.len(), 2);
    }

    #[tokio::test]
    async fn failing_executor_is_captured_as_output() {
        let failing = Arc::new(CountingTool::failing("getCurrentTime", "clock unplugged"));
        let mut registry = ToolRegistry::new();
        registry.register_tool(failing.clone()).expect("register");
        let mut history = vec![Message::assistant(vec![call("T", "getCurrentTime")])];

        ApprovalGate::new(&registry, 500)
            .resolve(&conv(), &mut history, &Decisions::new())
            .await;
        assert_eq!(
            find(&history, "T").output(),
            Some(&json!("Error: execution failed: clock unplugged"))
        );
        assert_eq!(failing.calls(), 1);
    }

    #[tokio::test]
    async fn approved_call_without_executor_reports_error() {
        let mut registry = ToolRegistry::new();
        let spec = CountingTool::new("createCalendarEvent", Approval::Confirmed, json!("OK"));
        registry
            .register(gate_tools::Tool::spec(&spec), None)
            .expect("declare without executor");
        let mut history = vec![Message::assistant(vec![call("C", "createCalendarEvent")])];

        ApprovalGate::new(&registry, 500)
            .resolve(&conv(), &mut history, &decisions("C", Decision::Approved))
            .await;
        let out = find(&history, "C").output().and_then(|o| o.as_str()).expect("text");
        assert!(out.contains("no executor is bound"));
        assert_eq!(spec.calls(), 0);
    }

    #[tokio::test]
    async fn outstanding_calls_after_pause_are_left_pending() {
        let f = fixture();
        let mut history = vec![Message::assistant(vec![
            call("A", "createCalendarEvent"),
            call("B", "getCurrentTime"),
        ])];
        let pass = ApprovalGate::new(&f.registry, 500)
            .resolve(&conv(), &mut history, &Decisions::new())
            .await;

        assert_eq!(pass.paused, Some(ToolCallId::from("A")));
        assert_eq!(
            pass.violations,
            vec![InvariantViolation::MultipleOutstanding {
                paused: ToolCallId::from("A"),
                also_pending: ToolCallId::from("B"),
            }]
        );
        assert_eq!(find(&history, "B").state(), ToolState::InputAvailable);
        assert_eq!(f.clock.calls(), 0);
    }

    #[tokio::test]
    async fn decision_for_unknown_call_is_a_violation() {
        let f = fixture();
        let mut history = vec![Message::user("hello")];
        let pass = ApprovalGate::new(&f.registry, 500)
            .resolve(&conv(), &mut history, &decisions("ghost", Decision::Approved))
            .await;
        assert_eq!(
            pass.violations,
            vec![InvariantViolation::UnknownDecision {
                tool_call_id: ToolCallId::from("ghost"),
            }]
        );
        assert_eq!(f.calendar.calls(), 0);
    }

    #[tokio::test]
    async fn sanitized_histories_keep_at_most_one_unresolved_call() {
        let f = fixture();
        let gate = ApprovalGate::new(&f.registry, 500);
        let histories = vec![
            vec![
                Message::assistant(vec![call("A", "createCalendarEvent")]),
                Message::user("x"),
                Message::assistant(vec![call("B", "getCurrentTime"), call("C", "createCalendarEvent")]),
            ],
            vec![Message::assistant(vec![
                call("A", "createCalendarEvent"),
                call("B", "createCalendarEvent"),
            ])],
            vec![Message::assistant(vec![call("A", "getCurrentTime")])],
        ];
        for history in histories {
            let (mut history, _) = sanitize(history);
            let pass = gate.resolve(&conv(), &mut history, &Decisions::new()).await;
            let unresolved = history
                .iter()
                .flat_map(Message::tool_invocations)
                .filter(|inv| !inv.is_terminal())
                .count();
            assert!(unresolved <= 1);
            assert!(pass.violations.is_empty());
        }
    }
}
