//! History repair run before anything else reads a conversation.
//!
//! A crash between "call proposed" and "call resolved" can leave unresolved
//! invocations in the log. Model providers reject those, so every one that is
//! not the single approval candidate is removed here.

use gate_llm::{Message, MessageId, Part, ToolCallId, ToolState};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SanitizeReport {
    /// Unresolved invocations that were not the approval candidate.
    pub dropped_calls: Vec<ToolCallId>,
    /// Extra copies of a `toolCallId`; a resolved copy is the one kept.
    pub duplicate_calls: Vec<ToolCallId>,
    /// Messages left with nothing meaningful after dropping.
    pub removed_messages: Vec<MessageId>,
}

impl SanitizeReport {
    pub fn is_clean(&self) -> bool {
        self.dropped_calls.is_empty()
            && self.duplicate_calls.is_empty()
            && self.removed_messages.is_empty()
    }
}

/// The only unresolved invocation allowed to survive: the last meaningful
/// part of the last message, with complete input.
fn approval_candidate(messages: &[Message]) -> Option<ToolCallId> {
    let last = messages.last()?;
    let part = last.parts.iter().rev().find(|p| p.is_meaningful())?;
    let inv = part.as_tool_invocation()?;
    (inv.state() == ToolState::InputAvailable).then(|| inv.tool_call_id().clone())
}

/// Returns the repaired history. `sanitize(sanitize(h).0).0 == sanitize(h).0`.
pub fn sanitize(mut messages: Vec<Message>) -> (Vec<Message>, SanitizeReport) {
    let mut report = SanitizeReport::default();
    let mut touched = vec![false; messages.len()];

    // One copy per `toolCallId`: the first resolved one, else the first.
    let mut keep: HashMap<ToolCallId, (usize, usize, bool)> = HashMap::new();
    for (i, message) in messages.iter().enumerate() {
        for (j, part) in message.parts.iter().enumerate() {
            let Some(inv) = part.as_tool_invocation() else {
                continue;
            };
            let terminal = inv.is_terminal();
            keep.entry(inv.tool_call_id().clone())
                .and_modify(|kept| {
                    if terminal && !kept.2 {
                        *kept = (i, j, true);
                    }
                })
                .or_insert((i, j, terminal));
        }
    }
    for (i, message) in messages.iter_mut().enumerate() {
        let mut j = 0;
        message.parts.retain(|part| {
            let position = j;
            j += 1;
            let Some(inv) = part.as_tool_invocation() else {
                return true;
            };
            if keep
                .get(inv.tool_call_id())
                .is_some_and(|kept| (kept.0, kept.1) == (i, position))
            {
                return true;
            }
            report.duplicate_calls.push(inv.tool_call_id().clone());
            touched[i] = true;
            false
        });
    }

    let candidate = approval_candidate(&messages);
    for (i, message) in messages.iter_mut().enumerate() {
        message.parts.retain(|part| {
            let Some(inv) = part.as_tool_invocation() else {
                return true;
            };
            if inv.is_terminal() || Some(inv.tool_call_id()) == candidate.as_ref() {
                return true;
            }
            report.dropped_calls.push(inv.tool_call_id().clone());
            touched[i] = true;
            false
        });
    }

    let mut touched = touched.into_iter();
    messages.retain(|message| {
        let was_touched = touched.next().unwrap_or(false);
        if was_touched && !message.parts.iter().any(Part::is_meaningful) {
            report.removed_messages.push(message.id.clone());
            return false;
        }
        true
    });

    (messages, report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gate_llm::ToolInvocation;
    use serde_json::json;

    fn pending(id: &str) -> Part {
        Part::ToolInvocation(ToolInvocation::available(
            id,
            "createCalendarEvent",
            json!({"title": "x"}),
        ))
    }

    fn streaming(id: &str) -> Part {
        Part::ToolInvocation(ToolInvocation::streaming(id, "createCalendarEvent"))
    }

    fn resolved(id: &str) -> Part {
        let mut inv = ToolInvocation::available(id, "getCurrentTime", json!({}));
        inv.complete(json!("12:00")).expect("complete");
        Part::ToolInvocation(inv)
    }

    fn call_ids(messages: &[Message]) -> Vec<String> {
        messages
            .iter()
            .flat_map(Message::tool_invocations)
            .map(|inv| inv.tool_call_id().to_string())
            .collect()
    }

    #[test]
    fn dangling_call_before_user_message_is_removed() {
        let m1 = Message::assistant(vec![pending("A")]);
        let m2 = Message::user("never mind");
        let m1_id = m1.id.clone();

        let (out, report) = sanitize(vec![m1, m2.clone()]);
        assert_eq!(out, vec![m2]);
        assert_eq!(report.dropped_calls, vec![ToolCallId::from("A")]);
        assert_eq!(report.removed_messages, vec![m1_id]);
    }

    #[test]
    fn last_pending_call_is_kept_behind_blank_text() {
        let history = vec![
            Message::user("book it"),
            Message::assistant(vec![Part::text("Booking."), pending("A"), Part::text("  ")]),
        ];
        let (out, report) = sanitize(history.clone());
        assert_eq!(out, history);
        assert!(report.is_clean());
    }

    #[test]
    fn only_the_last_of_several_pending_calls_survives() {
        let history = vec![Message::assistant(vec![
            Part::text("Two things."),
            pending("A"),
            resolved("B"),
            pending("C"),
        ])];
        let (out, report) = sanitize(history);
        assert_eq!(call_ids(&out), vec!["B", "C"]);
        assert_eq!(report.dropped_calls, vec![ToolCallId::from("A")]);
        assert!(report.removed_messages.is_empty());
    }

    #[test]
    fn streaming_call_is_never_a_candidate() {
        let history = vec![
            Message::user("hi"),
            Message::assistant(vec![Part::text("ok"), streaming("S")]),
        ];
        let (out, report) = sanitize(history);
        assert_eq!(out.len(), 2);
        assert!(call_ids(&out).is_empty());
        assert_eq!(report.dropped_calls, vec![ToolCallId::from("S")]);
    }

    #[test]
    fn duplicate_call_ids_keep_the_first_copy() {
        let history = vec![
            Message::assistant(vec![resolved("A")]),
            Message::assistant(vec![resolved("A")]),
            Message::user("next"),
        ];
        let (out, report) = sanitize(history);
        assert_eq!(out.len(), 2);
        assert_eq!(call_ids(&out), vec!["A"]);
        assert_eq!(report.duplicate_calls, vec![ToolCallId::from("A")]);
    }

    #[test]
    fn resolved_copy_wins_over_an_earlier_pending_one() {
        let stale = Message::assistant(vec![pending("A")]);
        let stale_id = stale.id.clone();
        let history = vec![
            stale,
            Message::assistant(vec![resolved("A"), Part::text("It is noon.")]),
            Message::user("thanks"),
        ];
        let (out, report) = sanitize(history);
        let kept: Vec<_> = out.iter().flat_map(Message::tool_invocations).collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].output(), Some(&json!("12:00")));
        assert_eq!(report.duplicate_calls, vec![ToolCallId::from("A")]);
        assert_eq!(report.removed_messages, vec![stale_id]);
        assert!(report.dropped_calls.is_empty());
    }

    #[test]
    fn untouched_empty_messages_are_left_alone() {
        let history = vec![Message::assistant(vec![]), Message::user("hi")];
        let (out, report) = sanitize(history.clone());
        assert_eq!(out, history);
        assert!(report.is_clean());
    }

    #[test]
    fn sanitize_is_idempotent() {
        let histories = vec![
            vec![Message::assistant(vec![pending("A")]), Message::user("x")],
            vec![
                Message::user("x"),
                Message::assistant(vec![pending("A"), pending("B")]),
            ],
            vec![
                Message::assistant(vec![pending("A")]),
                Message::assistant(vec![Part::text(" "), streaming("B")]),
            ],
            vec![
                Message::assistant(vec![resolved("A"), pending("A")]),
                Message::assistant(vec![streaming("S")]),
            ],
            vec![
                Message::user("x"),
                Message::assistant(vec![resolved("R"), Part::text("done")]),
            ],
            vec![
                Message::assistant(vec![pending("D"), Part::text("hm")]),
                Message::assistant(vec![resolved("D")]),
            ],
        ];
        for history in histories {
            let (once, _) = sanitize(history);
            let (twice, report) = sanitize(once.clone());
            assert_eq!(twice, once);
            assert!(report.is_clean());
            let unresolved = twice
                .iter()
                .flat_map(Message::tool_invocations)
                .filter(|inv| !inv.is_terminal())
                .count();
            assert!(unresolved <= 1);
        }
    }
}
