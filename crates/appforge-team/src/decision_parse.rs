//! Decision extraction.
//!
//! Two channels, in precedence order: a `workflow_decision` tool call on an
//! assistant message, then a `[WORKFLOW_DECISION]{…}[/WORKFLOW_DECISION]`
//! marker embedded in assistant text (legacy fallback).

use std::sync::OnceLock;

use regex::Regex;

use appforge_contract::{Decision, Message, Role};

fn marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)\[WORKFLOW_DECISION\](.*?)\[/WORKFLOW_DECISION\]")
            .expect("marker regex is valid")
    })
}

/// Scan the node's messages (newest first) for a structured decision.
pub fn parse_decision(messages: &[Message]) -> Option<Decision> {
    // Tool-call channel wins.
    for msg in messages.iter().rev() {
        if msg.role != Role::Assistant {
            continue;
        }
        for tc in &msg.tool_calls {
            if tc.name != "workflow_decision" {
                continue;
            }
            if let Ok(decision) = serde_json::from_value::<Decision>(tc.args.clone()) {
                if !decision.next_action.is_empty() {
                    return Some(decision.normalised());
                }
            }
        }
    }
    // Text-marker fallback.
    for msg in messages.iter().rev() {
        if msg.role != Role::Assistant || msg.content.is_empty() {
            continue;
        }
        if let Some(captures) = marker_regex().captures(&msg.content) {
            let raw = captures.get(1).map(|m| m.as_str().trim()).unwrap_or("");
            if let Ok(decision) = serde_json::from_str::<Decision>(raw) {
                if !decision.next_action.is_empty() {
                    return Some(decision.normalised());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use appforge_contract::ToolCall;
    use serde_json::json;

    fn assistant_with_decision(action: &str, instruction: Option<&str>) -> Message {
        let mut args = json!({"next_action": action});
        if let Some(i) = instruction {
            args["instruction_for_next"] = json!(i);
        }
        Message::assistant("s1", "").with_tool_calls(vec![ToolCall::new(
            "call_d",
            "workflow_decision",
            args,
        )])
    }

    #[test]
    fn tool_call_channel() {
        let messages = vec![
            Message::user("s1", "go"),
            assistant_with_decision("back_to_pm", Some("clarify section 2")),
        ];
        let decision = parse_decision(&messages).unwrap();
        assert_eq!(decision.next_action, "back_to_pm");
        assert_eq!(
            decision.instruction_for_next.as_deref(),
            Some("clarify section 2")
        );
    }

    #[test]
    fn text_marker_fallback() {
        let messages = vec![Message::assistant(
            "s1",
            "All done.\n[WORKFLOW_DECISION]{\"next_action\": \"end\"}[/WORKFLOW_DECISION]",
        )];
        let decision = parse_decision(&messages).unwrap();
        assert_eq!(decision.next_action, "end");
    }

    #[test]
    fn tool_call_wins_over_marker() {
        let messages = vec![
            Message::assistant(
                "s1",
                "[WORKFLOW_DECISION]{\"next_action\": \"end\"}[/WORKFLOW_DECISION]",
            ),
            assistant_with_decision("continue", None),
        ];
        let decision = parse_decision(&messages).unwrap();
        assert_eq!(decision.next_action, "continue");
    }

    #[test]
    fn garbage_marker_is_ignored() {
        let messages = vec![Message::assistant(
            "s1",
            "[WORKFLOW_DECISION]not json[/WORKFLOW_DECISION]",
        )];
        assert!(parse_decision(&messages).is_none());
    }

    #[test]
    fn no_decision_returns_none() {
        let messages = vec![Message::assistant("s1", "just text")];
        assert!(parse_decision(&messages).is_none());
    }

    #[test]
    fn blank_instruction_normalised_away() {
        let messages = vec![assistant_with_decision("continue", Some("  "))];
        let decision = parse_decision(&messages).unwrap();
        assert_eq!(decision.instruction_for_next, None);
    }
}
