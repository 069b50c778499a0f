//! C2 Event Translator: a pure, stateless mapping from the agent SDK's
//! internal event vocabulary to the outward wire alphabet (§4.2). No I/O, no
//! retained state — every call is independent of every other.

use forge_protocol::OutwardEvent;

/// The agent SDK's internal event vocabulary. The real agent SDK is an
/// external collaborator (§1); this enum is the narrow shape the Runtime's
/// subscription callback receives, modeled directly on the mapping table in
/// §4.2.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    AgentStart,
    MessageUpdate(MessageUpdateKind),
    MessageEnd,
    ToolExecutionStart {
        id: String,
        tool_name: String,
        args: serde_json::Value,
    },
    ToolExecutionEnd {
        id: String,
        tool_name: String,
        result: serde_json::Value,
        is_error: bool,
    },
    AgentEnd,
    /// Anything the translator doesn't recognize — exercises the "anything
    /// else -> drop" default arm without needing a catch-all variant on
    /// every caller's match.
    Other,
}

#[derive(Debug, Clone)]
pub enum MessageUpdateKind {
    TextDelta { delta: String },
    /// Thinking deltas and any other nested kind the outward alphabet has
    /// no slot for.
    Other,
}

/// Translate one agent-internal event into an outward event, or `None` if
/// the event has no outward representation.
pub fn translate(event: &AgentEvent) -> Option<OutwardEvent> {
    match event {
        AgentEvent::AgentStart => Some(OutwardEvent::AgentStart),
        AgentEvent::MessageUpdate(MessageUpdateKind::TextDelta { delta }) => {
            Some(OutwardEvent::MessageDelta { text: delta.clone() })
        }
        AgentEvent::MessageUpdate(MessageUpdateKind::Other) => None,
        AgentEvent::MessageEnd => Some(OutwardEvent::MessageEnd),
        AgentEvent::ToolExecutionStart { id, tool_name, args } => Some(OutwardEvent::ToolStart {
            id: id.clone(),
            tool: tool_name.clone(),
            args: args.clone(),
        }),
        AgentEvent::ToolExecutionEnd {
            id,
            tool_name,
            result,
            is_error,
        } => Some(OutwardEvent::ToolEnd {
            id: id.clone(),
            tool: tool_name.clone(),
            result: result.clone(),
            is_error: *is_error,
        }),
        AgentEvent::AgentEnd => Some(OutwardEvent::AgentEnd),
        AgentEvent::Other => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_start_maps_through() {
        assert!(matches!(translate(&AgentEvent::AgentStart), Some(OutwardEvent::AgentStart)));
    }

    #[test]
    fn text_delta_maps_to_message_delta() {
        let event = AgentEvent::MessageUpdate(MessageUpdateKind::TextDelta {
            delta: "hi".to_string(),
        });
        match translate(&event) {
            Some(OutwardEvent::MessageDelta { text }) => assert_eq!(text, "hi"),
            other => panic!("expected MessageDelta, got {other:?}"),
        }
    }

    #[test]
    fn non_text_delta_nested_kind_drops() {
        let event = AgentEvent::MessageUpdate(MessageUpdateKind::Other);
        assert!(translate(&event).is_none());
    }

    #[test]
    fn tool_execution_start_carries_id_tool_args() {
        let event = AgentEvent::ToolExecutionStart {
            id: "t1".into(),
            tool_name: "bash".into(),
            args: serde_json::json!({"command": "ls"}),
        };
        match translate(&event) {
            Some(OutwardEvent::ToolStart { id, tool, args }) => {
                assert_eq!(id, "t1");
                assert_eq!(tool, "bash");
                assert_eq!(args, serde_json::json!({"command": "ls"}));
            }
            other => panic!("expected ToolStart, got {other:?}"),
        }
    }

    #[test]
    fn tool_execution_end_carries_error_flag() {
        let event = AgentEvent::ToolExecutionEnd {
            id: "t1".into(),
            tool_name: "bash".into(),
            result: serde_json::json!("oops"),
            is_error: true,
        };
        match translate(&event) {
            Some(OutwardEvent::ToolEnd { is_error, .. }) => assert!(is_error),
            other => panic!("expected ToolEnd, got {other:?}"),
        }
    }

    #[test]
    fn unknown_event_drops() {
        assert!(translate(&AgentEvent::Other).is_none());
    }

    #[test]
    fn translation_is_deterministic_and_stateless() {
        let event = AgentEvent::AgentEnd;
        let first = translate(&event);
        let second = translate(&event);
        assert!(matches!(first, Some(OutwardEvent::AgentEnd)));
        assert!(matches!(second, Some(OutwardEvent::AgentEnd)));
    }
}
