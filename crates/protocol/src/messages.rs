//! The outward event alphabet (agent → client) and inbound command alphabet
//! (client → agent) carried as UTF-8 JSON frames over the bidirectional
//! session stream, plus the small set of HTTP auth payloads.

use serde::{Deserialize, Serialize};

/// Events produced by the Event Translator (C2) and delivered to the bound
/// connection in source order. Unknown/unmapped agent-internal events never
/// reach this alphabet — the translator drops them upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutwardEvent {
    AgentStart,
    MessageDelta {
        text: String,
    },
    MessageEnd,
    ToolStart {
        id: String,
        tool: String,
        args: serde_json::Value,
    },
    ToolEnd {
        id: String,
        tool: String,
        result: serde_json::Value,
        is_error: bool,
    },
    AgentEnd,
    SkillStart {
        skill: String,
        label: String,
    },
    SkillEnd {
        skill: String,
    },
    FilesChanged {
        paths: Vec<String>,
    },
    ContextUsage {
        tokens: u64,
        context_window: u64,
        percent: f64,
    },
    Error {
        message: String,
    },
}

/// Commands accepted from the client over the bound connection. Unknown
/// `type` values are ignored by the receiver rather than rejected; malformed
/// JSON is reported as an `OutwardEvent::Error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundCommand {
    Prompt {
        message: String,
    },
    SkillInvoke {
        skill: String,
        #[serde(default)]
        args: Option<String>,
    },
    Abort,
    Steer {
        message: String,
    },
    Compact,
}

/// HTTP login request. Password is redacted in `Debug` to keep it out of
/// logs that format request bodies for diagnostics.
#[derive(Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub user_id: uuid::Uuid,
    pub username: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outward_event_tool_start_shape() {
        let event = OutwardEvent::ToolStart {
            id: "t1".into(),
            tool: "bash".into(),
            args: serde_json::json!({"command": "ls"}),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"tool_start""#));
        assert!(json.contains(r#""tool":"bash""#));
    }

    #[test]
    fn outward_event_message_delta_roundtrip() {
        let event = OutwardEvent::MessageDelta {
            text: "hi".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let parsed: OutwardEvent = serde_json::from_str(&json).unwrap();
        match parsed {
            OutwardEvent::MessageDelta { text } => assert_eq!(text, "hi"),
            other => panic!("expected MessageDelta, got {other:?}"),
        }
    }

    #[test]
    fn outward_event_error_shape() {
        let event = OutwardEvent::Error {
            message: "boom".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains("boom"));
    }

    #[test]
    fn inbound_command_prompt_parses() {
        let json = r#"{"type":"prompt","message":"do the thing"}"#;
        let cmd: InboundCommand = serde_json::from_str(json).unwrap();
        match cmd {
            InboundCommand::Prompt { message } => assert_eq!(message, "do the thing"),
            other => panic!("expected Prompt, got {other:?}"),
        }
    }

    #[test]
    fn inbound_command_skill_invoke_args_optional() {
        let json = r#"{"type":"skill_invoke","skill":"review"}"#;
        let cmd: InboundCommand = serde_json::from_str(json).unwrap();
        match cmd {
            InboundCommand::SkillInvoke { skill, args } => {
                assert_eq!(skill, "review");
                assert_eq!(args, None);
            }
            other => panic!("expected SkillInvoke, got {other:?}"),
        }
    }

    #[test]
    fn inbound_command_abort_has_no_payload() {
        let json = r#"{"type":"abort"}"#;
        let cmd: InboundCommand = serde_json::from_str(json).unwrap();
        assert!(matches!(cmd, InboundCommand::Abort));
    }

    #[test]
    fn inbound_command_unknown_type_fails_to_parse() {
        // Malformed/unknown frames are caught by the caller and translated
        // into an OutwardEvent::Error rather than propagated as a panic.
        let json = r#"{"type":"teleport"}"#;
        let result: Result<InboundCommand, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn login_request_password_redacted_in_debug() {
        let req = LoginRequest {
            username: "alice".into(),
            password: "hunter2".into(),
        };
        let debug_str = format!("{req:?}");
        assert!(debug_str.contains("alice"));
        assert!(debug_str.contains("[REDACTED]"));
        assert!(!debug_str.contains("hunter2"));
    }
}
