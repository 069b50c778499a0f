//! Persisted record shapes shared between the Persistence Port and the HTTP
//! surface. These mirror the tables described in the on-disk schema: users,
//! tokens, sessions, messages, mcp_servers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub display_name: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub name: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub forked_from: Option<Uuid>,
    /// Relative path `"{id}/workspace"` under the configured data root.
    pub workspace_dir: String,
}

impl Session {
    pub fn workspace_dir_for(id: Uuid) -> String {
        format!("{id}/workspace")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub seq: i64,
    pub session_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: i64,
}

/// A session row together with a short, pre-truncated preview of its
/// latest message, as returned by `list`. Truncated to at most 100
/// characters with a trailing ellipsis when truncation occurred.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    #[serde(flatten)]
    pub session: Session,
    pub preview: Option<String>,
}

const PREVIEW_MAX_CHARS: usize = 100;

/// Truncate `content` to at most `PREVIEW_MAX_CHARS` characters, appending a
/// single ellipsis character when truncation actually occurred.
pub fn truncate_preview(content: &str) -> String {
    if content.chars().count() <= PREVIEW_MAX_CHARS {
        return content.to_string();
    }
    let mut truncated: String = content.chars().take(PREVIEW_MAX_CHARS).collect();
    truncated.push('\u{2026}');
    truncated
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpTransport {
    Stdio,
    Sse,
    StreamableHttp,
}

/// An MCP server descriptor. `command`/`args`/`env` apply to `Stdio`
/// transport; `url`/`headers` apply to `Sse`/`StreamableHttp`. Only the
/// fields relevant to `transport` are meaningful.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerRecord {
    pub name: String,
    pub transport: McpTransport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub env: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub headers: std::collections::BTreeMap<String, String>,
    pub enabled: bool,
    pub created_at: i64,
}

/// One entry in `{workspace}/.pi/mcp.json`. Disabled records never reach
/// this stage; empty `env` is omitted from the serialized form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfigEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<std::collections::BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<std::collections::BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfigBlob {
    pub servers: std::collections::BTreeMap<String, McpConfigEntry>,
}

impl From<&McpServerRecord> for McpConfigEntry {
    fn from(record: &McpServerRecord) -> Self {
        match record.transport {
            McpTransport::Stdio => McpConfigEntry {
                command: record.command.clone(),
                args: record.args.clone(),
                env: if record.env.is_empty() {
                    None
                } else {
                    Some(record.env.clone())
                },
                url: None,
                headers: None,
            },
            McpTransport::Sse | McpTransport::StreamableHttp => McpConfigEntry {
                command: None,
                args: Vec::new(),
                env: None,
                url: record.url.clone(),
                headers: if record.headers.is_empty() {
                    None
                } else {
                    Some(record.headers.clone())
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_short_content_untouched() {
        assert_eq!(truncate_preview("hello"), "hello");
    }

    #[test]
    fn preview_truncates_with_ellipsis() {
        let long = "x".repeat(150);
        let preview = truncate_preview(&long);
        assert_eq!(preview.chars().count(), PREVIEW_MAX_CHARS + 1);
        assert!(preview.ends_with('\u{2026}'));
    }

    #[test]
    fn preview_exact_boundary_untouched() {
        let exact = "x".repeat(PREVIEW_MAX_CHARS);
        assert_eq!(truncate_preview(&exact), exact);
    }

    #[test]
    fn mcp_config_entry_omits_empty_env() {
        let record = McpServerRecord {
            name: "search".into(),
            transport: McpTransport::Stdio,
            command: Some("mcp-search".into()),
            args: vec![],
            url: None,
            env: Default::default(),
            headers: Default::default(),
            enabled: true,
            created_at: 0,
        };
        let entry = McpConfigEntry::from(&record);
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("env"));
    }

    #[test]
    fn mcp_config_entry_sse_uses_url() {
        let record = McpServerRecord {
            name: "remote".into(),
            transport: McpTransport::Sse,
            command: None,
            args: vec![],
            url: Some("https://example.com/mcp".into()),
            env: Default::default(),
            headers: Default::default(),
            enabled: true,
            created_at: 0,
        };
        let entry = McpConfigEntry::from(&record);
        assert_eq!(entry.url.as_deref(), Some("https://example.com/mcp"));
        assert!(entry.command.is_none());
    }
}
