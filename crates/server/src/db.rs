//! C7 Persistence Port: the one durable relational store in the system.
//!
//! Backed by SQLite via `sqlx`. The schema mirrors §6 exactly: `users`,
//! `tokens` (cascade from users), `sessions` (cascade from users, nullable
//! self-referential `forked_from`), `messages` (cascade from sessions,
//! indexed on `(session_id, timestamp)`), `mcp_servers`.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use forge_protocol::{
    truncate_preview, McpServerRecord, McpTransport, Message, MessageRole, Session,
    SessionSummary, User,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::auth::{hash_password, verify_password};

pub const TOKEN_TTL_SECS: i64 = 30 * 24 * 60 * 60; // 30 days

#[derive(Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    pub async fn connect(path: &std::path::Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating data directory {}", parent.display()))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        // A single connection avoids SQLite's per-connection `:memory:`
        // isolation surprising tests, and matches the single-writer model
        // the rest of the runtime already assumes for this store.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("opening sqlite database")?;
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&pool)
            .await
            .context("enabling foreign keys")?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("running schema migrations")?;
        Ok(Self { pool })
    }

    // --- users ---------------------------------------------------------

    pub async fn create_user(&self, username: &str, display_name: &str, password: &str) -> Result<User> {
        let id = Uuid::new_v4();
        let now = now_secs();
        let hash = hash_password(password);
        sqlx::query(
            "INSERT INTO users (id, username, display_name, password_hash, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(username)
        .bind(display_name)
        .bind(&hash)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("inserting user")?;
        Ok(User {
            id,
            username: username.to_string(),
            display_name: display_name.to_string(),
            created_at: now,
        })
    }

    pub async fn user_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let row = sqlx::query("SELECT id, username, display_name, created_at FROM users WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("fetching user by id")?;
        Ok(row.map(row_to_user))
    }

    pub async fn user_by_username(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT id, username, display_name, created_at FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .context("fetching user by username")?;
        Ok(row.map(row_to_user))
    }

    /// Checks a username/password pair against the stored hash. This is the
    /// narrow `authenticate` contract the Persistence Port exposes; a real
    /// deployment may replace the hash scheme but keeps this signature.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT id, username, display_name, created_at, password_hash FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .context("fetching user for authentication")?;
        let Some(row) = row else { return Ok(None) };
        let hash: String = row.get("password_hash");
        if !verify_password(password, &hash) {
            return Ok(None);
        }
        Ok(Some(row_to_user(row)))
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        let rows = sqlx::query("SELECT id, username, display_name, created_at FROM users ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .context("listing users")?;
        Ok(rows.into_iter().map(row_to_user).collect())
    }

    pub async fn delete_user(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("deleting user")?;
        Ok(())
    }

    // --- tokens ----------------------------------------------------------

    pub async fn create_token(&self, user_id: Uuid) -> Result<String> {
        self.purge_expired_tokens().await?;
        let token = crate::auth::generate_token();
        let now = now_secs();
        sqlx::query("INSERT INTO tokens (token, user_id, created_at, expires_at) VALUES (?, ?, ?, ?)")
            .bind(&token)
            .bind(user_id.to_string())
            .bind(now)
            .bind(now + TOKEN_TTL_SECS)
            .execute(&self.pool)
            .await
            .context("inserting token")?;
        Ok(token)
    }

    /// Validate a bearer token, returning its owning user. Expired tokens
    /// are treated as absent and opportunistically purged.
    pub async fn validate_token(&self, token: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT users.id, users.username, users.display_name, users.created_at, tokens.expires_at \
             FROM tokens JOIN users ON users.id = tokens.user_id WHERE tokens.token = ?",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .context("validating token")?;
        let Some(row) = row else { return Ok(None) };
        let expires_at: i64 = row.get("expires_at");
        if expires_at < now_secs() {
            sqlx::query("DELETE FROM tokens WHERE token = ?")
                .bind(token)
                .execute(&self.pool)
                .await
                .context("purging expired token")?;
            return Ok(None);
        }
        Ok(Some(row_to_user(row)))
    }

    /// Revoke a single bearer token (logout). Idempotent: revoking an
    /// already-absent token is not an error.
    pub async fn revoke_token(&self, token: &str) -> Result<()> {
        sqlx::query("DELETE FROM tokens WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await
            .context("revoking token")?;
        Ok(())
    }

    async fn purge_expired_tokens(&self) -> Result<()> {
        sqlx::query("DELETE FROM tokens WHERE expires_at < ?")
            .bind(now_secs())
            .execute(&self.pool)
            .await
            .context("purging expired tokens")?;
        Ok(())
    }

    // --- sessions ----------------------------------------------------------

    pub async fn create_session(&self, id: Uuid, user_id: Option<Uuid>, name: &str) -> Result<Session> {
        let now = now_secs();
        let workspace_dir = Session::workspace_dir_for(id);
        sqlx::query(
            "INSERT INTO sessions (id, user_id, name, created_at, updated_at, forked_from, workspace_dir) \
             VALUES (?, ?, ?, ?, ?, NULL, ?)",
        )
        .bind(id.to_string())
        .bind(user_id.map(|u| u.to_string()))
        .bind(name)
        .bind(now)
        .bind(now)
        .bind(&workspace_dir)
        .execute(&self.pool)
        .await
        .context("inserting session")?;
        Ok(Session {
            id,
            user_id,
            name: name.to_string(),
            created_at: now,
            updated_at: now,
            forked_from: None,
            workspace_dir,
        })
    }

    pub async fn get_session(&self, id: Uuid, user_id: Option<Uuid>) -> Result<Option<Session>> {
        let row = sqlx::query(
            "SELECT id, user_id, name, created_at, updated_at, forked_from, workspace_dir FROM sessions WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("fetching session")?;
        let Some(row) = row else { return Ok(None) };
        let session = row_to_session(row);
        if !owner_matches(&session, user_id) {
            return Ok(None);
        }
        Ok(Some(session))
    }

    /// List sessions visible to `user_id` (or all sessions when `None`,
    /// intended for the admin listing path), batch-fetching each session's
    /// latest message rather than issuing one query per session.
    pub async fn list_sessions(&self, user_id: Option<Uuid>) -> Result<Vec<SessionSummary>> {
        let rows = if let Some(uid) = user_id {
            sqlx::query(
                "SELECT id, user_id, name, created_at, updated_at, forked_from, workspace_dir \
                 FROM sessions WHERE user_id = ? OR user_id IS NULL ORDER BY updated_at DESC",
            )
            .bind(uid.to_string())
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query(
                "SELECT id, user_id, name, created_at, updated_at, forked_from, workspace_dir \
                 FROM sessions ORDER BY updated_at DESC",
            )
            .fetch_all(&self.pool)
            .await
        }
        .context("listing sessions")?;

        let sessions: Vec<Session> = rows.into_iter().map(row_to_session).collect();
        if sessions.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = sessions.iter().map(|s| s.id.to_string()).collect();
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let query = format!(
            "SELECT m1.session_id, m1.content FROM messages m1 \
             INNER JOIN (SELECT session_id, MAX(timestamp) AS max_ts FROM messages \
                         WHERE session_id IN ({placeholders}) GROUP BY session_id) m2 \
             ON m1.session_id = m2.session_id AND m1.timestamp = m2.max_ts"
        );
        let mut q = sqlx::query(&query);
        for id in &ids {
            q = q.bind(id);
        }
        let preview_rows = q.fetch_all(&self.pool).await.context("batch-fetching previews")?;
        let mut previews: BTreeMap<String, String> = BTreeMap::new();
        for row in preview_rows {
            let sid: String = row.get("session_id");
            let content: String = row.get("content");
            previews.insert(sid, truncate_preview(&content));
        }

        Ok(sessions
            .into_iter()
            .map(|s| {
                let preview = previews.get(&s.id.to_string()).cloned();
                SessionSummary { session: s, preview }
            })
            .collect())
    }

    pub async fn rename_session(&self, id: Uuid, user_id: Option<Uuid>, new_name: &str) -> Result<bool> {
        let Some(_) = self.get_session(id, user_id).await? else {
            return Ok(false);
        };
        sqlx::query("UPDATE sessions SET name = ?, updated_at = ? WHERE id = ?")
            .bind(new_name)
            .bind(now_secs())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("renaming session")?;
        Ok(true)
    }

    pub async fn delete_session(&self, id: Uuid, user_id: Option<Uuid>) -> Result<bool> {
        let Some(_) = self.get_session(id, user_id).await? else {
            return Ok(false);
        };
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("deleting session")?;
        Ok(true)
    }

    /// Copy the source session and every one of its messages, in
    /// chronological order, into a new session row.
    pub async fn fork_session(
        &self,
        source_id: Uuid,
        new_id: Uuid,
        new_name: &str,
        user_id: Option<Uuid>,
    ) -> Result<Option<Session>> {
        let Some(source) = self.get_session(source_id, user_id).await? else {
            return Ok(None);
        };
        let now = now_secs();
        let workspace_dir = Session::workspace_dir_for(new_id);
        let mut tx = self.pool.begin().await.context("starting fork transaction")?;
        sqlx::query(
            "INSERT INTO sessions (id, user_id, name, created_at, updated_at, forked_from, workspace_dir) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(new_id.to_string())
        .bind(source.user_id.map(|u| u.to_string()))
        .bind(new_name)
        .bind(now)
        .bind(now)
        .bind(source.id.to_string())
        .bind(&workspace_dir)
        .execute(&mut *tx)
        .await
        .context("inserting forked session")?;

        let messages = sqlx::query("SELECT role, content, timestamp FROM messages WHERE session_id = ? ORDER BY timestamp")
            .bind(source_id.to_string())
            .fetch_all(&mut *tx)
            .await
            .context("reading source messages")?;
        for row in messages {
            let role: String = row.get("role");
            let content: String = row.get("content");
            let timestamp: i64 = row.get("timestamp");
            sqlx::query("INSERT INTO messages (session_id, role, content, timestamp) VALUES (?, ?, ?, ?)")
                .bind(new_id.to_string())
                .bind(role)
                .bind(content)
                .bind(timestamp)
                .execute(&mut *tx)
                .await
                .context("copying message to fork")?;
        }
        tx.commit().await.context("committing fork transaction")?;

        Ok(Some(Session {
            id: new_id,
            user_id: source.user_id,
            name: new_name.to_string(),
            created_at: now,
            updated_at: now,
            forked_from: Some(source.id),
            workspace_dir,
        }))
    }

    // --- messages ----------------------------------------------------------

    pub async fn append_message(
        &self,
        session_id: Uuid,
        role: MessageRole,
        content: &str,
        timestamp: i64,
    ) -> Result<Message> {
        let role_str = role_to_str(role);
        let mut tx = self.pool.begin().await.context("starting message transaction")?;
        let result = sqlx::query("INSERT INTO messages (session_id, role, content, timestamp) VALUES (?, ?, ?, ?)")
            .bind(session_id.to_string())
            .bind(role_str)
            .bind(content)
            .bind(timestamp)
            .execute(&mut *tx)
            .await
            .context("inserting message")?;
        sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
            .bind(timestamp)
            .bind(session_id.to_string())
            .execute(&mut *tx)
            .await
            .context("touching session updated_at")?;
        tx.commit().await.context("committing message transaction")?;
        Ok(Message {
            seq: result.last_insert_rowid(),
            session_id,
            role,
            content: content.to_string(),
            timestamp,
        })
    }

    pub async fn list_messages(&self, session_id: Uuid, user_id: Option<Uuid>) -> Result<Vec<Message>> {
        if self.get_session(session_id, user_id).await?.is_none() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query("SELECT seq, role, content, timestamp FROM messages WHERE session_id = ? ORDER BY timestamp, seq")
            .bind(session_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context("listing messages")?;
        Ok(rows
            .into_iter()
            .map(|row| Message {
                seq: row.get("seq"),
                session_id,
                role: str_to_role(&row.get::<String, _>("role")),
                content: row.get("content"),
                timestamp: row.get("timestamp"),
            })
            .collect())
    }

    // --- mcp servers ----------------------------------------------------------

    pub async fn upsert_mcp_server(&self, record: &McpServerRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO mcp_servers (name, transport, command, args_json, url, env_json, headers_json, enabled, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(name) DO UPDATE SET transport=excluded.transport, command=excluded.command, \
             args_json=excluded.args_json, url=excluded.url, env_json=excluded.env_json, \
             headers_json=excluded.headers_json, enabled=excluded.enabled",
        )
        .bind(&record.name)
        .bind(transport_to_str(record.transport))
        .bind(&record.command)
        .bind(serde_json::to_string(&record.args)?)
        .bind(&record.url)
        .bind(serde_json::to_string(&record.env)?)
        .bind(serde_json::to_string(&record.headers)?)
        .bind(record.enabled)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .context("upserting mcp server")?;
        Ok(())
    }

    pub async fn list_mcp_servers(&self) -> Result<Vec<McpServerRecord>> {
        let rows = sqlx::query(
            "SELECT name, transport, command, args_json, url, env_json, headers_json, enabled, created_at FROM mcp_servers ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .context("listing mcp servers")?;
        rows.into_iter().map(row_to_mcp_record).collect()
    }

    pub async fn delete_mcp_server(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM mcp_servers WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .context("deleting mcp server")?;
        Ok(result.rows_affected() > 0)
    }
}

fn owner_matches(session: &Session, user_id: Option<Uuid>) -> bool {
    match session.user_id {
        None => true,
        Some(owner) => Some(owner) == user_id,
    }
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn row_to_user(row: sqlx::sqlite::SqliteRow) -> User {
    User {
        id: Uuid::parse_str(&row.get::<String, _>("id")).unwrap_or_default(),
        username: row.get("username"),
        display_name: row.get("display_name"),
        created_at: row.get("created_at"),
    }
}

fn row_to_session(row: sqlx::sqlite::SqliteRow) -> Session {
    Session {
        id: Uuid::parse_str(&row.get::<String, _>("id")).unwrap_or_default(),
        user_id: row
            .get::<Option<String>, _>("user_id")
            .and_then(|s| Uuid::parse_str(&s).ok()),
        name: row.get("name"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        forked_from: row
            .get::<Option<String>, _>("forked_from")
            .and_then(|s| Uuid::parse_str(&s).ok()),
        workspace_dir: row.get("workspace_dir"),
    }
}

fn role_to_str(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    }
}

fn str_to_role(s: &str) -> MessageRole {
    match s {
        "assistant" => MessageRole::Assistant,
        _ => MessageRole::User,
    }
}

fn transport_to_str(t: McpTransport) -> &'static str {
    match t {
        McpTransport::Stdio => "stdio",
        McpTransport::Sse => "sse",
        McpTransport::StreamableHttp => "streamable_http",
    }
}

fn str_to_transport(s: &str) -> McpTransport {
    match s {
        "sse" => McpTransport::Sse,
        "streamable_http" => McpTransport::StreamableHttp,
        _ => McpTransport::Stdio,
    }
}

fn row_to_mcp_record(row: sqlx::sqlite::SqliteRow) -> Result<McpServerRecord> {
    let args_json: String = row.get("args_json");
    let env_json: String = row.get("env_json");
    let headers_json: String = row.get("headers_json");
    Ok(McpServerRecord {
        name: row.get("name"),
        transport: str_to_transport(&row.get::<String, _>("transport")),
        command: row.get("command"),
        args: serde_json::from_str(&args_json).unwrap_or_default(),
        url: row.get("url"),
        env: serde_json::from_str(&env_json).unwrap_or_default(),
        headers: serde_json::from_str(&headers_json).unwrap_or_default(),
        enabled: row.get("enabled"),
        created_at: row.get("created_at"),
    })
}
