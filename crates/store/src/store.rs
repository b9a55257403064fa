//! The SQLite conversation store.
//!
//! One shared connection behind a mutex; every write that touches a turn
//! runs in a transaction. Status changes go through the turn state machine
//! in `agently_domain::model::TurnStatus` — illegal transitions are
//! rejected here, not by callers.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use agently_domain::error::{Error, Result};
use agently_domain::model::{
    Conversation, Elicitation, ElicitationOutcome, ElicitationStatus, Message, MessageRole,
    PayloadMeta, Schedule, ToolCallRecord, ToolCallStatus, Trigger, Turn, TurnStatus,
};

use crate::migrations::{self, sql_err, MIGRATIONS};
use crate::redact::Redactor;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// NewMessage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Insert parameters for [`ConversationStore::append_message`].
#[derive(Debug, Clone)]
pub struct NewMessage {
    /// Explicit message id; generated when absent. Callers that embed the
    /// id in the message content (overflow wrappers) set it up front.
    pub id: Option<Uuid>,
    pub turn_id: Uuid,
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub interim: bool,
    pub content: Option<String>,
    pub payload_id: Option<String>,
    pub tool_name: Option<String>,
    pub tool_call_id: Option<String>,
    pub elicitation_id: Option<Uuid>,
    pub parent_id: Option<Uuid>,
}

impl NewMessage {
    pub fn text(turn_id: Uuid, conversation_id: Uuid, role: MessageRole, content: &str) -> Self {
        Self {
            id: None,
            turn_id,
            conversation_id,
            role,
            interim: false,
            content: Some(content.to_string()),
            payload_id: None,
            tool_name: None,
            tool_call_id: None,
            elicitation_id: None,
            parent_id: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ConversationStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ConversationStore {
    conn: Arc<Mutex<Connection>>,
    redactor: Redactor,
}

impl ConversationStore {
    /// Open (or create) the store at `path` and apply pending migrations.
    pub fn open(path: &Path, redactor: Redactor) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(Error::Io)?;
        }
        let mut conn = Connection::open(path).map_err(sql_err)?;
        Self::init(&mut conn)?;
        tracing::info!(path = %path.display(), "conversation store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            redactor,
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory(redactor: Redactor) -> Result<Self> {
        let mut conn = Connection::open_in_memory().map_err(sql_err)?;
        Self::init(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            redactor,
        })
    }

    fn init(conn: &mut Connection) -> Result<()> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "busy_timeout", 5000).map_err(sql_err)?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(sql_err)?;
        migrations::run(conn, MIGRATIONS)
    }

    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Conversations ─────────────────────────────────────────────────

    pub fn create_conversation(
        &self,
        user_subject: &str,
        parent_id: Option<Uuid>,
    ) -> Result<Conversation> {
        let conversation = Conversation {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            parent_id,
            user_subject: user_subject.to_string(),
        };
        self.lock()
            .execute(
                "INSERT INTO conversations (id, created_at, parent_id, user_subject)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    conversation.id.to_string(),
                    conversation.created_at.to_rfc3339(),
                    conversation.parent_id.map(|p| p.to_string()),
                    conversation.user_subject,
                ],
            )
            .map_err(sql_err)?;
        Ok(conversation)
    }

    pub fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        self.lock()
            .query_row(
                "SELECT id, created_at, parent_id, user_subject
                 FROM conversations WHERE id = ?1",
                [id.to_string()],
                row_to_conversation,
            )
            .optional()
            .map_err(sql_err)
    }

    pub fn list_conversations(&self, user_subject: Option<&str>) -> Result<Vec<Conversation>> {
        let conn = self.lock();
        let mut out = Vec::new();
        match user_subject {
            Some(user) => {
                let mut stmt = conn
                    .prepare(
                        "SELECT id, created_at, parent_id, user_subject FROM conversations
                         WHERE user_subject = ?1 ORDER BY created_at DESC",
                    )
                    .map_err(sql_err)?;
                let rows = stmt.query_map([user], row_to_conversation).map_err(sql_err)?;
                for row in rows {
                    out.push(row.map_err(sql_err)?);
                }
            }
            None => {
                let mut stmt = conn
                    .prepare(
                        "SELECT id, created_at, parent_id, user_subject FROM conversations
                         ORDER BY created_at DESC",
                    )
                    .map_err(sql_err)?;
                let rows = stmt.query_map([], row_to_conversation).map_err(sql_err)?;
                for row in rows {
                    out.push(row.map_err(sql_err)?);
                }
            }
        }
        Ok(out)
    }

    // ── Turns ─────────────────────────────────────────────────────────

    /// Atomically insert the user message and a new `queued` turn.
    ///
    /// Enforces the single-non-terminal-turn invariant: posting while
    /// another turn is still active is a validation error.
    pub fn post_user_message(
        &self,
        conversation_id: Uuid,
        text: &str,
        agent_id: Option<&str>,
        model_id: Option<&str>,
        policy: Option<&serde_json::Value>,
    ) -> Result<(Turn, Message)> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(sql_err)?;

        let exists: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM conversations WHERE id = ?1",
                [conversation_id.to_string()],
                |row| row.get(0),
            )
            .map_err(sql_err)?;
        if exists == 0 {
            return Err(Error::Validation(format!(
                "conversation {conversation_id} does not exist"
            )));
        }

        let active: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM turns
                 WHERE conversation_id = ?1
                   AND status IN ('queued', 'running', 'waiting_elicitation')",
                [conversation_id.to_string()],
                |row| row.get(0),
            )
            .map_err(sql_err)?;
        if active > 0 {
            return Err(Error::Validation(format!(
                "conversation {conversation_id} already has an active turn"
            )));
        }

        let now = Utc::now();
        let message_id = Uuid::new_v4();
        let turn = Turn {
            id: Uuid::new_v4(),
            conversation_id,
            started_by: message_id,
            status: TurnStatus::Queued,
            error: None,
            started_at: now,
            finished_at: None,
            agent_id: agent_id.map(str::to_string),
            model_id: model_id.map(str::to_string),
            policy: policy.map(|p| self.redactor.scrubbed(p)),
        };

        tx.execute(
            "INSERT INTO turns (id, conversation_id, started_by, status, started_at,
                                agent_id, model_id, policy_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                turn.id.to_string(),
                conversation_id.to_string(),
                message_id.to_string(),
                turn.status.as_str(),
                now.to_rfc3339(),
                turn.agent_id,
                turn.model_id,
                turn.policy.as_ref().map(|p| p.to_string()),
            ],
        )
        .map_err(sql_err)?;

        tx.execute(
            "INSERT INTO messages (id, turn_id, conversation_id, role, interim, content, created_at)
             VALUES (?1, ?2, ?3, 'user', 0, ?4, ?5)",
            rusqlite::params![
                message_id.to_string(),
                turn.id.to_string(),
                conversation_id.to_string(),
                text,
                now.to_rfc3339(),
            ],
        )
        .map_err(sql_err)?;
        let seq = tx.last_insert_rowid();

        tx.commit().map_err(sql_err)?;

        let message = Message {
            id: message_id,
            turn_id: turn.id,
            conversation_id,
            role: MessageRole::User,
            interim: false,
            content: Some(text.to_string()),
            payload_id: None,
            tool_name: None,
            tool_call_id: None,
            elicitation_id: None,
            parent_id: None,
            created_at: now,
            seq,
        };
        Ok((turn, message))
    }

    pub fn get_turn(&self, id: Uuid) -> Result<Option<Turn>> {
        self.lock()
            .query_row(
                "SELECT id, conversation_id, started_by, status, error, started_at,
                        finished_at, agent_id, model_id, policy_json
                 FROM turns WHERE id = ?1",
                [id.to_string()],
                row_to_turn,
            )
            .optional()
            .map_err(sql_err)
    }

    /// The non-terminal turn for a conversation, if any.
    pub fn active_turn(&self, conversation_id: Uuid) -> Result<Option<Turn>> {
        self.lock()
            .query_row(
                "SELECT id, conversation_id, started_by, status, error, started_at,
                        finished_at, agent_id, model_id, policy_json
                 FROM turns
                 WHERE conversation_id = ?1
                   AND status IN ('queued', 'running', 'waiting_elicitation')",
                [conversation_id.to_string()],
                row_to_turn,
            )
            .optional()
            .map_err(sql_err)
    }

    pub fn list_turns(&self, conversation_id: Uuid) -> Result<Vec<Turn>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, conversation_id, started_by, status, error, started_at,
                        finished_at, agent_id, model_id, policy_json
                 FROM turns WHERE conversation_id = ?1 ORDER BY started_at",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([conversation_id.to_string()], row_to_turn)
            .map_err(sql_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(sql_err)?);
        }
        Ok(out)
    }

    /// Apply a state-machine transition. Illegal transitions are rejected
    /// and the row is untouched.
    pub fn set_turn_status(
        &self,
        turn_id: Uuid,
        status: TurnStatus,
        error: Option<&str>,
    ) -> Result<Turn> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(sql_err)?;

        let mut turn = tx
            .query_row(
                "SELECT id, conversation_id, started_by, status, error, started_at,
                        finished_at, agent_id, model_id, policy_json
                 FROM turns WHERE id = ?1",
                [turn_id.to_string()],
                row_to_turn,
            )
            .optional()
            .map_err(sql_err)?
            .ok_or_else(|| Error::Validation(format!("turn {turn_id} does not exist")))?;

        if !turn.status.can_transition_to(status) {
            return Err(Error::Validation(format!(
                "illegal turn transition {} -> {}",
                turn.status.as_str(),
                status.as_str()
            )));
        }

        let finished_at = status.is_terminal().then(Utc::now);
        tx.execute(
            "UPDATE turns SET status = ?2, error = ?3, finished_at = ?4 WHERE id = ?1",
            rusqlite::params![
                turn_id.to_string(),
                status.as_str(),
                error,
                finished_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(sql_err)?;
        tx.commit().map_err(sql_err)?;

        turn.status = status;
        turn.error = error.map(str::to_string);
        turn.finished_at = finished_at;
        Ok(turn)
    }

    // ── Messages ──────────────────────────────────────────────────────

    /// Append-only message insert.
    pub fn append_message(&self, new: NewMessage) -> Result<Message> {
        let conn = self.lock();
        let id = new.id.unwrap_or_else(Uuid::new_v4);
        let now = Utc::now();
        conn.execute(
            "INSERT INTO messages (id, turn_id, conversation_id, role, interim, content,
                                   payload_id, tool_name, tool_call_id, elicitation_id,
                                   parent_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            rusqlite::params![
                id.to_string(),
                new.turn_id.to_string(),
                new.conversation_id.to_string(),
                new.role.as_str(),
                new.interim as i64,
                new.content,
                new.payload_id,
                new.tool_name,
                new.tool_call_id,
                new.elicitation_id.map(|e| e.to_string()),
                new.parent_id.map(|p| p.to_string()),
                now.to_rfc3339(),
            ],
        )
        .map_err(sql_err)?;
        let seq = conn.last_insert_rowid();

        Ok(Message {
            id,
            turn_id: new.turn_id,
            conversation_id: new.conversation_id,
            role: new.role,
            interim: new.interim,
            content: new.content,
            payload_id: new.payload_id,
            tool_name: new.tool_name,
            tool_call_id: new.tool_call_id,
            elicitation_id: new.elicitation_id,
            parent_id: new.parent_id,
            created_at: now,
            seq,
        })
    }

    /// Replace the streaming content of an interim message. Finalized
    /// messages are frozen.
    pub fn update_interim(&self, message_id: Uuid, text: &str) -> Result<()> {
        let conn = self.lock();
        let changed = conn
            .execute(
                "UPDATE messages SET content = ?2 WHERE id = ?1 AND interim = 1",
                rusqlite::params![message_id.to_string(), text],
            )
            .map_err(sql_err)?;
        if changed == 1 {
            return Ok(());
        }
        let exists: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE id = ?1",
                [message_id.to_string()],
                |row| row.get(0),
            )
            .map_err(sql_err)?;
        if exists == 0 {
            Err(Error::Validation(format!("message {message_id} does not exist")))
        } else {
            Err(Error::Validation(format!("message {message_id} is final")))
        }
    }

    /// Flip `interim` to false. Idempotent.
    pub fn finalize_message(&self, message_id: Uuid) -> Result<()> {
        self.lock()
            .execute(
                "UPDATE messages SET interim = 0 WHERE id = ?1",
                [message_id.to_string()],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn get_message(&self, message_id: Uuid) -> Result<Option<Message>> {
        self.lock()
            .query_row(
                "SELECT seq, id, turn_id, conversation_id, role, interim, content, payload_id,
                        tool_name, tool_call_id, elicitation_id, parent_id, created_at
                 FROM messages WHERE id = ?1",
                [message_id.to_string()],
                row_to_message,
            )
            .optional()
            .map_err(sql_err)
    }

    /// Transcript snapshot: all messages with `seq > since`, in order.
    /// One query, so the read is snapshot-consistent.
    pub fn get_messages(&self, conversation_id: Uuid, since: i64) -> Result<Vec<Message>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT seq, id, turn_id, conversation_id, role, interim, content, payload_id,
                        tool_name, tool_call_id, elicitation_id, parent_id, created_at
                 FROM messages WHERE conversation_id = ?1 AND seq > ?2 ORDER BY seq",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(
                rusqlite::params![conversation_id.to_string(), since],
                row_to_message,
            )
            .map_err(sql_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(sql_err)?);
        }
        Ok(out)
    }

    // ── Payloads ──────────────────────────────────────────────────────

    /// Write a content-addressed payload; the id is the hex SHA-256 of
    /// the bytes. Writing the same bytes twice is a no-op.
    pub fn write_payload(&self, bytes: &[u8], media_type: &str) -> Result<String> {
        let id = hex::encode(Sha256::digest(bytes));
        self.lock()
            .execute(
                "INSERT OR IGNORE INTO payloads (id, media_type, size, bytes)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id, media_type, bytes.len() as i64, bytes],
            )
            .map_err(sql_err)?;
        Ok(id)
    }

    pub fn read_payload(&self, id: &str) -> Result<Option<(PayloadMeta, Vec<u8>)>> {
        self.lock()
            .query_row(
                "SELECT id, media_type, size, storage_uri, bytes FROM payloads WHERE id = ?1",
                [id],
                |row| {
                    let meta = PayloadMeta {
                        id: row.get(0)?,
                        media_type: row.get(1)?,
                        size: row.get::<_, i64>(2)? as u64,
                        storage_uri: row.get(3)?,
                    };
                    let bytes: Vec<u8> = row.get::<_, Option<Vec<u8>>>(4)?.unwrap_or_default();
                    Ok((meta, bytes))
                },
            )
            .optional()
            .map_err(sql_err)
    }

    // ── Tool call records ─────────────────────────────────────────────

    pub fn insert_tool_call(&self, record: &ToolCallRecord) -> Result<()> {
        self.lock()
            .execute(
                "INSERT INTO tool_calls (id, turn_id, tool_name, arg_hash, input_payload_id,
                                         output_payload_id, status, started_at, ended_at,
                                         retries, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                rusqlite::params![
                    record.id.to_string(),
                    record.turn_id.to_string(),
                    record.tool_name,
                    record.arg_hash,
                    record.input_payload_id,
                    record.output_payload_id,
                    record.status.as_str(),
                    record.started_at.to_rfc3339(),
                    record.ended_at.map(|t| t.to_rfc3339()),
                    record.retries,
                    record.error,
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn finish_tool_call(
        &self,
        id: Uuid,
        status: ToolCallStatus,
        output_payload_id: Option<&str>,
        retries: u32,
        error: Option<&str>,
    ) -> Result<()> {
        self.lock()
            .execute(
                "UPDATE tool_calls
                 SET status = ?2, output_payload_id = ?3, retries = ?4, error = ?5, ended_at = ?6
                 WHERE id = ?1",
                rusqlite::params![
                    id.to_string(),
                    status.as_str(),
                    output_payload_id,
                    retries,
                    error,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn list_tool_calls(&self, turn_id: Uuid) -> Result<Vec<ToolCallRecord>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, turn_id, tool_name, arg_hash, input_payload_id, output_payload_id,
                        status, started_at, ended_at, retries, error
                 FROM tool_calls WHERE turn_id = ?1 ORDER BY started_at",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([turn_id.to_string()], row_to_tool_call)
            .map_err(sql_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(sql_err)?);
        }
        Ok(out)
    }

    // ── Elicitations ──────────────────────────────────────────────────

    pub fn insert_elicitation(&self, elicitation: &Elicitation) -> Result<()> {
        self.lock()
            .execute(
                "INSERT INTO elicitations (id, conversation_id, turn_id, schema_json, message,
                                           url, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    elicitation.id.to_string(),
                    elicitation.conversation_id.to_string(),
                    elicitation.turn_id.to_string(),
                    elicitation.requested_schema.to_string(),
                    elicitation.message,
                    elicitation.url,
                    elicitation.status.as_str(),
                    elicitation.created_at.to_rfc3339(),
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn get_elicitation(&self, id: Uuid) -> Result<Option<Elicitation>> {
        self.lock()
            .query_row(
                "SELECT id, conversation_id, turn_id, schema_json, message, url, status,
                        created_at, resolved_at, payload_json, decline_reason
                 FROM elicitations WHERE id = ?1",
                [id.to_string()],
                row_to_elicitation,
            )
            .optional()
            .map_err(sql_err)
    }

    /// Resolve a pending elicitation. Resolving an already-resolved row is
    /// a no-op that returns the stored resolution (idempotent endpoint
    /// semantics).
    pub fn resolve_elicitation(
        &self,
        id: Uuid,
        outcome: &ElicitationOutcome,
    ) -> Result<Option<Elicitation>> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(sql_err)?;

        let Some(current) = tx
            .query_row(
                "SELECT id, conversation_id, turn_id, schema_json, message, url, status,
                        created_at, resolved_at, payload_json, decline_reason
                 FROM elicitations WHERE id = ?1",
                [id.to_string()],
                row_to_elicitation,
            )
            .optional()
            .map_err(sql_err)?
        else {
            return Ok(None);
        };

        if current.status.is_resolved() {
            return Ok(Some(current));
        }

        let (status, payload, reason) = match outcome {
            ElicitationOutcome::Accept { payload } => (
                ElicitationStatus::Accepted,
                Some(self.redactor.scrubbed(payload)),
                None,
            ),
            ElicitationOutcome::Decline { reason } => {
                (ElicitationStatus::Declined, None, reason.clone())
            }
            ElicitationOutcome::Timeout => (ElicitationStatus::Timeout, None, None),
        };
        let resolved_at = Utc::now();

        tx.execute(
            "UPDATE elicitations
             SET status = ?2, resolved_at = ?3, payload_json = ?4, decline_reason = ?5
             WHERE id = ?1",
            rusqlite::params![
                id.to_string(),
                status.as_str(),
                resolved_at.to_rfc3339(),
                payload.as_ref().map(|p| p.to_string()),
                reason,
            ],
        )
        .map_err(sql_err)?;
        tx.commit().map_err(sql_err)?;

        Ok(Some(Elicitation {
            status,
            resolved_at: Some(resolved_at),
            payload,
            decline_reason: reason,
            ..current
        }))
    }

    /// Pending elicitations, most recent first.
    pub fn list_pending_elicitations(&self, conversation_id: Uuid) -> Result<Vec<Elicitation>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, conversation_id, turn_id, schema_json, message, url, status,
                        created_at, resolved_at, payload_json, decline_reason
                 FROM elicitations
                 WHERE conversation_id = ?1 AND status = 'pending'
                 ORDER BY created_at DESC",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([conversation_id.to_string()], row_to_elicitation)
            .map_err(sql_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(sql_err)?);
        }
        Ok(out)
    }

    // ── Schedules ─────────────────────────────────────────────────────

    pub fn upsert_schedule(&self, schedule: &Schedule) -> Result<()> {
        let trigger_json =
            serde_json::to_string(&schedule.trigger).map_err(Error::Json)?;
        self.lock()
            .execute(
                "INSERT INTO schedules (id, name, conversation_id, agent_id, model_id, content,
                                        user_subject, trigger_json, next_due_at, lease_owner,
                                        lease_expires_at, last_status, enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name,
                     conversation_id = excluded.conversation_id,
                     agent_id = excluded.agent_id,
                     model_id = excluded.model_id,
                     content = excluded.content,
                     user_subject = excluded.user_subject,
                     trigger_json = excluded.trigger_json,
                     next_due_at = excluded.next_due_at,
                     enabled = excluded.enabled",
                rusqlite::params![
                    schedule.id.to_string(),
                    schedule.name,
                    schedule.conversation_id.map(|c| c.to_string()),
                    schedule.agent_id,
                    schedule.model_id,
                    schedule.content,
                    schedule.user_subject,
                    trigger_json,
                    schedule.next_due_at.to_rfc3339(),
                    schedule.lease_owner,
                    schedule.lease_expires_at.map(|t| t.to_rfc3339()),
                    schedule.last_status,
                    schedule.enabled as i64,
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>> {
        self.lock()
            .query_row(
                "SELECT id, name, conversation_id, agent_id, model_id, content, user_subject,
                        trigger_json, next_due_at, lease_owner, lease_expires_at, last_status,
                        enabled
                 FROM schedules WHERE id = ?1",
                [id.to_string()],
                row_to_schedule,
            )
            .optional()
            .map_err(sql_err)
    }

    pub fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, name, conversation_id, agent_id, model_id, content, user_subject,
                        trigger_json, next_due_at, lease_owner, lease_expires_at, last_status,
                        enabled
                 FROM schedules ORDER BY next_due_at",
            )
            .map_err(sql_err)?;
        let rows = stmt.query_map([], row_to_schedule).map_err(sql_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(sql_err)?);
        }
        Ok(out)
    }

    /// Claim due schedules for `owner`. Each claim is a compare-and-set on
    /// the lease columns, so two workers sharing the store can never hold
    /// the same row at once.
    pub fn claim_due_schedules(
        &self,
        owner: &str,
        lease_ttl: chrono::Duration,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Schedule>> {
        let candidate_ids: Vec<String> = {
            let conn = self.lock();
            let mut stmt = conn
                .prepare(
                    "SELECT id FROM schedules
                     WHERE enabled = 1
                       AND next_due_at <= ?1
                       AND (lease_owner IS NULL OR lease_expires_at <= ?1)
                     ORDER BY next_due_at
                     LIMIT ?2",
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(
                    rusqlite::params![now.to_rfc3339(), limit as i64],
                    |row| row.get::<_, String>(0),
                )
                .map_err(sql_err)?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row.map_err(sql_err)?);
            }
            ids
        };

        let expires = now + lease_ttl;
        let mut claimed = Vec::new();
        for id in candidate_ids {
            let changed = self
                .lock()
                .execute(
                    "UPDATE schedules SET lease_owner = ?2, lease_expires_at = ?3
                     WHERE id = ?1
                       AND enabled = 1
                       AND next_due_at <= ?4
                       AND (lease_owner IS NULL OR lease_expires_at <= ?4)",
                    rusqlite::params![id, owner, expires.to_rfc3339(), now.to_rfc3339()],
                )
                .map_err(sql_err)?;
            if changed == 1 {
                if let Some(schedule) = self.get_schedule(
                    Uuid::parse_str(&id)
                        .map_err(|e| Error::Store(format!("bad schedule id {id}: {e}")))?,
                )? {
                    claimed.push(schedule);
                }
            }
        }
        Ok(claimed)
    }

    /// Extend a held lease. Returns false when the lease was lost.
    pub fn renew_lease(
        &self,
        id: Uuid,
        owner: &str,
        lease_ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .lock()
            .execute(
                "UPDATE schedules SET lease_expires_at = ?3
                 WHERE id = ?1 AND lease_owner = ?2",
                rusqlite::params![id.to_string(), owner, (now + lease_ttl).to_rfc3339()],
            )
            .map_err(sql_err)?;
        Ok(changed == 1)
    }

    /// Record the outcome of a run, release the lease, and either advance
    /// `next_due_at` (interval trigger) or disable the row (one-shot).
    pub fn finish_schedule_run(
        &self,
        id: Uuid,
        owner: &str,
        status: &str,
        next_due_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.lock()
            .execute(
                "UPDATE schedules
                 SET lease_owner = NULL,
                     lease_expires_at = NULL,
                     last_status = ?3,
                     next_due_at = COALESCE(?4, next_due_at),
                     enabled = CASE WHEN ?4 IS NULL THEN 0 ELSE enabled END
                 WHERE id = ?1 AND lease_owner = ?2",
                rusqlite::params![
                    id.to_string(),
                    owner,
                    status,
                    next_due_at.map(|t| t.to_rfc3339()),
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn delete_schedule(&self, id: Uuid) -> Result<bool> {
        let changed = self
            .lock()
            .execute("DELETE FROM schedules WHERE id = ?1", [id.to_string()])
            .map_err(sql_err)?;
        Ok(changed == 1)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Row mapping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_time(raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn parse_uuid(raw: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_json(raw: String) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn bad_enum(what: &str, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("unknown {what}: {raw}").into(),
    )
}

fn row_to_conversation(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: parse_uuid(row.get(0)?)?,
        created_at: parse_time(row.get(1)?)?,
        parent_id: row
            .get::<_, Option<String>>(2)?
            .map(parse_uuid)
            .transpose()?,
        user_subject: row.get(3)?,
    })
}

fn row_to_turn(row: &Row<'_>) -> rusqlite::Result<Turn> {
    let status_raw: String = row.get(3)?;
    Ok(Turn {
        id: parse_uuid(row.get(0)?)?,
        conversation_id: parse_uuid(row.get(1)?)?,
        started_by: parse_uuid(row.get(2)?)?,
        status: TurnStatus::parse(&status_raw)
            .ok_or_else(|| bad_enum("turn status", &status_raw))?,
        error: row.get(4)?,
        started_at: parse_time(row.get(5)?)?,
        finished_at: row
            .get::<_, Option<String>>(6)?
            .map(parse_time)
            .transpose()?,
        agent_id: row.get(7)?,
        model_id: row.get(8)?,
        policy: row
            .get::<_, Option<String>>(9)?
            .map(parse_json)
            .transpose()?,
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let role_raw: String = row.get(4)?;
    Ok(Message {
        seq: row.get(0)?,
        id: parse_uuid(row.get(1)?)?,
        turn_id: parse_uuid(row.get(2)?)?,
        conversation_id: parse_uuid(row.get(3)?)?,
        role: MessageRole::parse(&role_raw).ok_or_else(|| bad_enum("role", &role_raw))?,
        interim: row.get::<_, i64>(5)? != 0,
        content: row.get(6)?,
        payload_id: row.get(7)?,
        tool_name: row.get(8)?,
        tool_call_id: row.get(9)?,
        elicitation_id: row
            .get::<_, Option<String>>(10)?
            .map(parse_uuid)
            .transpose()?,
        parent_id: row
            .get::<_, Option<String>>(11)?
            .map(parse_uuid)
            .transpose()?,
        created_at: parse_time(row.get(12)?)?,
    })
}

fn row_to_tool_call(row: &Row<'_>) -> rusqlite::Result<ToolCallRecord> {
    let status_raw: String = row.get(6)?;
    Ok(ToolCallRecord {
        id: parse_uuid(row.get(0)?)?,
        turn_id: parse_uuid(row.get(1)?)?,
        tool_name: row.get(2)?,
        arg_hash: row.get(3)?,
        input_payload_id: row.get(4)?,
        output_payload_id: row.get(5)?,
        status: ToolCallStatus::parse(&status_raw)
            .ok_or_else(|| bad_enum("tool call status", &status_raw))?,
        started_at: parse_time(row.get(7)?)?,
        ended_at: row
            .get::<_, Option<String>>(8)?
            .map(parse_time)
            .transpose()?,
        retries: row.get::<_, i64>(9)? as u32,
        error: row.get(10)?,
    })
}

fn row_to_elicitation(row: &Row<'_>) -> rusqlite::Result<Elicitation> {
    let status_raw: String = row.get(6)?;
    Ok(Elicitation {
        id: parse_uuid(row.get(0)?)?,
        conversation_id: parse_uuid(row.get(1)?)?,
        turn_id: parse_uuid(row.get(2)?)?,
        requested_schema: parse_json(row.get(3)?)?,
        message: row.get(4)?,
        url: row.get(5)?,
        status: ElicitationStatus::parse(&status_raw)
            .ok_or_else(|| bad_enum("elicitation status", &status_raw))?,
        created_at: parse_time(row.get(7)?)?,
        resolved_at: row
            .get::<_, Option<String>>(8)?
            .map(parse_time)
            .transpose()?,
        payload: row
            .get::<_, Option<String>>(9)?
            .map(parse_json)
            .transpose()?,
        decline_reason: row.get(10)?,
    })
}

fn row_to_schedule(row: &Row<'_>) -> rusqlite::Result<Schedule> {
    let trigger_raw: String = row.get(7)?;
    let trigger: Trigger = serde_json::from_str(&trigger_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Schedule {
        id: parse_uuid(row.get(0)?)?,
        name: row.get(1)?,
        conversation_id: row
            .get::<_, Option<String>>(2)?
            .map(parse_uuid)
            .transpose()?,
        agent_id: row.get(3)?,
        model_id: row.get(4)?,
        content: row.get(5)?,
        user_subject: row.get(6)?,
        trigger,
        next_due_at: parse_time(row.get(8)?)?,
        lease_owner: row.get(9)?,
        lease_expires_at: row
            .get::<_, Option<String>>(10)?
            .map(parse_time)
            .transpose()?,
        last_status: row.get(11)?,
        enabled: row.get::<_, i64>(12)? != 0,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> ConversationStore {
        ConversationStore::open_in_memory(Redactor::new(["api_key", "password"])).unwrap()
    }

    #[test]
    fn post_user_message_creates_queued_turn() {
        let store = store();
        let conv = store.create_conversation("alice", None).unwrap();
        let (turn, message) = store
            .post_user_message(conv.id, "hello", Some("helper"), None, None)
            .unwrap();

        assert_eq!(turn.status, TurnStatus::Queued);
        assert_eq!(turn.started_by, message.id);
        assert_eq!(message.role, MessageRole::User);
        assert_eq!(message.content.as_deref(), Some("hello"));

        let active = store.active_turn(conv.id).unwrap().unwrap();
        assert_eq!(active.id, turn.id);
    }

    #[test]
    fn second_post_while_turn_active_is_rejected() {
        let store = store();
        let conv = store.create_conversation("alice", None).unwrap();
        store
            .post_user_message(conv.id, "first", None, None, None)
            .unwrap();
        let err = store
            .post_user_message(conv.id, "second", None, None, None)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn post_after_terminal_turn_is_allowed() {
        let store = store();
        let conv = store.create_conversation("alice", None).unwrap();
        let (turn, _) = store
            .post_user_message(conv.id, "first", None, None, None)
            .unwrap();
        store
            .set_turn_status(turn.id, TurnStatus::Running, None)
            .unwrap();
        store
            .set_turn_status(turn.id, TurnStatus::Succeeded, None)
            .unwrap();
        assert!(store
            .post_user_message(conv.id, "second", None, None, None)
            .is_ok());
    }

    #[test]
    fn illegal_transition_rejected_and_row_untouched() {
        let store = store();
        let conv = store.create_conversation("alice", None).unwrap();
        let (turn, _) = store
            .post_user_message(conv.id, "hi", None, None, None)
            .unwrap();

        let err = store
            .set_turn_status(turn.id, TurnStatus::Succeeded, None)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(
            store.get_turn(turn.id).unwrap().unwrap().status,
            TurnStatus::Queued
        );
    }

    #[test]
    fn waiting_elicitation_round_trip() {
        let store = store();
        let conv = store.create_conversation("alice", None).unwrap();
        let (turn, _) = store
            .post_user_message(conv.id, "hi", None, None, None)
            .unwrap();
        store
            .set_turn_status(turn.id, TurnStatus::Running, None)
            .unwrap();
        store
            .set_turn_status(turn.id, TurnStatus::WaitingElicitation, None)
            .unwrap();
        // Still the single non-terminal turn.
        assert_eq!(store.active_turn(conv.id).unwrap().unwrap().id, turn.id);
        store
            .set_turn_status(turn.id, TurnStatus::Running, None)
            .unwrap();
        let done = store
            .set_turn_status(turn.id, TurnStatus::Succeeded, None)
            .unwrap();
        assert!(done.finished_at.is_some());
        assert!(store.active_turn(conv.id).unwrap().is_none());
    }

    #[test]
    fn interim_update_and_finalize() {
        let store = store();
        let conv = store.create_conversation("alice", None).unwrap();
        let (turn, _) = store
            .post_user_message(conv.id, "hi", None, None, None)
            .unwrap();

        let mut new = NewMessage::text(turn.id, conv.id, MessageRole::Assistant, "he");
        new.interim = true;
        let message = store.append_message(new).unwrap();

        store.update_interim(message.id, "hello").unwrap();
        store.finalize_message(message.id).unwrap();

        let stored = store.get_message(message.id).unwrap().unwrap();
        assert!(!stored.interim);
        assert_eq!(stored.content.as_deref(), Some("hello"));

        // Frozen after finalize.
        let err = store.update_interim(message.id, "hello again").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn messages_are_ordered_by_seq_and_cursor_filters() {
        let store = store();
        let conv = store.create_conversation("alice", None).unwrap();
        let (turn, first) = store
            .post_user_message(conv.id, "one", None, None, None)
            .unwrap();
        let second = store
            .append_message(NewMessage::text(
                turn.id,
                conv.id,
                MessageRole::Assistant,
                "two",
            ))
            .unwrap();

        let all = store.get_messages(conv.id, 0).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].seq < all[1].seq);

        let after = store.get_messages(conv.id, first.seq).unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, second.id);

        let none = store.get_messages(conv.id, second.seq).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn payload_round_trip_bit_for_bit() {
        let store = store();
        let bytes: Vec<u8> = (0u16..512).map(|b| (b % 251) as u8).collect();
        let id = store.write_payload(&bytes, "application/octet-stream").unwrap();

        let (meta, read) = store.read_payload(&id).unwrap().unwrap();
        assert_eq!(read, bytes);
        assert_eq!(meta.size, bytes.len() as u64);

        // Content-addressed: same bytes, same id.
        let again = store.write_payload(&bytes, "application/octet-stream").unwrap();
        assert_eq!(again, id);
    }

    #[test]
    fn policy_snapshot_is_redacted() {
        let store = store();
        let conv = store.create_conversation("alice", None).unwrap();
        let policy = json!({ "mode": "auto", "api_key": "sk-secret-value" });
        let (turn, _) = store
            .post_user_message(conv.id, "hi", None, None, Some(&policy))
            .unwrap();

        let stored = store.get_turn(turn.id).unwrap().unwrap();
        let text = stored.policy.unwrap().to_string();
        assert!(!text.contains("sk-secret-value"));
        assert!(text.contains("auto"));
    }

    #[test]
    fn elicitation_resolution_is_idempotent() {
        let store = store();
        let conv = store.create_conversation("alice", None).unwrap();
        let (turn, _) = store
            .post_user_message(conv.id, "hi", None, None, None)
            .unwrap();

        let elicitation = Elicitation {
            id: Uuid::new_v4(),
            conversation_id: conv.id,
            turn_id: turn.id,
            requested_schema: json!({"type": "object", "properties": {"city": {"type": "string"}}, "required": ["city"]}),
            message: Some("Which city?".into()),
            url: None,
            status: ElicitationStatus::Pending,
            created_at: Utc::now(),
            resolved_at: None,
            payload: None,
            decline_reason: None,
        };
        store.insert_elicitation(&elicitation).unwrap();

        let pending = store.list_pending_elicitations(conv.id).unwrap();
        assert_eq!(pending.len(), 1);

        let accepted = store
            .resolve_elicitation(
                elicitation.id,
                &ElicitationOutcome::Accept {
                    payload: json!({"city": "Paris"}),
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(accepted.status, ElicitationStatus::Accepted);

        // Second resolve, different action: the stored resolution wins.
        let replay = store
            .resolve_elicitation(
                elicitation.id,
                &ElicitationOutcome::Decline { reason: None },
            )
            .unwrap()
            .unwrap();
        assert_eq!(replay.status, ElicitationStatus::Accepted);
        assert_eq!(replay.payload.unwrap()["city"], "Paris");

        assert!(store.list_pending_elicitations(conv.id).unwrap().is_empty());
    }

    #[test]
    fn schedule_lease_is_exclusive() {
        let store = store();
        let now = Utc::now();
        let schedule = Schedule {
            id: Uuid::new_v4(),
            name: "daily-digest".into(),
            conversation_id: None,
            agent_id: None,
            model_id: None,
            content: "summarize the day".into(),
            user_subject: "alice".into(),
            trigger: Trigger::Every { interval_sec: 3600 },
            next_due_at: now - chrono::Duration::seconds(5),
            lease_owner: None,
            lease_expires_at: None,
            last_status: None,
            enabled: true,
        };
        store.upsert_schedule(&schedule).unwrap();

        let ttl = chrono::Duration::seconds(60);
        let first = store.claim_due_schedules("worker-a", ttl, now, 10).unwrap();
        assert_eq!(first.len(), 1);

        // Second worker sees lease contention.
        let second = store.claim_due_schedules("worker-b", ttl, now, 10).unwrap();
        assert!(second.is_empty());

        // After expiry the row can be retaken.
        let later = now + chrono::Duration::seconds(120);
        let retaken = store
            .claim_due_schedules("worker-b", ttl, later, 10)
            .unwrap();
        assert_eq!(retaken.len(), 1);
        assert_eq!(retaken[0].lease_owner.as_deref(), Some("worker-b"));
    }

    #[test]
    fn renew_and_finish_schedule_run() {
        let store = store();
        let now = Utc::now();
        let id = Uuid::new_v4();
        let schedule = Schedule {
            id,
            name: "once".into(),
            conversation_id: None,
            agent_id: None,
            model_id: None,
            content: "ping".into(),
            user_subject: "alice".into(),
            trigger: Trigger::At { at: now },
            next_due_at: now,
            lease_owner: None,
            lease_expires_at: None,
            last_status: None,
            enabled: true,
        };
        store.upsert_schedule(&schedule).unwrap();

        let ttl = chrono::Duration::seconds(60);
        let claimed = store.claim_due_schedules("w1", ttl, now, 10).unwrap();
        assert_eq!(claimed.len(), 1);

        assert!(store.renew_lease(id, "w1", ttl, now).unwrap());
        assert!(!store.renew_lease(id, "w2", ttl, now).unwrap());

        // One-shot: no next due time disables the schedule.
        store.finish_schedule_run(id, "w1", "succeeded", None).unwrap();
        let row = store.get_schedule(id).unwrap().unwrap();
        assert!(!row.enabled);
        assert!(row.lease_owner.is_none());
        assert_eq!(row.last_status.as_deref(), Some("succeeded"));
    }
}
