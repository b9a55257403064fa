//! Versioned schema migrations.
//!
//! Applied migrations are recorded in `_migrations`; [`run`] applies the
//! pending tail in order inside one transaction per migration.

use rusqlite::Connection;

use agently_domain::error::{Error, Result};

/// A single schema migration.
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

/// The conversation-store schema.
pub static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial",
    sql: r#"
CREATE TABLE conversations (
    id           TEXT PRIMARY KEY,
    created_at   TEXT NOT NULL,
    parent_id    TEXT,
    user_subject TEXT NOT NULL
);

CREATE TABLE turns (
    id              TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id),
    started_by      TEXT NOT NULL,
    status          TEXT NOT NULL,
    error           TEXT,
    started_at      TEXT NOT NULL,
    finished_at     TEXT,
    agent_id        TEXT,
    model_id        TEXT,
    policy_json     TEXT
);
CREATE INDEX idx_turns_conversation ON turns(conversation_id);

CREATE TABLE messages (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
    id              TEXT NOT NULL UNIQUE,
    turn_id         TEXT NOT NULL REFERENCES turns(id),
    conversation_id TEXT NOT NULL REFERENCES conversations(id),
    role            TEXT NOT NULL,
    interim         INTEGER NOT NULL DEFAULT 0,
    content         TEXT,
    payload_id      TEXT,
    tool_name       TEXT,
    tool_call_id    TEXT,
    elicitation_id  TEXT,
    parent_id       TEXT,
    created_at      TEXT NOT NULL
);
CREATE INDEX idx_messages_conversation ON messages(conversation_id, seq);

CREATE TABLE payloads (
    id          TEXT PRIMARY KEY,
    media_type  TEXT NOT NULL,
    size        INTEGER NOT NULL,
    storage_uri TEXT,
    bytes       BLOB
);

CREATE TABLE tool_calls (
    id                TEXT PRIMARY KEY,
    turn_id           TEXT NOT NULL REFERENCES turns(id),
    tool_name         TEXT NOT NULL,
    arg_hash          TEXT NOT NULL,
    input_payload_id  TEXT,
    output_payload_id TEXT,
    status            TEXT NOT NULL,
    started_at        TEXT NOT NULL,
    ended_at          TEXT,
    retries           INTEGER NOT NULL DEFAULT 0,
    error             TEXT
);
CREATE INDEX idx_tool_calls_turn ON tool_calls(turn_id);

CREATE TABLE elicitations (
    id              TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id),
    turn_id         TEXT NOT NULL REFERENCES turns(id),
    schema_json     TEXT NOT NULL,
    message         TEXT,
    url             TEXT,
    status          TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    resolved_at     TEXT,
    payload_json    TEXT,
    decline_reason  TEXT
);
CREATE INDEX idx_elicitations_conversation ON elicitations(conversation_id, created_at);

CREATE TABLE schedules (
    id               TEXT PRIMARY KEY,
    name             TEXT NOT NULL,
    conversation_id  TEXT,
    agent_id         TEXT,
    model_id         TEXT,
    content          TEXT NOT NULL,
    user_subject     TEXT NOT NULL,
    trigger_json     TEXT NOT NULL,
    next_due_at      TEXT NOT NULL,
    lease_owner      TEXT,
    lease_expires_at TEXT,
    last_status      TEXT,
    enabled          INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX idx_schedules_due ON schedules(enabled, next_due_at);
"#,
}];

/// Apply all pending migrations.
pub fn run(conn: &mut Connection, migrations: &[Migration]) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version    INTEGER PRIMARY KEY,
            name       TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
        [],
    )
    .map_err(sql_err)?;

    let current: i64 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM _migrations", [], |row| {
            row.get(0)
        })
        .map_err(sql_err)?;

    for migration in migrations.iter().filter(|m| m.version > current) {
        let tx = conn.transaction().map_err(sql_err)?;
        tx.execute_batch(migration.sql).map_err(sql_err)?;
        tx.execute(
            "INSERT INTO _migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![
                migration.version,
                migration.name,
                chrono::Utc::now().to_rfc3339()
            ],
        )
        .map_err(sql_err)?;
        tx.commit().map_err(sql_err)?;
        tracing::info!(version = migration.version, name = migration.name, "migration applied");
    }

    Ok(())
}

pub(crate) fn sql_err(e: rusqlite::Error) -> Error {
    Error::Store(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn, MIGRATIONS).unwrap();
        run(&mut conn, MIGRATIONS).unwrap();

        let applied: i64 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(applied, MIGRATIONS.len() as i64);
    }

    #[test]
    fn schema_tables_exist() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn, MIGRATIONS).unwrap();

        for table in [
            "conversations",
            "turns",
            "messages",
            "payloads",
            "tool_calls",
            "elicitations",
            "schedules",
        ] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }
}
