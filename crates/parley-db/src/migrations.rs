use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (messages + presence)");
        conn.execute_batch(
            "
            CREATE TABLE messages (
                id              TEXT PRIMARY KEY,
                group_id        TEXT NOT NULL,
                author_id       TEXT NOT NULL,
                author_name     TEXT NOT NULL,
                author_avatar   TEXT,
                kind            TEXT NOT NULL,
                body            TEXT NOT NULL,
                attachment      TEXT,
                created_at      INTEGER NOT NULL,
                edited_at       INTEGER,
                reply_to_id     TEXT,
                reactions       TEXT NOT NULL DEFAULT '{}',
                deleted         INTEGER NOT NULL DEFAULT 0,
                deleted_at      INTEGER,
                version         INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX idx_messages_group
                ON messages(group_id, created_at);

            CREATE TABLE presence (
                group_id        TEXT NOT NULL,
                user_id         TEXT NOT NULL,
                display_name    TEXT NOT NULL,
                last_signal_at  INTEGER NOT NULL,
                PRIMARY KEY (group_id, user_id)
            );

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
