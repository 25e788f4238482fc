use rusqlite::Connection;

use crate::error::Result;

pub fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Key/value entries (history cursors, synced threads)
        CREATE TABLE IF NOT EXISTS kv_entries (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );

        -- Short-lived mutual exclusion markers
        CREATE TABLE IF NOT EXISTS locks (
            key TEXT PRIMARY KEY,
            token TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            queue TEXT NOT NULL,
            name TEXT NOT NULL,
            data TEXT NOT NULL,
            options TEXT NOT NULL,
            status TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            attempts_made INTEGER NOT NULL DEFAULT 0,
            stalled_count INTEGER NOT NULL DEFAULT 0,
            run_at INTEGER NOT NULL,
            locked_until INTEGER,
            worker_id TEXT,
            last_error TEXT,
            return_value TEXT,
            repeat_key TEXT,
            created_at INTEGER NOT NULL,
            processed_at INTEGER,
            finished_at INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_claim
            ON jobs(queue, status, priority DESC, run_at);
        CREATE INDEX IF NOT EXISTS idx_jobs_lease
            ON jobs(status, locked_until);
        CREATE INDEX IF NOT EXISTS idx_jobs_repeat
            ON jobs(repeat_key);

        CREATE TABLE IF NOT EXISTS repeatable_jobs (
            key TEXT PRIMARY KEY,
            queue TEXT NOT NULL,
            name TEXT NOT NULL,
            data TEXT NOT NULL,
            options TEXT NOT NULL,
            cron TEXT NOT NULL,
            timezone TEXT,
            start_at INTEGER,
            end_at INTEGER,
            limit_count INTEGER,
            run_count INTEGER NOT NULL DEFAULT 0,
            next_run_at INTEGER,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS connections (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            email TEXT NOT NULL,
            provider TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1
        );

        CREATE INDEX IF NOT EXISTS idx_connections_email
            ON connections(email COLLATE NOCASE);

        -- Full workflow JSON lives in `definition`; the other columns are
        -- copies used for lookups
        CREATE TABLE IF NOT EXISTS workflows (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            connection_id TEXT,
            name TEXT NOT NULL,
            definition TEXT NOT NULL,
            is_enabled INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_workflows_enabled
            ON workflows(user_id, is_enabled);

        CREATE TABLE IF NOT EXISTS workflow_executions (
            id TEXT PRIMARY KEY,
            workflow_id TEXT NOT NULL,
            thread_id TEXT NOT NULL,
            connection_id TEXT NOT NULL,
            status TEXT NOT NULL,
            trigger_data TEXT NOT NULL,
            node_results TEXT NOT NULL DEFAULT '{}',
            error TEXT,
            dedupe_key TEXT NOT NULL UNIQUE,
            started_at INTEGER NOT NULL,
            completed_at INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_executions_started
            ON workflow_executions(started_at);

        CREATE TABLE IF NOT EXISTS scheduled_emails (
            id TEXT PRIMARY KEY,
            connection_id TEXT NOT NULL,
            email TEXT NOT NULL,
            send_at INTEGER NOT NULL,
            status TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_scheduled_emails_due
            ON scheduled_emails(status, send_at);
        "#,
    )?;

    Ok(())
}
