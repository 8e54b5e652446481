use rusqlite::Connection;

use crate::error::StoreResult;

type MigrationFn = fn(&Connection) -> rusqlite::Result<()>;

struct Migration {
    version: i64,
    description: &'static str,
    apply: MigrationFn,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Core project state: features, epics, stories, runs, ceremonies",
        apply: migrate_core_tables,
    },
    Migration {
        version: 2,
        description: "Message threading with counter-maintenance triggers",
        apply: migrate_threading,
    },
];

pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

/// Apply all pending migrations. Each migration is check-then-apply so a
/// second run over the same database is a no-op.
pub(crate) fn run_migrations(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now')),
            description TEXT NOT NULL
        )",
        [],
    )?;

    for migration in MIGRATIONS {
        let applied: bool = conn
            .query_row(
                "SELECT 1 FROM schema_version WHERE version = ?1",
                [migration.version],
                |_| Ok(()),
            )
            .map(|_| true)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(false),
                other => Err(other),
            })?;
        if applied {
            continue;
        }

        conn.execute_batch("BEGIN")?;
        match (migration.apply)(conn).and_then(|_| {
            conn.execute(
                "INSERT INTO schema_version (version, description) VALUES (?1, ?2)",
                rusqlite::params![migration.version, migration.description],
            )
            .map(|_| ())
        }) {
            Ok(()) => {
                conn.execute_batch("COMMIT")?;
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "migration applied"
                );
            }
            Err(err) => {
                let _ = conn.execute_batch("ROLLBACK");
                tracing::error!(version = migration.version, error = %err, "migration failed");
                return Err(err.into());
            }
        }
    }

    Ok(())
}

pub fn applied_versions(conn: &Connection) -> StoreResult<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT version FROM schema_version ORDER BY version")?;
    let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn migrate_core_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS features (
            name TEXT PRIMARY KEY,
            description TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS epics (
            epic_num INTEGER PRIMARY KEY CHECK(epic_num >= 1),
            title TEXT NOT NULL,
            feature TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'planned'
                CHECK(status IN ('planned', 'in_progress', 'done')),
            total_points INTEGER NOT NULL DEFAULT 0,
            completed_points INTEGER NOT NULL DEFAULT 0
                CHECK(completed_points <= total_points),
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS stories (
            epic_num INTEGER NOT NULL REFERENCES epics(epic_num),
            story_num INTEGER NOT NULL,
            title TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK(status IN ('pending', 'in_progress', 'in_review', 'done')),
            owner TEXT,
            points INTEGER NOT NULL DEFAULT 0,
            priority INTEGER NOT NULL DEFAULT 0,
            rework_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (epic_num, story_num)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS workflow_runs (
            workflow_id TEXT PRIMARY KEY,
            workflow_name TEXT NOT NULL,
            epic_num INTEGER REFERENCES epics(epic_num),
            story_num INTEGER,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK(status IN ('pending', 'running', 'completed', 'failed', 'cancelled')),
            started_at TEXT NOT NULL,
            completed_at TEXT,
            duration_ms INTEGER,
            output JSON NOT NULL DEFAULT '{}',
            error_message TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_workflow_runs_name ON workflow_runs(workflow_name)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_workflow_runs_epic ON workflow_runs(epic_num, story_num)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS ceremonies (
            id TEXT PRIMARY KEY,
            ceremony_type TEXT NOT NULL
                CHECK(ceremony_type IN ('planning', 'standup', 'retrospective')),
            epic_num INTEGER NOT NULL REFERENCES epics(epic_num),
            story_num INTEGER,
            transcript_path TEXT NOT NULL,
            action_items JSON NOT NULL DEFAULT '[]',
            learnings JSON NOT NULL DEFAULT '[]',
            participants JSON NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_ceremonies_epic ON ceremonies(epic_num, ceremony_type)",
        [],
    )?;

    // Safety tracking so a trigger that already fired is never re-fired.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS ceremony_executions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            epic_num INTEGER NOT NULL,
            ceremony_type TEXT NOT NULL
                CHECK(ceremony_type IN ('planning', 'standup', 'retrospective')),
            success INTEGER NOT NULL,
            executed_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_ceremony_executions_epic
            ON ceremony_executions(epic_num, ceremony_type)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS artifacts (
            id TEXT PRIMARY KEY,
            path TEXT NOT NULL,
            doc_type TEXT NOT NULL,
            workflow_name TEXT NOT NULL,
            epic_num INTEGER NOT NULL,
            story_num INTEGER NOT NULL,
            agent TEXT NOT NULL,
            phase TEXT NOT NULL,
            variables JSON NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_artifacts_workflow ON artifacts(workflow_name)",
        [],
    )?;

    Ok(())
}

fn migrate_threading(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS threads (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            parent_message_id TEXT NOT NULL UNIQUE,
            conversation_id TEXT NOT NULL,
            conversation_type TEXT NOT NULL CHECK(conversation_type IN ('dm', 'channel')),
            reply_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            conversation_type TEXT NOT NULL CHECK(conversation_type IN ('dm', 'channel')),
            content TEXT NOT NULL,
            role TEXT NOT NULL CHECK(role IN ('user', 'agent')),
            agent_id TEXT,
            thread_id INTEGER REFERENCES threads(id) ON DELETE CASCADE,
            reply_to_message_id TEXT,
            thread_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_threads_parent_message ON threads(parent_message_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, conversation_type)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id)",
        [],
    )?;

    // A reply landing in a thread bumps the thread's reply_count.
    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS increment_thread_reply_count
            AFTER INSERT ON messages
            FOR EACH ROW
            WHEN NEW.thread_id IS NOT NULL
            BEGIN
                UPDATE threads
                SET reply_count = reply_count + 1,
                    updated_at = datetime('now')
                WHERE id = NEW.thread_id;
            END",
        [],
    )?;

    // reply_count changes flow back onto the parent message's thread_count.
    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS update_parent_thread_count
            AFTER UPDATE ON threads
            FOR EACH ROW
            WHEN NEW.reply_count != OLD.reply_count
            BEGIN
                UPDATE messages
                SET thread_count = NEW.reply_count,
                    updated_at = datetime('now')
                WHERE id = NEW.parent_message_id;
            END",
        [],
    )?;

    Ok(())
}
