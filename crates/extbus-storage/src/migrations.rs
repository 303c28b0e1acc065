//! Schema migrations
//!
//! The schema version lives in SQLite's `user_version` pragma. Each step
//! runs in its own transaction and bumps the version when it commits.

use rusqlite::Connection;

use crate::Result;

type Step = fn(&Connection) -> rusqlite::Result<()>;

/// Ordered migration steps; step `i` takes the schema to version `i + 1`
const STEPS: &[(&str, Step)] = &[
    ("extension storage table", create_extension_storage),
    ("per-area lookup index", index_by_area),
    ("session-scoped keys", scope_by_session),
];

pub fn schema_version(conn: &Connection) -> Result<u32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let current = schema_version(conn)? as usize;

    for (index, (label, step)) in STEPS.iter().enumerate().skip(current) {
        let version = index + 1;
        tracing::info!(version, migration = *label, "Applying storage migration");

        let tx = conn.transaction()?;
        step(&tx)?;
        tx.pragma_update(None, "user_version", version as u32)?;
        tx.commit()?;
    }

    Ok(())
}

fn create_extension_storage(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS extension_storage (
            extension_id TEXT NOT NULL,
            area TEXT NOT NULL,
            key TEXT NOT NULL,
            value BLOB NOT NULL,
            position INTEGER NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (extension_id, area, key)
        );
    "#,
    )
}

fn index_by_area(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_extension_storage_area
            ON extension_storage(extension_id, area, position);",
    )
}

/// Rebuild the table with `session_id` in the primary key. Rows written
/// before sessions were tracked land in session 0.
fn scope_by_session(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE extension_storage_scoped (
            session_id INTEGER NOT NULL,
            extension_id TEXT NOT NULL,
            area TEXT NOT NULL,
            key TEXT NOT NULL,
            value BLOB NOT NULL,
            position INTEGER NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (session_id, extension_id, area, key)
        );

        INSERT INTO extension_storage_scoped
            (session_id, extension_id, area, key, value, position, updated_at)
        SELECT 0, extension_id, area, key, value, position, updated_at
        FROM extension_storage;

        DROP INDEX IF EXISTS idx_extension_storage_area;
        DROP TABLE extension_storage;
        ALTER TABLE extension_storage_scoped RENAME TO extension_storage;

        CREATE INDEX idx_extension_storage_scope
            ON extension_storage(session_id, extension_id, area, position);
    "#,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(schema_version(&conn).unwrap(), 0);

        run_migrations(&mut conn).unwrap();
        run_migrations(&mut conn).unwrap();

        assert_eq!(schema_version(&conn).unwrap() as usize, STEPS.len());
    }

    #[test]
    fn test_resumes_from_partial_schema() {
        let mut conn = Connection::open_in_memory().unwrap();
        create_extension_storage(&conn).unwrap();
        conn.execute(
            "INSERT INTO extension_storage (extension_id, area, key, value, position, updated_at)
             VALUES ('ext-a', 'local', 'k', x'31', 1, '')",
            [],
        )
        .unwrap();
        conn.pragma_update(None, "user_version", 1u32).unwrap();

        run_migrations(&mut conn).unwrap();

        let index_count = |name: &str| -> i64 {
            conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = ?1",
                [name],
                |row| row.get(0),
            )
            .unwrap()
        };
        assert_eq!(index_count("idx_extension_storage_scope"), 1);
        assert_eq!(index_count("idx_extension_storage_area"), 0);

        let session: u32 = conn
            .query_row(
                "SELECT session_id FROM extension_storage WHERE extension_id = 'ext-a' AND key = 'k'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(session, 0);
    }
}
