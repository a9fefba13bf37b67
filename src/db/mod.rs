pub mod models;

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use std::path::Path;

use crate::error::AppResult;
use crate::state::DbPool;

pub const SQL_DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// Render a timestamp in the same format SQLite's datetime('now') uses, so
/// stored values compare correctly against SQL-side expressions.
pub fn format_ts(dt: DateTime<Utc>) -> String {
    dt.format(SQL_DATETIME_FMT).to_string()
}

pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    chrono::NaiveDateTime::parse_from_str(s, SQL_DATETIME_FMT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Run `f` inside a write transaction. BEGIN IMMEDIATE takes the write lock
/// up front, so every read-decide-write sequence inside has one winner.
pub fn with_tx<T>(conn: &rusqlite::Connection, f: impl FnOnce() -> AppResult<T>) -> AppResult<T> {
    conn.execute("BEGIN IMMEDIATE", [])?;
    match f() {
        Ok(value) => {
            conn.execute("COMMIT", [])?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute("ROLLBACK", []);
            Err(e)
        }
    }
}

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "001_initial",
        include_str!("../../migrations/001_initial.sql"),
    ),
    ("002_groups", include_str!("../../migrations/002_groups.sql")),
    (
        "003_daily_activity",
        include_str!("../../migrations/003_daily_activity.sql"),
    ),
    (
        "004_challenges",
        include_str!("../../migrations/004_challenges.sql"),
    ),
];

pub fn create_pool(db_path: &Path) -> anyhow::Result<DbPool> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // foreign_keys and busy_timeout are per-connection settings
    let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            ",
        )
    });
    let pool = Pool::builder().max_size(8).build(manager)?;

    let conn = pool.get()?;
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        ",
    )?;

    Ok(pool)
}

/// Single-connection in-memory pool for tests.
pub fn create_memory_pool() -> anyhow::Result<DbPool> {
    let manager = SqliteConnectionManager::memory();
    let pool = Pool::builder().max_size(1).build(manager)?;
    let conn = pool.get()?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(pool)
}

pub fn run_migrations(pool: &DbPool) -> anyhow::Result<()> {
    let conn = pool.get()?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            name TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    for (name, sql) in MIGRATIONS {
        let already_applied: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM schema_version WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;

        if !already_applied {
            tracing::info!("Applying migration: {}", name);
            conn.execute_batch(sql)?;
            conn.execute(
                "INSERT INTO schema_version (name) VALUES (?1)",
                params![name],
            )?;
        }
    }

    tracing::info!("Database migrations complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool() -> DbPool {
        create_memory_pool().unwrap()
    }

    #[test]
    fn create_pool_creates_db_file() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("sub/dir/test.db");
        let pool = create_pool(&db_path).unwrap();
        assert!(db_path.exists());
        let conn = pool.get().unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode, "wal");
    }

    #[test]
    fn migrations_run_successfully() {
        let pool = test_pool();
        run_migrations(&pool).unwrap();

        let conn = pool.get().unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 4);

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .filter_map(|r| r.ok())
                .collect()
        };
        assert!(tables.contains(&"users".to_string()));
        assert!(tables.contains(&"follows".to_string()));
        assert!(tables.contains(&"groups".to_string()));
        assert!(tables.contains(&"weekly_submissions".to_string()));
        assert!(tables.contains(&"group_reveals".to_string()));
        assert!(tables.contains(&"daily_activities".to_string()));
        assert!(tables.contains(&"challenges".to_string()));
        assert!(tables.contains(&"challenge_votes".to_string()));
    }

    #[test]
    fn migrations_are_idempotent() {
        let pool = test_pool();
        run_migrations(&pool).unwrap();
        run_migrations(&pool).unwrap(); // Should not error on second run

        let conn = pool.get().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 4);
    }

    #[test]
    fn invite_codes_are_unique_by_constraint() {
        let pool = test_pool();
        run_migrations(&pool).unwrap();

        let conn = pool.get().unwrap();
        conn.execute(
            "INSERT INTO users (id, username, email, password_hash, full_name, avatar_color)
             VALUES ('u1', 'alice', 'a@x.io', 'h', 'Alice', '#FF6B6B')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO groups (id, name, created_by, admin_id, invite_code)
             VALUES ('g1', 'One', 'u1', 'u1', 'ABC123')",
            [],
        )
        .unwrap();
        let duplicate = conn.execute(
            "INSERT INTO groups (id, name, created_by, admin_id, invite_code)
             VALUES ('g2', 'Two', 'u1', 'u1', 'ABC123')",
            [],
        );
        assert!(duplicate.is_err());
    }

    #[test]
    fn timestamps_round_trip_in_sqlite_format() {
        let now = chrono::Utc::now();
        let rendered = format_ts(now);
        let parsed = parse_ts(&rendered).unwrap();
        assert_eq!(format_ts(parsed), rendered);
        assert!(parse_ts("not a timestamp").is_none());
    }

    #[test]
    fn with_tx_rolls_back_on_error() {
        let pool = test_pool();
        run_migrations(&pool).unwrap();
        let conn = pool.get().unwrap();

        let result: crate::error::AppResult<()> = with_tx(&conn, || {
            conn.execute(
                "INSERT INTO users (id, username, email, password_hash, full_name, avatar_color)
                 VALUES ('u1', 'alice', 'a@x.io', 'h', 'Alice', '#FF6B6B')",
                [],
            )?;
            Err(crate::error::AppError::Conflict("abort".into()))
        });
        assert!(result.is_err());

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn foreign_keys_enforced() {
        let pool = test_pool();
        run_migrations(&pool).unwrap();

        let conn = pool.get().unwrap();
        let result = conn.execute(
            "INSERT INTO notifications (id, user_id, kind, title, message)
             VALUES ('n1', 'nonexistent-user', 'welcome', 'Hi', 'Hello')",
            [],
        );
        assert!(result.is_err());
    }
}
