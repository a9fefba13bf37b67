use rusqlite::{params, Connection};
use serde_json::Value;

/// Best-effort notification sink. Failures are logged and swallowed; no
/// caller depends on delivery.
pub fn notify(conn: &Connection, user_id: &str, kind: &str, title: &str, message: &str, data: Value) {
    let result = conn.execute(
        "INSERT INTO notifications (id, user_id, kind, title, message, data)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            uuid::Uuid::now_v7().to_string(),
            user_id,
            kind,
            title,
            message,
            data.to_string()
        ],
    );

    if let Err(e) = result {
        tracing::warn!("Failed to deliver notification to {}: {}", user_id, e);
    }
}

/// Notify every listed user with the same payload, one insert per row.
pub fn notify_many(
    conn: &Connection,
    user_ids: &[String],
    kind: &str,
    title: &str,
    message: &str,
    data: Value,
) {
    for user_id in user_ids {
        notify(conn, user_id, kind, title, message, data.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn notify_persists_a_row() {
        let pool = db::create_memory_pool().unwrap();
        db::run_migrations(&pool).unwrap();
        let conn = pool.get().unwrap();
        conn.execute(
            "INSERT INTO users (id, username, email, password_hash, full_name, avatar_color)
             VALUES ('u1', 'alice', 'a@x.io', 'h', 'Alice', '#FF6B6B')",
            [],
        )
        .unwrap();

        notify(
            &conn,
            "u1",
            "welcome",
            "Welcome!",
            "Hey Alice!",
            serde_json::json!({}),
        );

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM notifications WHERE user_id = 'u1' AND kind = 'welcome'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn notify_swallows_failures() {
        let pool = db::create_memory_pool().unwrap();
        db::run_migrations(&pool).unwrap();
        let conn = pool.get().unwrap();

        // Unknown user violates the foreign key; the sink must not panic.
        notify(
            &conn,
            "missing",
            "welcome",
            "Welcome!",
            "Hello",
            serde_json::json!({}),
        );

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM notifications", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn notify_many_fans_out() {
        let pool = db::create_memory_pool().unwrap();
        db::run_migrations(&pool).unwrap();
        let conn = pool.get().unwrap();
        for name in ["alice", "bob"] {
            conn.execute(
                "INSERT INTO users (id, username, email, password_hash, full_name, avatar_color)
                 VALUES (?1, ?1, ?1 || '@x.io', 'h', ?1, '#FF6B6B')",
                params![name],
            )
            .unwrap();
        }

        notify_many(
            &conn,
            &["alice".to_string(), "bob".to_string()],
            "drop",
            "News",
            "Something happened",
            serde_json::json!({}),
        );

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM notifications", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }
}
