use crate::database::models::KvEntry;
use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};

pub(super) struct SqliteKvRepository<'conn> {
    pub(super) conn: &'conn Connection,
}

impl<'conn> super::KvRepository for SqliteKvRepository<'conn> {
    fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        let entry = self
            .conn
            .query_row(
                r#"
                SELECT key, value, expires_at
                FROM kv
                WHERE key = ?1
                "#,
                params![key],
                |row| {
                    Ok(KvEntry {
                        key: row.get(0)?,
                        value: row.get(1)?,
                        expires_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    fn put(&self, entry: &KvEntry) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO kv (key, value, expires_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at
            "#,
            params![entry.key, entry.value, entry.expires_at],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(removed > 0)
    }

    fn list_prefix(&self, prefix: &str, now: i64, limit: usize) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT key
            FROM kv
            WHERE substr(key, 1, length(?1)) = ?1
              AND (expires_at IS NULL OR expires_at > ?2)
            ORDER BY key
            LIMIT ?3
            "#,
        )?;
        let rows = stmt.query_map(params![prefix, now, limit as i64], |row| {
            row.get::<_, String>(0)
        })?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    fn purge_expired(&self, now: i64) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now],
        )?;
        Ok(removed)
    }
}
