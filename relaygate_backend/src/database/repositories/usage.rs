use crate::database::models::UsageRecord;
use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};

pub(super) struct SqliteUsageRepository<'conn> {
    pub(super) conn: &'conn Connection,
}

impl<'conn> super::UsageRepository for SqliteUsageRepository<'conn> {
    fn record_writes(&self, day: &str, writes: i64) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO kv_usage (day, writes)
            VALUES (?1, ?2)
            ON CONFLICT(day) DO UPDATE SET writes = writes + excluded.writes
            "#,
            params![day, writes],
        )?;
        let total = self.conn.query_row(
            "SELECT writes FROM kv_usage WHERE day = ?1",
            params![day],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    fn get(&self, day: &str) -> Result<Option<UsageRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT day, writes FROM kv_usage WHERE day = ?1",
                params![day],
                |row| {
                    Ok(UsageRecord {
                        day: row.get(0)?,
                        writes: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }
}
