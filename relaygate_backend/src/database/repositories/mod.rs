mod kv;
mod usage;

use super::models::{KvEntry, UsageRecord};
use anyhow::Result;
use rusqlite::Connection;

pub trait KvRepository {
    fn get(&self, key: &str) -> Result<Option<KvEntry>>;
    fn put(&self, entry: &KvEntry) -> Result<()>;
    fn delete(&self, key: &str) -> Result<bool>;
    /// Live keys starting with `prefix`, in key order, at most `limit`.
    fn list_prefix(&self, prefix: &str, now: i64, limit: usize) -> Result<Vec<String>>;
    fn purge_expired(&self, now: i64) -> Result<usize>;
}

pub trait UsageRepository {
    /// Adds `writes` to the counter for `day` and returns the new total.
    fn record_writes(&self, day: &str, writes: i64) -> Result<i64>;
    fn get(&self, day: &str) -> Result<Option<UsageRecord>>;
}

pub struct SqliteRepositories<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteRepositories<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    pub fn kv(&self) -> impl KvRepository + '_ {
        kv::SqliteKvRepository { conn: self.conn }
    }

    pub fn usage(&self) -> impl UsageRepository + '_ {
        usage::SqliteUsageRepository { conn: self.conn }
    }
}
