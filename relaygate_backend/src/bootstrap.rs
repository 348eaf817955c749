use crate::config::RelayConfig;
use crate::database::repositories::{KvRepository, UsageRepository};
use crate::database::Database;
use crate::utils::now_unix;
use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;

pub struct BootstrapResources {
    pub directories_created: Vec<String>,
    pub database_initialized: bool,
    /// Expired entries dropped at startup.
    pub purged_entries: usize,
    /// Store writes already charged against today's quota.
    pub writes_today: i64,
    pub database: Database,
}

pub async fn initialize(config: &RelayConfig) -> Result<BootstrapResources> {
    let mut directories_created = Vec::new();
    create_dir_if_missing(&config.paths.data_dir, &mut directories_created)?;
    create_dir_if_missing(&config.paths.logs_dir, &mut directories_created)?;

    let database = Database::connect(&config.paths)
        .with_context(|| format!("failed to open {}", config.paths.db_path.display()))?;
    let database_initialized = database.ensure_migrations()?;

    let day = Utc::now().format("%Y-%m-%d").to_string();
    let (purged_entries, writes_today) = database.with_repositories(|repos| {
        let purged = repos.kv().purge_expired(now_unix())?;
        let usage = repos.usage().get(&day)?;
        Ok((purged, usage.map_or(0, |record| record.writes)))
    })?;

    Ok(BootstrapResources {
        directories_created,
        database_initialized,
        purged_entries,
        writes_today,
        database,
    })
}

fn create_dir_if_missing(path: &std::path::Path, created: &mut Vec<String>) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
        created.push(path.display().to_string());
    }
    Ok(())
}
