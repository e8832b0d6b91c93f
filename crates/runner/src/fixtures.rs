//! Fixture setup: brings the upload directory and the store into the state a
//! scenario expects before its request is sent.
//!
//! Phases run strictly in order (storage reset, table purge, row seeding,
//! upload seeding) and the first failure aborts the scenario. Work inside a
//! phase runs concurrently.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::try_join_all;
use restament_common::{Row, Store};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{RestamentError, RunResult};
use crate::scenario::Scenario;

pub struct FixtureManager {
    store: Option<Arc<dyn Store>>,
    upload_dir: Option<PathBuf>,
}

impl FixtureManager {
    pub fn new(store: Option<Arc<dyn Store>>, upload_dir: Option<PathBuf>) -> Self {
        Self { store, upload_dir }
    }

    /// Empty the upload directory and purge every table the scenario references
    pub async fn reset(&self, scenario: &Scenario) -> RunResult<()> {
        self.reset_storage().await?;
        self.purge_tables(&scenario.table_names()).await?;
        Ok(())
    }

    /// Seed mock rows, then copy mock uploads
    pub async fn seed(&self, scenario: &Scenario) -> RunResult<()> {
        self.seed_rows(scenario).await?;
        self.seed_uploads(scenario).await?;
        Ok(())
    }

    /// Recursively empty the upload directory, creating it if needed
    pub async fn reset_storage(&self) -> RunResult<()> {
        let Some(dir) = &self.upload_dir else {
            debug!("No upload directory configured; skipping storage reset");
            return Ok(());
        };
        empty_dir(dir).await.map_err(|source| RestamentError::FixtureCopy {
            src: dir.clone(),
            dest: dir.clone(),
            source,
        })?;
        debug!("Emptied upload directory {}", dir.display());
        Ok(())
    }

    /// Delete every existing row of each table; returns the number removed
    pub async fn purge_tables(&self, tables: &[&str]) -> RunResult<usize> {
        if tables.is_empty() {
            return Ok(0);
        }
        let store = self.require_store()?;

        let counts = try_join_all(tables.iter().map(|table| {
            let store = store.clone();
            async move {
                let existing = store
                    .find_all(table)
                    .await
                    .map_err(|e| RestamentError::fixture("purge", e))?;
                try_join_all(existing.iter().map(|row| store.remove(table, row)))
                    .await
                    .map_err(|e| RestamentError::fixture("purge", e))?;
                debug!("Purged {} row(s) from {}", existing.len(), table);
                Ok::<_, RestamentError>(existing.len())
            }
        }))
        .await?;

        let total: usize = counts.iter().sum();
        info!("Purged {} row(s) across {} table(s)", total, tables.len());
        Ok(total)
    }

    /// Insert mock rows; tables are seeded concurrently, rows within a table in order
    pub async fn seed_rows(&self, scenario: &Scenario) -> RunResult<usize> {
        let mut per_table: Vec<(&str, Vec<Row>)> = Vec::new();
        for table in &scenario.db {
            let Some(mock) = &table.mock else { continue };
            if mock.data.is_empty() {
                continue;
            }

            let rows = mock
                .data
                .iter()
                .map(|value| mock_row(&table.tablename, value))
                .collect::<RunResult<Vec<_>>>()?;

            match per_table.iter().position(|(name, _)| *name == table.tablename) {
                Some(idx) => per_table[idx].1.extend(rows),
                None => per_table.push((table.tablename.as_str(), rows)),
            }
        }

        if per_table.is_empty() {
            return Ok(0);
        }
        let store = self.require_store()?;

        let counts = try_join_all(per_table.iter().map(|(table, rows)| {
            let store = store.clone();
            async move {
                for row in rows {
                    store
                        .create(table, row)
                        .await
                        .map_err(|e| RestamentError::fixture("seed", e))?;
                }
                debug!("Seeded {} row(s) into {}", rows.len(), table);
                Ok::<_, RestamentError>(rows.len())
            }
        }))
        .await?;

        let total: usize = counts.iter().sum();
        info!("Seeded {} row(s)", total);
        Ok(total)
    }

    /// Copy mock upload files into the upload directory
    pub async fn seed_uploads(&self, scenario: &Scenario) -> RunResult<usize> {
        let seeds: Vec<_> = scenario
            .db
            .iter()
            .filter_map(|t| t.mock.as_ref())
            .flat_map(|m| m.uploads.iter())
            .collect();
        if seeds.is_empty() {
            return Ok(0);
        }
        let dir = self.require_upload_dir()?;

        try_join_all(seeds.iter().map(|seed| {
            let dest = dir.join(&seed.dest);
            async move {
                copy_path(&seed.src, &dest)
                    .await
                    .map_err(|source| RestamentError::FixtureCopy {
                        src: seed.src.clone(),
                        dest: dest.clone(),
                        source,
                    })
            }
        }))
        .await?;

        info!("Copied {} upload fixture(s)", seeds.len());
        Ok(seeds.len())
    }

    fn require_store(&self) -> RunResult<&Arc<dyn Store>> {
        self.store.as_ref().ok_or_else(|| {
            RestamentError::Config(
                "scenario references database tables but no database is configured".to_string(),
            )
        })
    }

    fn require_upload_dir(&self) -> RunResult<&Path> {
        self.upload_dir.as_deref().ok_or_else(|| {
            RestamentError::Config(
                "scenario uses upload fixtures but `upload_dir` is not configured".to_string(),
            )
        })
    }
}

/// Reject mock rows that are not mappings before anything is reset
pub(crate) fn check_mock_rows(scenario: &Scenario) -> RunResult<()> {
    for table in &scenario.db {
        let Some(mock) = &table.mock else { continue };
        for value in &mock.data {
            mock_row(&table.tablename, value)?;
        }
    }
    Ok(())
}

fn mock_row(table: &str, value: &Value) -> RunResult<Row> {
    match value {
        Value::Object(map) => Ok(map.clone()),
        other => Err(RestamentError::Config(format!(
            "mock row for table {} must be a mapping, got {}",
            table, other
        ))),
    }
}

/// Remove everything inside `dir`, creating it when missing
pub(crate) async fn empty_dir(dir: &Path) -> io::Result<()> {
    if !tokio::fs::try_exists(dir).await? {
        return tokio::fs::create_dir_all(dir).await;
    }

    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
    }
    Ok(())
}

/// Copy a file or a whole directory tree, creating parent directories
pub(crate) async fn copy_path(src: &Path, dest: &Path) -> io::Result<()> {
    if tokio::fs::metadata(src).await?.is_dir() {
        let src = src.to_path_buf();
        let dest = dest.to_path_buf();
        return tokio::task::spawn_blocking(move || copy_tree(&src, &dest))
            .await
            .map_err(io::Error::other)?;
    }

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(src, dest).await?;
    Ok(())
}

fn copy_tree(src: &Path, dest: &Path) -> io::Result<()> {
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
