//! Embedded SQLite checkpoint store, an alternative to `lastBlock.json`.
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::task;

use crate::store::CheckpointStore;

const CHECKPOINT_KEY: &str = "last_block";

/// One-row-per-key table:
///   listener_state(name TEXT PRIMARY KEY, block INTEGER NOT NULL)
///
/// Only `last_block` is written today.
pub struct SqliteCheckpointStore {
    path: PathBuf,
}

impl SqliteCheckpointStore {
    /// Open (creating if needed) the database at `path` and ensure the schema.
    pub fn new(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let conn = open(&path)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS listener_state (
                name  TEXT PRIMARY KEY,
                block INTEGER NOT NULL
            );
            "#,
        )
        .context("create listener_state table")?;
        Ok(Self { path })
    }
}

fn open(path: &Path) -> anyhow::Result<Connection> {
    let conn =
        Connection::open(path).with_context(|| format!("open sqlite at {}", path.display()))?;
    // checkpoint writes must survive power loss
    conn.pragma_update(None, "synchronous", "FULL")?;
    Ok(conn)
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn load_checkpoint(&self) -> anyhow::Result<Option<u64>> {
        let path = self.path.clone();
        task::spawn_blocking(move || {
            let conn = open(&path)?;
            let block: Option<i64> = conn
                .query_row(
                    "SELECT block FROM listener_state WHERE name = ?1",
                    params![CHECKPOINT_KEY],
                    |row| row.get(0),
                )
                .optional()
                .context("read checkpoint")?;
            block
                .map(|b| u64::try_from(b).context("negative checkpoint in database"))
                .transpose()
        })
        .await?
    }

    async fn save_checkpoint(&self, block: u64) -> anyhow::Result<()> {
        let path = self.path.clone();
        let block = i64::try_from(block).context("checkpoint exceeds i64")?;
        task::spawn_blocking(move || {
            let conn = open(&path)?;
            conn.execute(
                "INSERT INTO listener_state(name, block) VALUES(?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET block = excluded.block",
                params![CHECKPOINT_KEY, block],
            )
            .context("write checkpoint")?;
            Ok(())
        })
        .await?
    }
}
