// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed checkpoint store.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::debug;

use super::CheckpointStore;
use crate::checkpoint::Checkpoint;
use crate::error::CoreError;
use crate::io_request::{CallSite, FlowId, SessionId, TopicSession};
use crate::payload::TypeTag;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Row of the `flow_checkpoints` table.
#[derive(Debug, Clone, sqlx::FromRow)]
struct CheckpointRow {
    flow_id: String,
    checkpoint_id: String,
    flow_type: String,
    logger_name: String,
    state: Vec<u8>,
    awaiting_topic: String,
    awaiting_session: i64,
    awaiting_type: String,
    call_site_file: String,
    call_site_line: i64,
    call_site_column: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<CheckpointRow> for Checkpoint {
    type Error = CoreError;

    fn try_from(row: CheckpointRow) -> Result<Self, Self::Error> {
        let flow_id: FlowId = row
            .flow_id
            .parse()
            .map_err(|e| CoreError::store("decode", format!("bad flow id '{}': {}", row.flow_id, e)))?;
        let line = u32::try_from(row.call_site_line)
            .map_err(|e| CoreError::store("decode", format!("bad call site line: {}", e)))?;
        let column = u32::try_from(row.call_site_column)
            .map_err(|e| CoreError::store("decode", format!("bad call site column: {}", e)))?;

        Ok(Checkpoint {
            flow_id,
            checkpoint_id: row.checkpoint_id,
            flow_type: row.flow_type,
            logger_name: row.logger_name,
            serialized_flow_state: row.state,
            awaiting_topic: TopicSession::new(row.awaiting_topic, SessionId(row.awaiting_session)),
            awaiting_type: TypeTag::new(row.awaiting_type),
            call_site: CallSite {
                file: row.call_site_file,
                line,
                column,
            },
            created_at: row.created_at,
        })
    }
}

/// Checkpoint store backed by a SQLite database.
#[derive(Clone, Debug)]
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    /// Create a store from an existing pool. Migrations must already have run.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (or create) a database file and run migrations.
    ///
    /// Parent directories are created if needed.
    ///
    /// ```ignore
    /// let store = SqliteCheckpointStore::from_path(".data/checkpoints.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                CoreError::store(
                    "create_dir",
                    format!("Failed to create directory {:?}: {}", parent, e),
                )
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| {
                CoreError::store(
                    "connect",
                    format!("Failed to connect to SQLite at {:?}: {}", path, e),
                )
            })?;

        Self::migrate(&pool).await?;
        debug!(path = ?path, "Opened SQLite checkpoint store");
        Ok(Self { pool })
    }

    /// Apply the embedded migrations. Already applied migrations are skipped.
    pub async fn migrate(pool: &SqlitePool) -> Result<(), CoreError> {
        MIGRATOR
            .run(pool)
            .await
            .map_err(|e| CoreError::store("migrate", format!("Failed to run migrations: {}", e)))
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn list_all(&self) -> Result<Vec<Checkpoint>, CoreError> {
        let rows = sqlx::query_as::<_, CheckpointRow>(
            r#"
            SELECT flow_id, checkpoint_id, flow_type, logger_name, state,
                   awaiting_topic, awaiting_session, awaiting_type,
                   call_site_file, call_site_line, call_site_column, created_at
            FROM flow_checkpoints
            ORDER BY created_at ASC, flow_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Checkpoint::try_from).collect()
    }

    async fn put(&self, flow_id: FlowId, checkpoint: Checkpoint) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO flow_checkpoints (
                flow_id, checkpoint_id, flow_type, logger_name, state,
                awaiting_topic, awaiting_session, awaiting_type,
                call_site_file, call_site_line, call_site_column, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(flow_id) DO UPDATE SET
                checkpoint_id=excluded.checkpoint_id,
                flow_type=excluded.flow_type,
                logger_name=excluded.logger_name,
                state=excluded.state,
                awaiting_topic=excluded.awaiting_topic,
                awaiting_session=excluded.awaiting_session,
                awaiting_type=excluded.awaiting_type,
                call_site_file=excluded.call_site_file,
                call_site_line=excluded.call_site_line,
                call_site_column=excluded.call_site_column,
                created_at=excluded.created_at
            "#,
        )
        .bind(flow_id.to_string())
        .bind(&checkpoint.checkpoint_id)
        .bind(&checkpoint.flow_type)
        .bind(&checkpoint.logger_name)
        .bind(&checkpoint.serialized_flow_state)
        .bind(&checkpoint.awaiting_topic.topic)
        .bind(checkpoint.awaiting_topic.session_id.0)
        .bind(checkpoint.awaiting_type.as_str())
        .bind(&checkpoint.call_site.file)
        .bind(i64::from(checkpoint.call_site.line))
        .bind(i64::from(checkpoint.call_site.column))
        .bind(checkpoint.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove(&self, flow_id: FlowId) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM flow_checkpoints WHERE flow_id = ?")
            .bind(flow_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get(&self, flow_id: FlowId) -> Result<Option<Checkpoint>, CoreError> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            r#"
            SELECT flow_id, checkpoint_id, flow_type, logger_name, state,
                   awaiting_topic, awaiting_session, awaiting_type,
                   call_site_file, call_site_line, call_site_column, created_at
            FROM flow_checkpoints
            WHERE flow_id = ?
            "#,
        )
        .bind(flow_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Checkpoint::try_from).transpose()
    }
}
