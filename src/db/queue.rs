use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, SqliteConnection};
use tokio_stream::StreamExt;

use crate::queue::{OrderingMode, QueueConfig};

/// A queue row. Attributes are fixed at creation; the core only ever reads
/// them back.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone)]
pub struct Queue {
    pub id: i64,
    pub name: String,
    pub ordering_mode: OrderingMode,
    pub visibility_timeout_ms: i64,
    pub retention_period_ms: i64,
    pub max_receive_count: Option<i64>,
    pub dead_letter_target: Option<i64>,
    pub dedup_window_ms: i64,
    pub created_at: i64,
}

impl PartialEq for Queue {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

#[derive(Serialize, Deserialize, FromRow, Debug)]
pub struct QueueStatistics {
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub queue: Queue,
    pub message_count: i64,
    pub avg_size_bytes: f64,
}

impl Queue {
    pub fn is_fifo(&self) -> bool {
        self.ordering_mode == OrderingMode::Fifo
    }

    pub fn default_visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms.max(0) as u64)
    }

    pub fn retention_period(&self) -> Duration {
        Duration::from_millis(self.retention_period_ms.max(0) as u64)
    }

    pub async fn insert(
        db: &mut SqliteConnection,
        name: impl AsRef<str>,
        config: &QueueConfig,
        dead_letter_target: Option<i64>,
        created_at: i64,
    ) -> sqlx::Result<Queue> {
        sqlx::query_as(
            "INSERT INTO queues (
                name, ordering_mode, visibility_timeout_ms, retention_period_ms,
                max_receive_count, dead_letter_target, dedup_window_ms, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *",
        )
        .bind(name.as_ref())
        .bind(config.ordering_mode)
        .bind(config.default_visibility_timeout.as_millis() as i64)
        .bind(config.retention_period.as_millis() as i64)
        .bind(
            config
                .redrive
                .as_ref()
                .map(|policy| policy.max_receive_count as i64),
        )
        .bind(dead_letter_target)
        .bind(config.dedup_window.as_millis() as i64)
        .bind(created_at)
        .fetch_one(db)
        .await
    }

    pub async fn get(db: &mut SqliteConnection, id: i64) -> sqlx::Result<Option<Queue>> {
        sqlx::query_as("SELECT * FROM queues WHERE id = $1")
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn get_by_name(
        db: &mut SqliteConnection,
        name: impl AsRef<str>,
    ) -> sqlx::Result<Option<Queue>> {
        sqlx::query_as("SELECT * FROM queues WHERE name = $1")
            .bind(name.as_ref())
            .fetch_optional(db)
            .await
    }

    pub async fn list(db: &mut SqliteConnection) -> sqlx::Result<Vec<Queue>> {
        let mut stream = sqlx::query_as("SELECT * FROM queues ORDER BY id").fetch(db);

        let mut queues = Vec::new();

        while let Some(queue) = stream.next().await.transpose()? {
            queues.push(queue);
        }

        Ok(queues)
    }

    pub async fn delete(db: &mut SqliteConnection, id: i64) -> sqlx::Result<()> {
        sqlx::query("DELETE FROM queues WHERE id = $1")
            .bind(id)
            .execute(db)
            .await?;

        Ok(())
    }

    /// Number of queues that name this queue as their dead-letter target.
    pub async fn dead_letter_sources(db: &mut SqliteConnection, id: i64) -> sqlx::Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM queues WHERE dead_letter_target = $1")
            .bind(id)
            .fetch_one(db)
            .await
    }

    pub async fn statistics(db: &mut SqliteConnection, id: i64) -> sqlx::Result<QueueStatistics> {
        sqlx::query_as(
            "SELECT q.*,
                COUNT(m.id) AS message_count,
                COALESCE(AVG(LENGTH(m.body)), 0.0) AS avg_size_bytes
            FROM queues q
            LEFT JOIN messages m ON m.queue = q.id
            WHERE q.id = $1
            GROUP BY q.id",
        )
        .bind(id)
        .fetch_one(db)
        .await
    }
}
