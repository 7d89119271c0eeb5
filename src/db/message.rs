use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, SqliteConnection};
use tokio_stream::StreamExt;

use crate::message::MessageState;

/// A stored message. The lease fields encode the delivery state: a visible
/// message has neither deadline nor token, a delayed message has only a
/// deadline, a leased message has both.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone)]
pub struct Message {
    pub id: i64,
    pub queue: i64,
    pub body: Vec<u8>,
    pub body_digest: String,
    pub group_key: Option<String>,
    pub dedup_key: Option<String>,
    pub enqueued_at: i64,
    pub receive_count: i64,
    pub visibility_deadline: Option<i64>,
    pub receipt_token: Option<String>,
}

impl Message {
    pub fn state(&self) -> MessageState {
        match (&self.visibility_deadline, &self.receipt_token) {
            (None, _) => MessageState::Visible,
            (Some(_), None) => MessageState::Delayed,
            (Some(_), Some(_)) => MessageState::Leased,
        }
    }

    /// Inserts a new message row. A delayed message starts out with a
    /// visibility deadline but no receipt token.
    pub async fn insert(
        db: &mut SqliteConnection,
        queue: i64,
        body: impl AsRef<[u8]>,
        body_digest: impl AsRef<str>,
        group_key: Option<&str>,
        dedup_key: Option<&str>,
        enqueued_at: i64,
        visibility_deadline: Option<i64>,
    ) -> sqlx::Result<i64> {
        sqlx::query_scalar(
            "INSERT INTO messages (
                queue, body, body_digest, group_key, dedup_key, enqueued_at, visibility_deadline
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id",
        )
        .bind(queue)
        .bind(body.as_ref())
        .bind(body_digest.as_ref())
        .bind(group_key)
        .bind(dedup_key)
        .bind(enqueued_at)
        .bind(visibility_deadline)
        .fetch_one(db)
        .await
    }

    pub async fn insert_attributes(
        db: &mut SqliteConnection,
        message: i64,
        attributes: &BTreeMap<String, String>,
    ) -> sqlx::Result<()> {
        for (k, v) in attributes {
            sqlx::query("INSERT INTO kv_pairs (message, k, v) VALUES ($1, $2, $3)")
                .bind(message)
                .bind(k)
                .bind(v)
                .execute(&mut *db)
                .await?;
        }

        Ok(())
    }

    pub async fn load_attributes(
        db: &mut SqliteConnection,
        message: i64,
    ) -> sqlx::Result<BTreeMap<String, String>> {
        let mut stream = sqlx::query_as::<_, (String, String)>(
            "SELECT k, v FROM kv_pairs WHERE message = $1",
        )
        .bind(message)
        .fetch(db);

        let mut attributes = BTreeMap::new();

        while let Some((k, v)) = stream.next().await.transpose()? {
            attributes.insert(k, v);
        }

        Ok(attributes)
    }

    pub async fn get(
        db: &mut SqliteConnection,
        queue: i64,
        id: i64,
    ) -> sqlx::Result<Option<Message>> {
        sqlx::query_as("SELECT * FROM messages WHERE queue = $1 AND id = $2")
            .bind(queue)
            .bind(id)
            .fetch_optional(db)
            .await
    }

    /// Lease grant. Conditional on the message still being visible, so
    /// concurrent grants resolve with exactly one winner; the losers get
    /// `None` and move on to another message.
    pub async fn claim(
        db: &mut SqliteConnection,
        queue: i64,
        id: i64,
        deadline: i64,
        token: impl AsRef<str>,
    ) -> sqlx::Result<Option<Message>> {
        sqlx::query_as(
            "UPDATE messages
            SET visibility_deadline = $3, receipt_token = $4,
                receive_count = receive_count + 1
            WHERE queue = $1 AND id = $2 AND visibility_deadline IS NULL
            RETURNING *",
        )
        .bind(queue)
        .bind(id)
        .bind(deadline)
        .bind(token.as_ref())
        .fetch_optional(db)
        .await
    }

    /// Lease renewal: the deadline moves, the token stays. Fails when the
    /// token no longer matches the current lease.
    pub async fn renew(
        db: &mut SqliteConnection,
        queue: i64,
        id: i64,
        token: impl AsRef<str>,
        deadline: i64,
    ) -> sqlx::Result<bool> {
        let result = sqlx::query(
            "UPDATE messages SET visibility_deadline = $4
            WHERE queue = $1 AND id = $2 AND receipt_token = $3
                AND visibility_deadline IS NOT NULL",
        )
        .bind(queue)
        .bind(id)
        .bind(token.as_ref())
        .bind(deadline)
        .execute(db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Explicit early release against a held token. Returns the released
    /// row so fifo callers can re-open the group head.
    pub async fn release_with_token(
        db: &mut SqliteConnection,
        queue: i64,
        id: i64,
        token: impl AsRef<str>,
    ) -> sqlx::Result<Option<Message>> {
        sqlx::query_as(
            "UPDATE messages SET visibility_deadline = NULL, receipt_token = NULL
            WHERE queue = $1 AND id = $2 AND receipt_token = $3
            RETURNING *",
        )
        .bind(queue)
        .bind(id)
        .bind(token.as_ref())
        .fetch_optional(db)
        .await
    }

    /// Sweep-side release of an expired lease or elapsed delay. The
    /// deadline condition makes this lose cleanly against a concurrent
    /// renewal or delete.
    pub async fn release_expired(
        db: &mut SqliteConnection,
        queue: i64,
        id: i64,
        now: i64,
    ) -> sqlx::Result<Option<Message>> {
        sqlx::query_as(
            "UPDATE messages SET visibility_deadline = NULL, receipt_token = NULL
            WHERE queue = $1 AND id = $2
                AND visibility_deadline IS NOT NULL AND visibility_deadline <= $3
            RETURNING *",
        )
        .bind(queue)
        .bind(id)
        .bind(now)
        .fetch_optional(db)
        .await
    }

    /// Deletes a message against its receipt token. The token condition is
    /// what makes concurrent deletes with the same token resolve to exactly
    /// one winner.
    pub async fn delete_with_token(
        db: &mut SqliteConnection,
        queue: i64,
        id: i64,
        token: impl AsRef<str>,
    ) -> sqlx::Result<Option<Message>> {
        sqlx::query_as(
            "DELETE FROM messages
            WHERE queue = $1 AND id = $2 AND receipt_token = $3
            RETURNING *",
        )
        .bind(queue)
        .bind(id)
        .bind(token.as_ref())
        .fetch_optional(db)
        .await
    }

    /// Ids of visible messages, oldest first.
    pub async fn scan_visible(
        db: &mut SqliteConnection,
        queue: i64,
        limit: i64,
    ) -> sqlx::Result<Vec<i64>> {
        sqlx::query_scalar(
            "SELECT id FROM messages
            WHERE queue = $1 AND visibility_deadline IS NULL
            ORDER BY id LIMIT $2",
        )
        .bind(queue)
        .bind(limit)
        .fetch_all(db)
        .await
    }

    /// Every message currently carrying a visibility deadline, as
    /// `(id, deadline)`. Used to seed and re-seed the expiry wheel.
    pub async fn scan_deadlines(
        db: &mut SqliteConnection,
        queue: i64,
    ) -> sqlx::Result<Vec<(i64, i64)>> {
        sqlx::query_as(
            "SELECT id, visibility_deadline FROM messages
            WHERE queue = $1 AND visibility_deadline IS NOT NULL",
        )
        .bind(queue)
        .fetch_all(db)
        .await
    }

    /// Full queue contents in enqueue order, as `(id, group_key, leased)`.
    /// Used to rebuild the group sequencer at queue registration.
    pub async fn scan_for_restore(
        db: &mut SqliteConnection,
        queue: i64,
    ) -> sqlx::Result<Vec<(i64, Option<String>, bool)>> {
        sqlx::query_as(
            "SELECT id, group_key, receipt_token IS NOT NULL
            FROM messages WHERE queue = $1 ORDER BY id",
        )
        .bind(queue)
        .fetch_all(db)
        .await
    }

    /// Deletes messages older than the retention cutoff, returning what was
    /// removed so in-memory structures can be trimmed to match.
    pub async fn expire_retained(
        db: &mut SqliteConnection,
        queue: i64,
        cutoff: i64,
    ) -> sqlx::Result<Vec<(i64, Option<String>)>> {
        sqlx::query_as(
            "DELETE FROM messages WHERE queue = $1 AND enqueued_at <= $2
            RETURNING id, group_key",
        )
        .bind(queue)
        .bind(cutoff)
        .fetch_all(db)
        .await
    }

    pub async fn purge(db: &mut SqliteConnection, queue: i64) -> sqlx::Result<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE queue = $1")
            .bind(queue)
            .execute(db)
            .await?;

        Ok(result.rows_affected())
    }
}
