//! Time-windowed deduplication index.
//!
//! Maps `(queue, dedup_key)` to the message id that first carried the key.
//! An unexpired hit makes the enqueue idempotent: the producer gets the
//! original message id back and no new row is created. Entries expire
//! lazily on conflict and in bulk from the maintenance tick.

use sqlx::SqliteConnection;

/// Looks up an unexpired entry for the key. The original message may have
/// been consumed and deleted already; the window contract is about enqueue
/// idempotence, not message liveness, so the id is returned regardless.
pub async fn check(
    db: &mut SqliteConnection,
    queue: i64,
    dedup_key: impl AsRef<str>,
    now: i64,
) -> sqlx::Result<Option<i64>> {
    sqlx::query_scalar(
        "SELECT message_id FROM dedup_entries
        WHERE queue = $1 AND dedup_key = $2 AND expires_at > $3",
    )
    .bind(queue)
    .bind(dedup_key.as_ref())
    .bind(now)
    .fetch_optional(db)
    .await
}

/// Records the key for a freshly inserted message. An expired leftover
/// under the same key is overwritten in place.
pub async fn insert(
    db: &mut SqliteConnection,
    queue: i64,
    dedup_key: impl AsRef<str>,
    message_id: i64,
    expires_at: i64,
) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO dedup_entries (queue, dedup_key, message_id, expires_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (queue, dedup_key) DO UPDATE
        SET message_id = excluded.message_id, expires_at = excluded.expires_at",
    )
    .bind(queue)
    .bind(dedup_key.as_ref())
    .bind(message_id)
    .bind(expires_at)
    .execute(db)
    .await?;

    Ok(())
}

pub async fn purge_expired(db: &mut SqliteConnection, queue: i64, now: i64) -> sqlx::Result<u64> {
    let result = sqlx::query("DELETE FROM dedup_entries WHERE queue = $1 AND expires_at <= $2")
        .bind(queue)
        .bind(now)
        .execute(db)
        .await?;

    Ok(result.rows_affected())
}
