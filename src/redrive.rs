//! Dead-letter mover.
//!
//! Moves a message whose receive count is exhausted into the configured
//! dead-letter queue. The move is a single transaction: a conditional
//! delete against the lease token followed by a fresh insert in the target
//! queue. The token condition doubles as the one-shot guard — if the sweep
//! re-triggers before a previous move committed, or a consumer deletes or
//! renews concurrently, the delete misses and the whole move aborts with
//! no side effects.

use sqlx::{Acquire, SqliteConnection};

use crate::db::{message::Message, queue::Queue};
use crate::utils::now_ms;

/// Provenance attributes recorded on the moved message.
pub const SOURCE_QUEUE_ATTRIBUTE: &str = "redrive.source-queue";
pub const SOURCE_MESSAGE_ATTRIBUTE: &str = "redrive.source-message-id";
pub const SOURCE_RECEIVES_ATTRIBUTE: &str = "redrive.source-receive-count";

/// Returns the id the message received in the dead-letter queue, or `None`
/// when a concurrent settle won the race. The moved copy keeps the body,
/// attributes and group key; its receive count restarts at zero and the
/// dedup key is dropped so the move cannot be suppressed by the window.
pub(crate) async fn move_to_dead_letter(
    conn: &mut SqliteConnection,
    source: &Queue,
    message: &Message,
    dead_letter: &Queue,
) -> sqlx::Result<Option<i64>> {
    let Some(token) = message.receipt_token.as_deref() else {
        return Ok(None);
    };

    let mut tx = conn.begin().await?;
    let tx_conn = tx.acquire().await?;

    // Attributes first: deleting the row cascades over its kv pairs.
    let mut attributes = Message::load_attributes(&mut *tx_conn, message.id).await?;

    let Some(removed) =
        Message::delete_with_token(&mut *tx_conn, source.id, message.id, token).await?
    else {
        tx.rollback().await?;
        return Ok(None);
    };

    let moved = Message::insert(
        &mut *tx_conn,
        dead_letter.id,
        &removed.body,
        &removed.body_digest,
        removed.group_key.as_deref(),
        None,
        now_ms(),
        None,
    )
    .await?;

    attributes.insert(SOURCE_QUEUE_ATTRIBUTE.to_owned(), source.name.clone());
    attributes.insert(SOURCE_MESSAGE_ATTRIBUTE.to_owned(), removed.id.to_string());
    attributes.insert(
        SOURCE_RECEIVES_ATTRIBUTE.to_owned(),
        removed.receive_count.to_string(),
    );

    Message::insert_attributes(tx_conn, moved, &attributes).await?;

    tx.commit().await?;

    tracing::info!(
        source = %source.name,
        dead_letter = %dead_letter.name,
        message = removed.id,
        moved,
        receive_count = removed.receive_count,
        "moved message to dead-letter queue"
    );

    Ok(Some(moved))
}
