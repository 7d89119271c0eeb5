//! Store layer: raw SQL against the backing SQLite database.
//!
//! Every mutation that participates in lease coordination is a single
//! conditional `UPDATE`/`DELETE` whose `WHERE` clause encodes the expected
//! lease state; `rows_affected` tells the caller whether it won the race.
//! No cross-message transactions are required anywhere in the core.

use std::future::Future;
use std::time::Duration;

pub mod dedup;
pub mod message;
pub mod queue;

/// SQLITE_BUSY and SQLITE_LOCKED surface as database errors with these
/// primary result codes.
const SQLITE_BUSY: &str = "5";
const SQLITE_LOCKED: &str = "6";

/// Whether an error is worth retrying internally. Logic errors (constraint
/// violations, decode failures) are never transient.
pub(crate) fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| code == SQLITE_BUSY || code == SQLITE_LOCKED)
            .unwrap_or(false),
        _ => false,
    }
}

/// Runs a store operation, retrying transient failures a bounded number of
/// times with a short backoff before giving up. The final error propagates
/// to the caller, where transient classes map to `Error::Unavailable`.
pub(crate) async fn with_retry<T, F, Fut>(mut op: F) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    const ATTEMPTS: usize = 3;

    let mut delay = Duration::from_millis(25);
    for _ in 1..ATTEMPTS {
        match op().await {
            Err(err) if is_transient(&err) => {
                tracing::debug!(error = %err, "retrying transient storage failure");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            other => return other,
        }
    }
    op().await
}
