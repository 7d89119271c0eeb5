//! Receive coordination: batch claiming and long polling.
//!
//! A receive call claims visible messages through the store's conditional
//! update — for fifo queues only group heads offered by the sequencer are
//! candidates. When nothing is claimable and the caller asked to wait, the
//! task parks on the queue's `Notify` until an enqueue, release or redrive
//! wakes it, or the wait bound elapses. The wakeup is armed *before* the
//! claim attempt so a message arriving in between is never missed.
//!
//! Cancellation is dropping the receive future: the waiter registration is
//! an RAII guard, so a disconnected caller releases its slot without any
//! further bookkeeping.

use std::pin::pin;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::time::Instant;

use crate::db::message::Message;
use crate::db::queue::Queue;
use crate::error::Error;
use crate::message::{ReceiveOptions, ReceivedMessage};
use crate::service::{QueueRuntime, Service};
use crate::utils::{generate_token, now_ms};

/// Most messages a single receive call may return.
pub const MAX_BATCH: usize = 10;

impl Service {
    /// Claims up to `max_messages` visible messages, long-polling for up to
    /// `wait_time` when the queue is empty. Every returned message carries
    /// a fresh receipt token and an already-incremented receive count;
    /// counts above one are ordinary at-least-once redeliveries.
    pub async fn receive(
        &self,
        queue: impl AsRef<str>,
        options: ReceiveOptions,
    ) -> Result<Vec<ReceivedMessage>, Error> {
        let queue = self.queue_by_name(queue.as_ref()).await?;

        if options.max_messages == 0 || options.max_messages > MAX_BATCH {
            return Err(Error::invalid_parameter(format!(
                "max_messages must be between 1 and {MAX_BATCH}"
            )));
        }
        if options.wait_time > self.config().max_wait() {
            return Err(Error::invalid_parameter("wait_time exceeds the long-poll bound"));
        }

        let visibility = options
            .visibility_timeout
            .unwrap_or_else(|| queue.default_visibility_timeout());

        if visibility.is_zero() {
            return Err(Error::invalid_parameter("visibility timeout must be non-zero"));
        }
        if visibility > Duration::from_millis(self.config().max_visibility_ms) {
            return Err(Error::invalid_parameter(
                "visibility timeout exceeds the allowed maximum",
            ));
        }

        let runtime = self
            .runtime(queue.id)
            .ok_or_else(|| Error::queue_not_found(&queue.name))?;

        let batch = self
            .claim_batch(&queue, &runtime, options.max_messages, visibility)
            .await?;

        if !batch.is_empty() || options.wait_time.is_zero() {
            return Ok(batch);
        }

        let _guard = WaiterGuard::acquire(&runtime, self.config().max_waiters_per_queue)?;
        let deadline = Instant::now() + options.wait_time;

        loop {
            let mut notified = pin!(runtime.notify.notified());
            notified.as_mut().enable();

            let batch = self
                .claim_batch(&queue, &runtime, options.max_messages, visibility)
                .await?;

            if !batch.is_empty() {
                return Ok(batch);
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }

            let _ = tokio::time::timeout_at(deadline, notified).await;
        }
    }

    async fn claim_batch(
        &self,
        queue: &Queue,
        runtime: &QueueRuntime,
        max: usize,
        visibility: Duration,
    ) -> Result<Vec<ReceivedMessage>, Error> {
        let mut conn = self.db().acquire().await?;
        let mut granted = Vec::with_capacity(max);

        while granted.len() < max {
            let want = max - granted.len();

            // Candidate set: any visible message for standard queues, one
            // unleased head per group for fifo queues.
            let candidates: Vec<(Option<String>, i64)> = if queue.is_fifo() {
                runtime
                    .with_sequencer(|sequencer| sequencer.next_eligible(want))
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(group, id)| (Some(group), id))
                    .collect()
            } else {
                Message::scan_visible(&mut conn, queue.id, want as i64)
                    .await?
                    .into_iter()
                    .map(|id| (None, id))
                    .collect()
            };

            if candidates.is_empty() {
                break;
            }

            let mut progressed = false;

            for (group, id) in candidates {
                let deadline = now_ms() + visibility.as_millis() as i64;
                let token = generate_token::<32>();

                let Some(message) =
                    Message::claim(&mut conn, queue.id, id, deadline, &token).await?
                else {
                    // Lost the race. For fifo, a candidate the store no
                    // longer knows (retention got it first) must also leave
                    // the sequencer, or it would gate its group forever.
                    if let Some(group) = &group {
                        if Message::get(&mut conn, queue.id, id).await?.is_none() {
                            runtime.with_sequencer(|sequencer| sequencer.remove(group, id));
                        }
                    }
                    continue;
                };

                if let Some(group) = &group {
                    runtime.with_sequencer(|sequencer| sequencer.mark_leased(group, message.id));
                }
                runtime.track(message.id, deadline);

                let attributes = Message::load_attributes(&mut conn, message.id).await?;

                progressed = true;
                granted.push(ReceivedMessage {
                    message_id: message.id as u64,
                    body: message.body,
                    body_digest: message.body_digest,
                    attributes,
                    group_key: message.group_key,
                    enqueued_at: message.enqueued_at,
                    receive_count: message.receive_count as u32,
                    receipt_token: token,
                });
            }

            // Every candidate lost its race; leave instead of spinning.
            if !progressed {
                break;
            }
        }

        if !granted.is_empty() {
            tracing::debug!(
                queue = %queue.name,
                count = granted.len(),
                "granted leases"
            );
        }

        Ok(granted)
    }
}

/// Counts a long-poll waiter against the queue's cap for the lifetime of
/// the receive call, including cancellation.
struct WaiterGuard<'a> {
    runtime: &'a QueueRuntime,
}

impl<'a> WaiterGuard<'a> {
    fn acquire(runtime: &'a QueueRuntime, cap: usize) -> Result<Self, Error> {
        if runtime.waiters.fetch_add(1, Ordering::AcqRel) >= cap {
            runtime.waiters.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::Throttled);
        }

        Ok(Self { runtime })
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.runtime.waiters.fetch_sub(1, Ordering::AcqRel);
    }
}
