//! Visibility lease expiry.
//!
//! Each queue runs one sweeper task for the whole of its timer-driven
//! lifecycle work: lease expiry, delayed-message release, dead-letter
//! redrive, retention purging and dedup-window cleanup. Deadlines are kept
//! in a `DelayQueue` timer wheel keyed by `visibility_deadline`, so expiry
//! never scans the full table; grants, renewals and delays feed the wheel
//! over an unbounded channel.
//!
//! The sweeper is the sole mechanism behind at-least-once delivery: a
//! consumer that crashes before deleting simply lets its lease fire here
//! and the message becomes visible again. Nothing in this module surfaces
//! errors to clients; a failed step is logged and retried on the next
//! firing or maintenance tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::time::delay_queue::{DelayQueue, Key};

use crate::config::Config;
use crate::db::{self, message::Message, queue::Queue};
use crate::redrive;
use crate::service::Runtimes;
use crate::utils::now_ms;

/// How long to wait before revisiting a message whose expiry handling
/// failed transiently.
const RETRY_BACKOFF_MS: i64 = 1_000;

pub(crate) enum LeaseCmd {
    /// Arm (or re-arm) the wheel for a message's visibility deadline.
    Track { message: i64, deadline: i64 },
}

enum Event {
    Cmd(Option<LeaseCmd>),
    Expired(i64),
    Tick,
}

pub(crate) struct Sweeper {
    pool: SqlitePool,
    queue: Queue,
    dead_letter: Option<Queue>,
    config: Config,
    runtimes: Arc<Runtimes>,
    rx: mpsc::UnboundedReceiver<LeaseCmd>,
    wheel: DelayQueue<i64>,
    keys: HashMap<i64, Key>,
}

impl Sweeper {
    pub(crate) fn spawn(
        pool: SqlitePool,
        queue: Queue,
        config: Config,
        runtimes: Arc<Runtimes>,
        rx: mpsc::UnboundedReceiver<LeaseCmd>,
    ) -> JoinHandle<()> {
        let sweeper = Self {
            pool,
            queue,
            dead_letter: None,
            config,
            runtimes,
            rx,
            wheel: DelayQueue::new(),
            keys: HashMap::new(),
        };

        tokio::spawn(sweeper.run())
    }

    async fn run(mut self) {
        // Queue attributes are fixed at creation, so the dead-letter target
        // can be resolved once.
        if let Some(target) = self.queue.dead_letter_target {
            match self.load_queue(target).await {
                Ok(dead_letter) => self.dead_letter = dead_letter,
                Err(err) => {
                    tracing::warn!(
                        queue = %self.queue.name,
                        error = %err,
                        "failed to resolve dead-letter target"
                    );
                }
            }
        }

        let mut tick = tokio::time::interval(self.config.maintenance_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = {
                let Self { rx, wheel, .. } = &mut self;

                tokio::select! {
                    cmd = rx.recv() => Event::Cmd(cmd),
                    Some(expired) = std::future::poll_fn(|cx| wheel.poll_expired(cx)),
                        if !wheel.is_empty() =>
                    {
                        Event::Expired(expired.into_inner())
                    }
                    _ = tick.tick() => Event::Tick,
                }
            };

            match event {
                // The queue was dropped; nothing left to sweep.
                Event::Cmd(None) => break,
                Event::Cmd(Some(LeaseCmd::Track { message, deadline })) => {
                    self.track(message, deadline);
                }
                Event::Expired(message) => {
                    self.keys.remove(&message);
                    if let Err(err) = self.handle_expiry(message).await {
                        tracing::warn!(
                            queue = %self.queue.name,
                            message,
                            error = %err,
                            "lease expiry handling failed, retrying"
                        );
                        self.track(message, now_ms() + RETRY_BACKOFF_MS);
                    }
                }
                Event::Tick => {
                    if let Err(err) = self.maintain().await {
                        tracing::warn!(
                            queue = %self.queue.name,
                            error = %err,
                            "maintenance sweep failed"
                        );
                    }
                }
            }
        }
    }

    async fn load_queue(&self, id: i64) -> eyre::Result<Option<Queue>> {
        let mut conn = self.pool.acquire().await?;
        Ok(Queue::get(&mut conn, id).await?)
    }

    fn track(&mut self, message: i64, deadline: i64) {
        let delay = Duration::from_millis(deadline.saturating_sub(now_ms()).max(0) as u64);

        match self.keys.get(&message) {
            Some(key) => {
                self.wheel.reset(key, delay);
            }
            None => {
                let key = self.wheel.insert(message, delay);
                self.keys.insert(message, key);
            }
        }
    }

    fn untrack(&mut self, message: i64) {
        if let Some(key) = self.keys.remove(&message) {
            self.wheel.remove(&key);
        }
    }

    /// Decides the fate of a message whose tracked deadline fired: ignore
    /// (already settled), re-arm (renewed meanwhile), redrive (receive
    /// count exhausted) or release back to visible.
    async fn handle_expiry(&mut self, id: i64) -> eyre::Result<()> {
        let now = now_ms();
        let mut conn = self.pool.acquire().await?;

        let Some(message) = Message::get(&mut conn, self.queue.id, id).await? else {
            return Ok(());
        };
        let Some(deadline) = message.visibility_deadline else {
            return Ok(());
        };

        if deadline > now {
            drop(conn);
            self.track(id, deadline);
            return Ok(());
        }

        let exhausted = self
            .queue
            .max_receive_count
            .map(|max| message.receipt_token.is_some() && message.receive_count >= max)
            .unwrap_or(false);

        if exhausted {
            if let Some(dead_letter) = &self.dead_letter {
                let moved =
                    redrive::move_to_dead_letter(&mut conn, &self.queue, &message, dead_letter)
                        .await?;
                drop(conn);

                if let Some(moved) = moved {
                    self.complete_source_head(&message);
                    self.wake_dead_letter(dead_letter.id, moved, message.group_key.as_deref());
                }
                // A losing race against delete/renew needs no cleanup; the
                // conditional delete inside the move already refused.
                return Ok(());
            }
        }

        let released = Message::release_expired(&mut conn, self.queue.id, id, now).await?;
        drop(conn);

        if let Some(released) = released {
            if let Some(runtime) = self.runtimes.get(self.queue.id) {
                if let Some(group) = &released.group_key {
                    runtime.with_sequencer(|sequencer| sequencer.release_head(group, released.id));
                }
                runtime.wake();
            }

            tracing::debug!(
                queue = %self.queue.name,
                message = released.id,
                receive_count = released.receive_count,
                "lease expired, message visible again"
            );
        }

        Ok(())
    }

    fn complete_source_head(&self, message: &Message) {
        let Some(runtime) = self.runtimes.get(self.queue.id) else {
            return;
        };

        if let Some(group) = &message.group_key {
            let successor = runtime
                .with_sequencer(|sequencer| sequencer.complete_head(group, message.id))
                .unwrap_or(false);
            if successor {
                runtime.wake();
            }
        }
    }

    fn wake_dead_letter(&self, dead_letter: i64, moved: i64, group: Option<&str>) {
        let Some(runtime) = self.runtimes.get(dead_letter) else {
            return;
        };

        if let Some(group) = group {
            runtime.with_sequencer(|sequencer| sequencer.register(group, moved));
        }
        runtime.wake();
    }

    /// Coarse periodic pass: retention purge, dedup-window cleanup, and a
    /// wheel re-seed so nothing in flight is ever stranded by a lost
    /// command.
    async fn maintain(&mut self) -> eyre::Result<()> {
        let now = now_ms();
        let mut conn = self.pool.acquire().await?;

        let cutoff = now.saturating_sub(self.queue.retention_period_ms);
        let purged = Message::expire_retained(&mut conn, self.queue.id, cutoff).await?;
        db::dedup::purge_expired(&mut conn, self.queue.id, now).await?;
        let deadlines = Message::scan_deadlines(&mut conn, self.queue.id).await?;
        drop(conn);

        if !purged.is_empty() {
            if let Some(runtime) = self.runtimes.get(self.queue.id) {
                runtime.with_sequencer(|sequencer| {
                    for (id, group) in &purged {
                        if let Some(group) = group {
                            sequencer.remove(group, *id);
                        }
                    }
                });
            }

            for (id, _) in &purged {
                self.untrack(*id);
            }

            tracing::info!(
                queue = %self.queue.name,
                count = purged.len(),
                "purged retention-expired messages"
            );
        }

        for (id, deadline) in deadlines {
            if !self.keys.contains_key(&id) {
                self.track(id, deadline);
            }
        }

        Ok(())
    }
}
