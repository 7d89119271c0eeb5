use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use sqlx::sqlite::{
    SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode, SqlitePoolOptions,
};
use sqlx::{Acquire, SqlitePool};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::db::{
    self,
    message::Message,
    queue::{Queue, QueueStatistics},
};
use crate::error::Error;
use crate::lease::{LeaseCmd, Sweeper};
use crate::message::{EnqueueReceipt, EnqueueRequest};
use crate::queue::{OrderingMode, QueueConfig};
use crate::sequencer::GroupSequencer;
use crate::utils::{now_ms, sha256_hex};

/// In-memory side of a registered queue: the long-poll wakeup channel, the
/// waiter count for shedding, the fifo sequencer, and the handle feeding
/// the expiry sweeper.
pub(crate) struct QueueRuntime {
    pub(crate) notify: Notify,
    pub(crate) waiters: AtomicUsize,
    sequencer: Option<Mutex<GroupSequencer>>,
    lease: mpsc::UnboundedSender<LeaseCmd>,
    sweeper: OnceLock<JoinHandle<()>>,
}

impl QueueRuntime {
    /// Hands a visibility deadline to the expiry sweeper.
    pub(crate) fn track(&self, message: i64, deadline: i64) {
        let _ = self.lease.send(LeaseCmd::Track { message, deadline });
    }

    /// Wakes every long-poll waiter on the queue.
    pub(crate) fn wake(&self) {
        self.notify.notify_waiters();
    }

    /// Runs a closure under the sequencer lock. No-op (returning `None`)
    /// for standard queues. The lock is never held across an await point.
    pub(crate) fn with_sequencer<R>(&self, f: impl FnOnce(&mut GroupSequencer) -> R) -> Option<R> {
        self.sequencer
            .as_ref()
            .map(|sequencer| f(&mut sequencer.lock().expect("sequencer lock")))
    }

    fn abort_sweeper(&self) {
        if let Some(handle) = self.sweeper.get() {
            handle.abort();
        }
    }
}

/// Lock-free registry of queue runtimes, keyed by queue id.
pub(crate) struct Runtimes {
    map: papaya::HashMap<i64, Arc<QueueRuntime>>,
}

impl Runtimes {
    fn new() -> Self {
        Self {
            map: papaya::HashMap::new(),
        }
    }

    pub(crate) fn get(&self, id: i64) -> Option<Arc<QueueRuntime>> {
        self.map.pin().get(&id).cloned()
    }

    fn insert(&self, id: i64, runtime: Arc<QueueRuntime>) {
        self.map.pin().insert(id, runtime);
    }

    fn remove(&self, id: i64) -> Option<Arc<QueueRuntime>> {
        self.map.pin().remove(&id).cloned()
    }

    fn drain(&self) -> Vec<Arc<QueueRuntime>> {
        let pinned = self.map.pin();
        let runtimes: Vec<_> = pinned.iter().map(|(_, runtime)| runtime.clone()).collect();
        let ids: Vec<i64> = pinned.iter().map(|(id, _)| *id).collect();
        for id in ids {
            pinned.remove(&id);
        }
        runtimes
    }
}

pub struct Service {
    db: SqlitePool,
    config: Config,
    runtimes: Arc<Runtimes>,
}

impl Service {
    pub async fn connect() -> Result<Self, Error> {
        Self::connect_with(Config::default()).await
    }

    pub async fn connect_with(config: Config) -> Result<Self, Error> {
        let opts = if let Some(path) = &config.db_path {
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
        } else {
            SqliteConnectOptions::new().in_memory(true)
        }
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .locking_mode(SqliteLockingMode::Normal)
        .optimize_on_close(true, None)
        .auto_vacuum(SqliteAutoVacuum::Full);

        // Pooled connections to an in-memory database would each get their
        // own empty store, and an idle-reaped connection would drop it.
        let pool_opts = if config.db_path.is_none() {
            SqlitePoolOptions::new().max_connections(1).min_connections(1)
        } else {
            SqlitePoolOptions::new()
        };

        let pool = pool_opts.connect_with(opts).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        let service = Self {
            db: pool,
            config,
            runtimes: Arc::new(Runtimes::new()),
        };

        for queue in service.list_queues().await? {
            service.register_runtime(&queue).await?;
        }

        Ok(service)
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn runtime(&self, queue_id: i64) -> Option<Arc<QueueRuntime>> {
        self.runtimes.get(queue_id)
    }

    pub(crate) async fn queue_by_name(&self, name: &str) -> Result<Queue, Error> {
        db::with_retry(|| async {
            let mut conn = self.db.acquire().await?;
            Queue::get_by_name(&mut conn, name).await
        })
        .await?
        .ok_or_else(|| Error::queue_not_found(name))
    }

    /// Builds the in-memory state for a queue and starts its expiry
    /// sweeper. For fifo queues the group sequencer is rebuilt from the
    /// store so restarts preserve ordering and outstanding leases.
    async fn register_runtime(&self, queue: &Queue) -> Result<Arc<QueueRuntime>, Error> {
        let sequencer = if queue.is_fifo() {
            let mut conn = self.db.acquire().await?;
            let rows = Message::scan_for_restore(&mut conn, queue.id).await?;
            let rows = rows
                .into_iter()
                .filter_map(|(id, group, leased)| group.map(|group| (id, group, leased)));
            Some(Mutex::new(GroupSequencer::restore(rows)))
        } else {
            None
        };

        let (tx, rx) = mpsc::unbounded_channel();

        let runtime = Arc::new(QueueRuntime {
            notify: Notify::new(),
            waiters: AtomicUsize::new(0),
            sequencer,
            lease: tx,
            sweeper: OnceLock::new(),
        });

        self.runtimes.insert(queue.id, runtime.clone());

        let handle = Sweeper::spawn(
            self.db.clone(),
            queue.clone(),
            self.config.clone(),
            self.runtimes.clone(),
            rx,
        );
        let _ = runtime.sweeper.set(handle);

        Ok(runtime)
    }

    pub async fn create_queue(
        &self,
        name: impl AsRef<str>,
        config: QueueConfig,
    ) -> Result<Queue, Error> {
        let name = name.as_ref();

        if name.is_empty() {
            return Err(Error::missing_parameter("queue name"));
        }

        let mut tx = self.db.begin().await?;
        let conn = tx.acquire().await?;

        let dead_letter_target = match &config.redrive {
            Some(policy) => {
                if policy.max_receive_count == 0 {
                    return Err(Error::invalid_parameter(
                        "max_receive_count must be at least 1",
                    ));
                }
                if policy.dead_letter_target == name {
                    return Err(Error::invalid_parameter(
                        "queue cannot be its own dead-letter target",
                    ));
                }

                let target = Queue::get_by_name(&mut *conn, &policy.dead_letter_target)
                    .await?
                    .ok_or_else(|| Error::queue_not_found(&policy.dead_letter_target))?;

                if target.ordering_mode != config.ordering_mode {
                    return Err(Error::invalid_parameter(
                        "dead-letter target must share the queue's ordering mode",
                    ));
                }

                Some(target.id)
            }
            None => None,
        };

        let queue = match Queue::insert(conn, name, &config, dead_letter_target, now_ms()).await {
            Ok(queue) => queue,
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                return Err(Error::QueueExists {
                    queue: name.to_owned(),
                });
            }
            Err(err) => return Err(err.into()),
        };

        tx.commit().await?;

        self.register_runtime(&queue).await?;

        tracing::info!(queue = %queue.name, mode = %queue.ordering_mode, "created queue");

        Ok(queue)
    }

    pub async fn delete_queue(&self, name: impl AsRef<str>) -> Result<(), Error> {
        let queue = self.queue_by_name(name.as_ref()).await?;

        {
            let mut conn = self.db.acquire().await?;

            if Queue::dead_letter_sources(&mut conn, queue.id).await? > 0 {
                return Err(Error::invalid_parameter(
                    "queue is the dead-letter target of another queue",
                ));
            }

            Queue::delete(&mut conn, queue.id).await?;
        }

        if let Some(runtime) = self.runtimes.remove(queue.id) {
            runtime.abort_sweeper();
            runtime.wake();
        }

        tracing::info!(queue = %queue.name, "deleted queue");

        Ok(())
    }

    pub async fn list_queues(&self) -> Result<Vec<Queue>, Error> {
        let mut conn = self.db.acquire().await?;
        Ok(Queue::list(&mut conn).await?)
    }

    /// Read-only view of a queue's fixed attributes.
    pub async fn queue_attributes(&self, name: impl AsRef<str>) -> Result<Queue, Error> {
        self.queue_by_name(name.as_ref()).await
    }

    pub async fn queue_statistics(&self, name: impl AsRef<str>) -> Result<QueueStatistics, Error> {
        let queue = self.queue_by_name(name.as_ref()).await?;
        let mut conn = self.db.acquire().await?;
        Ok(Queue::statistics(&mut conn, queue.id).await?)
    }

    pub async fn purge_queue(&self, name: impl AsRef<str>) -> Result<u64, Error> {
        let queue = self.queue_by_name(name.as_ref()).await?;

        let purged = {
            let mut conn = self.db.acquire().await?;
            Message::purge(&mut conn, queue.id).await?
        };

        if let Some(runtime) = self.runtimes.get(queue.id) {
            runtime.with_sequencer(|sequencer| sequencer.clear());
        }

        tracing::info!(queue = %queue.name, count = purged, "purged queue");

        Ok(purged)
    }

    pub async fn enqueue(
        &self,
        queue: impl AsRef<str>,
        request: EnqueueRequest,
    ) -> Result<EnqueueReceipt, Error> {
        let queue = self.queue_by_name(queue.as_ref()).await?;

        if request.body.is_empty() {
            return Err(Error::missing_parameter("message body"));
        }
        if request.body.len() > self.config.max_message_size {
            return Err(Error::MessageTooLarge {
                size: request.body.len(),
                limit: self.config.max_message_size,
            });
        }
        if request.attributes.len() > self.config.max_attributes {
            return Err(Error::AttributeLimitExceeded {
                count: request.attributes.len(),
                limit: self.config.max_attributes,
            });
        }

        let group_key = match (queue.ordering_mode, &request.group_key) {
            (OrderingMode::Fifo, Some(group)) if !group.is_empty() => Some(group.as_str()),
            (OrderingMode::Fifo, _) => {
                return Err(Error::missing_parameter("group key is required for fifo queues"));
            }
            (OrderingMode::Standard, group) => group.as_deref(),
        };

        let delay = match request.delay {
            None => None,
            Some(_) if queue.is_fifo() => {
                return Err(Error::invalid_parameter(
                    "per-message delay is not supported on fifo queues",
                ));
            }
            Some(delay) if delay > Duration::from_millis(self.config.max_delay_ms) => {
                return Err(Error::invalid_parameter("delay exceeds the allowed maximum"));
            }
            Some(delay) if !delay.is_zero() => Some(delay),
            Some(_) => None,
        };

        // FIFO queues always dedup, deriving a content key when the caller
        // supplies none. Standard queues honor the window best-effort and
        // only for explicit keys.
        let dedup_key = match &request.dedup_key {
            Some(key) if !key.is_empty() => Some(key.clone()),
            _ if queue.is_fifo() => Some(sha256_hex(&request.body)),
            _ => None,
        };

        let body_digest = hex::encode(md5::compute(&request.body).as_ref());
        let now = now_ms();
        let deadline = delay.map(|delay| now + delay.as_millis() as i64);

        let mut tx = self.db.begin().await?;
        let conn = tx.acquire().await?;

        if let Some(key) = &dedup_key {
            if let Some(existing) = db::dedup::check(&mut *conn, queue.id, key, now).await? {
                tx.rollback().await?;
                tracing::debug!(queue = %queue.name, message_id = existing, "deduplicated enqueue");
                return Ok(EnqueueReceipt {
                    message_id: existing as u64,
                    body_digest,
                    deduplicated: true,
                });
            }
        }

        let message_id = Message::insert(
            &mut *conn,
            queue.id,
            &request.body,
            &body_digest,
            group_key,
            dedup_key.as_deref(),
            now,
            deadline,
        )
        .await?;

        Message::insert_attributes(&mut *conn, message_id, &request.attributes).await?;

        if let Some(key) = &dedup_key {
            db::dedup::insert(conn, queue.id, key, message_id, now + queue.dedup_window_ms)
                .await?;
        }

        tx.commit().await?;

        if let Some(runtime) = self.runtimes.get(queue.id) {
            match deadline {
                // Delayed messages surface through the sweeper once due.
                Some(deadline) => runtime.track(message_id, deadline),
                None => {
                    if let Some(group) = group_key {
                        runtime.with_sequencer(|sequencer| sequencer.register(group, message_id));
                    }
                    runtime.wake();
                }
            }
        }

        tracing::debug!(
            queue = %queue.name,
            message_id,
            size = request.body.len(),
            "enqueued message"
        );

        Ok(EnqueueReceipt {
            message_id: message_id as u64,
            body_digest,
            deduplicated: false,
        })
    }

    /// Commits a delivery. The receipt token must match the current lease;
    /// a stale token means the message's fate was already decided elsewhere
    /// (expired and re-leased, deleted, or redriven) and the caller should
    /// drop it.
    pub async fn delete_message(
        &self,
        queue: impl AsRef<str>,
        message_id: u64,
        receipt_token: impl AsRef<str>,
    ) -> Result<(), Error> {
        let queue = self.queue_by_name(queue.as_ref()).await?;

        let deleted = {
            let mut conn = self.db.acquire().await?;
            Message::delete_with_token(
                &mut conn,
                queue.id,
                message_id as i64,
                receipt_token.as_ref(),
            )
            .await?
            .ok_or(Error::InvalidReceipt)?
        };

        if let Some(runtime) = self.runtimes.get(queue.id) {
            if let Some(group) = &deleted.group_key {
                let successor = runtime
                    .with_sequencer(|sequencer| sequencer.complete_head(group, deleted.id))
                    .unwrap_or(false);
                if successor {
                    runtime.wake();
                }
            }
        }

        tracing::debug!(queue = %queue.name, message_id, "deleted message");

        Ok(())
    }

    /// Extends or shortens the current lease. A zero timeout is an explicit
    /// early release: the message becomes immediately visible again and the
    /// token is invalidated.
    pub async fn change_visibility(
        &self,
        queue: impl AsRef<str>,
        message_id: u64,
        receipt_token: impl AsRef<str>,
        new_timeout: Duration,
    ) -> Result<(), Error> {
        let queue = self.queue_by_name(queue.as_ref()).await?;

        if new_timeout > Duration::from_millis(self.config.max_visibility_ms) {
            return Err(Error::invalid_parameter(
                "visibility timeout exceeds the allowed maximum",
            ));
        }

        if new_timeout.is_zero() {
            let released = {
                let mut conn = self.db.acquire().await?;
                Message::release_with_token(
                    &mut conn,
                    queue.id,
                    message_id as i64,
                    receipt_token.as_ref(),
                )
                .await?
                .ok_or(Error::InvalidReceipt)?
            };

            if let Some(runtime) = self.runtimes.get(queue.id) {
                if let Some(group) = &released.group_key {
                    runtime
                        .with_sequencer(|sequencer| sequencer.release_head(group, released.id));
                }
                runtime.wake();
            }

            return Ok(());
        }

        let deadline = now_ms() + new_timeout.as_millis() as i64;

        let renewed = {
            let mut conn = self.db.acquire().await?;
            Message::renew(
                &mut conn,
                queue.id,
                message_id as i64,
                receipt_token.as_ref(),
                deadline,
            )
            .await?
        };

        if !renewed {
            return Err(Error::InvalidReceipt);
        }

        if let Some(runtime) = self.runtimes.get(queue.id) {
            runtime.track(message_id as i64, deadline);
        }

        Ok(())
    }

    /// Stops every sweeper and closes the pool.
    pub async fn close(self) {
        for runtime in self.runtimes.drain() {
            runtime.abort_sweeper();
        }
        self.db.close().await;
    }
}
