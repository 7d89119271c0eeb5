//! Queue configuration types.
//!
//! A queue's attributes are fixed at creation time. The ordering mode picks
//! between standard delivery (any visible message, no ordering guarantee)
//! and fifo delivery (strict enqueue order and a single outstanding lease
//! per group key). The redrive policy, when present, bounds how often a
//! message can be leased before it is moved to the dead-letter queue.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delivery semantics of a queue, fixed at creation.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    sqlx::Type,
    strum::Display,
    strum::EnumString,
)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrderingMode {
    /// Best-effort ordering, unrestricted parallel delivery.
    Standard,
    /// Strict per-group ordering with one outstanding lease per group.
    Fifo,
}

/// Moves messages that exhaust `max_receive_count` lease grants to the
/// dead-letter queue named by `dead_letter_target`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RedrivePolicy {
    pub max_receive_count: u32,
    pub dead_letter_target: String,
}

/// Attributes applied to a queue at creation.
#[derive(Debug, Clone, bon::Builder)]
pub struct QueueConfig {
    #[builder(default = OrderingMode::Standard)]
    pub ordering_mode: OrderingMode,

    /// Lease duration applied when a receive call does not override it.
    #[builder(default = Duration::from_secs(30))]
    pub default_visibility_timeout: Duration,

    /// Messages older than this are purged regardless of state.
    #[builder(default = Duration::from_secs(345_600))]
    pub retention_period: Duration,

    pub redrive: Option<RedrivePolicy>,

    /// Deduplication window. Strictly honored for fifo queues; best-effort
    /// for standard queues, where it only applies to caller-supplied keys.
    #[builder(default = Duration::from_secs(300))]
    pub dedup_window: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl QueueConfig {
    pub fn is_fifo(&self) -> bool {
        self.ordering_mode == OrderingMode::Fifo
    }
}
