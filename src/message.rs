//! Message types for the queue core.
//!
//! A message is either *visible* (eligible for a lease, no visibility
//! deadline), *delayed* (deadline set by the producer, no receipt token yet)
//! or *leased* (deadline and token set by a grant). Leases expire through
//! the background sweep, which is what makes delivery at-least-once: a
//! consumer that crashes before deleting simply lets the lease time out and
//! the message reappears with its receive count incremented.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delivery state of a message, derived from its stored lease fields.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageState {
    /// Eligible for a lease grant.
    Visible,
    /// Hidden until its enqueue delay elapses; never been leased.
    Delayed,
    /// Held by a consumer under a visibility deadline.
    Leased,
}

/// A producer's enqueue request.
#[derive(Debug, Clone, bon::Builder)]
pub struct EnqueueRequest {
    /// Opaque payload. Must be non-empty and within the configured size
    /// limit.
    pub body: Vec<u8>,

    /// Producer-supplied metadata, capped by configuration.
    #[builder(default)]
    pub attributes: BTreeMap<String, String>,

    /// FIFO group key. Required for fifo queues, ignored for standard ones.
    pub group_key: Option<String>,

    /// Explicit deduplication key. For fifo queues a content-derived key is
    /// used when absent.
    pub dedup_key: Option<String>,

    /// Initial invisibility period. Standard queues only.
    pub delay: Option<Duration>,
}

/// Outcome of an enqueue. When `deduplicated` is set the call was absorbed
/// by an earlier enqueue within the dedup window and `message_id` refers to
/// that original message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EnqueueReceipt {
    pub message_id: u64,
    pub body_digest: String,
    pub deduplicated: bool,
}

/// Parameters of a receive call.
#[derive(Debug, Clone, bon::Builder)]
pub struct ReceiveOptions {
    /// Messages to return at most, 1..=10.
    #[builder(default = 1)]
    pub max_messages: usize,

    /// Long-poll bound. Zero returns immediately.
    #[builder(default = Duration::ZERO)]
    pub wait_time: Duration,

    /// Lease duration override for this call.
    pub visibility_timeout: Option<Duration>,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// A leased message as handed to a consumer. The receipt token is the
/// one-time credential for `delete_message` and `change_visibility`; it is
/// reissued on every grant, so a token from a previous delivery of the same
/// message is stale.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: u64,
    pub body: Vec<u8>,
    pub body_digest: String,
    pub attributes: BTreeMap<String, String>,
    pub group_key: Option<String>,
    pub enqueued_at: i64,
    /// Total lease grants including this one. Values above 1 mean
    /// redelivery, which is expected under at-least-once semantics.
    pub receive_count: u32,
    pub receipt_token: String,
}
