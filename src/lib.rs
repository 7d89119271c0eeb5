//! Embeddable message-queue core.
//!
//! Single-queue, multi-producer/multi-consumer delivery with at-least-once
//! semantics: visibility-timeout leasing, strict FIFO group ordering,
//! time-windowed deduplication, long-poll receives and dead-letter
//! redrive, all backed by SQLite. Transport, authentication and
//! administration UIs live outside this crate; the [`Service`] type is the
//! whole surface.
//!
//! ```no_run
//! use axonq::{EnqueueRequest, QueueConfig, ReceiveOptions, Service};
//!
//! # async fn example() -> Result<(), axonq::Error> {
//! let service = Service::connect().await?;
//!
//! service.create_queue("orders", QueueConfig::default()).await?;
//!
//! service
//!     .enqueue(
//!         "orders",
//!         EnqueueRequest::builder().body(b"order-42".to_vec()).build(),
//!     )
//!     .await?;
//!
//! let batch = service.receive("orders", ReceiveOptions::default()).await?;
//! for message in batch {
//!     service
//!         .delete_message("orders", message.message_id, &message.receipt_token)
//!         .await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod lease;
pub mod message;
pub mod queue;
pub mod recv;
pub mod redrive;
pub mod sequencer;
pub mod service;

mod utils;

pub use config::Config;
pub use error::Error;
pub use message::{EnqueueReceipt, EnqueueRequest, MessageState, ReceiveOptions, ReceivedMessage};
pub use queue::{OrderingMode, QueueConfig, RedrivePolicy};
pub use service::Service;
