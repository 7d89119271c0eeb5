use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// The receipt token does not match the current lease: the message was
    /// already deleted, already expired and re-leased, or never leased.
    /// Callers should drop the token, not retry.
    #[snafu(display("Invalid receipt token"))]
    InvalidReceipt,

    #[snafu(display("Queue not found: {queue}"))]
    QueueNotFound { queue: String },

    #[snafu(display("Queue already exists: {queue}"))]
    QueueExists { queue: String },

    #[snafu(display("Message body is {size} bytes, limit is {limit}"))]
    MessageTooLarge { size: usize, limit: usize },

    #[snafu(display("Message carries {count} attributes, limit is {limit}"))]
    AttributeLimitExceeded { count: usize, limit: usize },

    #[snafu(display("Invalid parameter: {message}"))]
    InvalidParameter { message: String },

    #[snafu(display("Missing parameter: {message}"))]
    MissingParameter { message: String },

    /// Capacity shed: the queue already has its maximum number of long-poll
    /// waiters. Callers retry with backoff.
    #[snafu(display("Too many concurrent receive waiters"))]
    Throttled,

    /// A transient storage failure persisted through the bounded internal
    /// retries.
    #[snafu(display("Storage temporarily unavailable"))]
    Unavailable,

    #[snafu(display("Error returned from database"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error running migrations"))]
    Migration {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        if crate::db::is_transient(&source) {
            Self::Unavailable
        } else {
            Self::Sqlx { source }
        }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::Migration { source }
    }
}

impl Error {
    pub fn queue_not_found(queue: impl Into<String>) -> Self {
        Self::QueueNotFound {
            queue: queue.into(),
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    pub fn missing_parameter(message: impl Into<String>) -> Self {
        Self::MissingParameter {
            message: message.into(),
        }
    }
}
