use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Item not found: book {0}")]
    ItemNotFound(i64),

    #[error("Order not found: {0}")]
    OrderNotFound(i64),

    #[error("Insufficient stock for book {book_id}")]
    InsufficientStock { book_id: i64 },

    #[error("Illegal state transition: {from} -> {to}")]
    IllegalStateTransition { from: &'static str, to: &'static str },

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Already exists: {0}")]
    Duplicate(String),

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Dependency {0} is unavailable")]
    DependencyOpen(String),

    #[error("Dependency error: {0}")]
    Dependency(String),

    #[error("Order persist error: {0}")]
    OrderPersist(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors that describe a caller mistake or a business rule,
    /// as opposed to an infrastructure fault. Business errors surface to the
    /// caller verbatim and never count against a circuit breaker.
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            Error::InvalidArgument(_)
                | Error::ItemNotFound(_)
                | Error::OrderNotFound(_)
                | Error::InsufficientStock { .. }
                | Error::IllegalStateTransition { .. }
                | Error::PermissionDenied
                | Error::Duplicate(_)
        )
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Error::InvalidArgument(_) => 400,
            Error::ItemNotFound(_) | Error::OrderNotFound(_) => 404,
            Error::PermissionDenied => 403,
            Error::Duplicate(_) => 409,
            Error::InsufficientStock { .. } | Error::IllegalStateTransition { .. } => 422,
            Error::DeadlineExceeded => 504,
            Error::DependencyOpen(_) => 503,
            _ => 500,
        }
    }
}
