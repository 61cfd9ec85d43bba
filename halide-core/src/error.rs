use thiserror::Error;

#[derive(Error, Debug)]
pub enum HalideError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("model error: {0}")]
    Model(#[from] halide_model::ModelError),

    #[error("invalid media file: {0}")]
    InvalidMedia(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl HalideError {
    /// Transient failures are worth one more attempt; everything else is
    /// surfaced immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            HalideError::Io(_) => true,
            HalideError::Database(err) => matches!(
                err,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, HalideError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_transient() {
        let err = HalideError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(err.is_transient());
    }

    #[test]
    fn domain_errors_are_not_transient() {
        assert!(!HalideError::InvalidMedia("bad.jpg".into()).is_transient());
        assert!(!HalideError::UnknownJobType("x".into()).is_transient());
    }
}
