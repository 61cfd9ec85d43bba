use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("invalid status value: {0}")]
    InvalidStatus(String),

    #[error("invalid perceptual hash: {0}")]
    InvalidHash(String),

    #[error("invalid hash kind: {0}")]
    InvalidHashKind(String),

    #[error("invalid selection method: {0}")]
    InvalidSelectionMethod(String),

    #[error("invalid file type: {0}")]
    InvalidFileType(String),
}

pub type Result<T> = std::result::Result<T, ModelError>;
