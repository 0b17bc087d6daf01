use thiserror::Error;

/// Errors raised by the batch gate workflow
#[derive(Error, Debug)]
pub enum GateError {
    #[error("File '{filename}' uploaded to container '{container}' doesn't have the right prefix: the first token in the filename ({customer}) must be the customer name, which should match the container name")]
    NamingConventionViolation {
        filename: String,
        container: String,
        customer: String,
    },

    #[error("Unhandled file type '{file_type}' in batch {batch_key}")]
    UnrecognizedFileType {
        batch_key: String,
        file_type: String,
    },

    /// 404-equivalent from the blob store. During relocation or a re-read
    /// this means a concurrent mover already finished with the blob and is
    /// treated as success by callers.
    #[error("Blob '{key}' not found")]
    BlobNotFound { key: String },

    #[error("Blob storage error: {0}")]
    Storage(String),

    #[error("State store error: {0}")]
    StateStore(String),

    #[error("Notification payload rejected: {0}")]
    BadNotification(String),
}

impl GateError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, GateError::BlobNotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, GateError>;
