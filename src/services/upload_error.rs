use thiserror::Error;

/// Failures of the resumable upload path.
///
/// Everything up to `TooLarge` is the client's problem and is answered with
/// an empty protocol response; `NotComplete` is a caller bug; `Creation`
/// covers container resolution and content factories.
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Upload {0} is already in progress")]
    Conflict(String),

    #[error("Upload {0} not found")]
    NotFound(String),

    #[error("Offset mismatch for upload {id}: expected {expected}, got {actual}")]
    Range {
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Malformed resumable request: {0}")]
    Protocol(String),

    #[error("Unsupported tus version: {0}")]
    UnsupportedVersion(String),

    #[error("Upload too large: {0}")]
    TooLarge(String),

    #[error("Container {0} not found")]
    ContainerNotFound(String),

    #[error("Upload {0} is not complete")]
    NotComplete(String),

    #[error("Content creation failed: {0}")]
    Creation(#[from] anyhow::Error),

    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Temporary storage error: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// True for errors the client can react to by resuming or restarting.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Conflict(_)
                | Self::NotFound(_)
                | Self::Range { .. }
                | Self::Protocol(_)
                | Self::UnsupportedVersion(_)
                | Self::TooLarge(_)
        )
    }
}
