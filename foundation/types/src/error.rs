/// The uniform error taxonomy shared by every CrossCloudKit service.
///
/// Public APIs never panic across the boundary; they return
/// [`ServiceResult`] and map failures onto HTTP status semantics via
/// [`ServiceError::status_code`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("service is not initialized: {0}")]
    NotInitialized(String),

    #[error("service has been disposed")]
    Disposed,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("backend error: {0}")]
    Backend(String),
}

impl ServiceError {
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::NotInitialized(_) | ServiceError::Disposed => 503,
            ServiceError::InvalidInput(_) => 400,
            ServiceError::NotFound(_) => 404,
            ServiceError::PreconditionFailed(_) => 412,
            ServiceError::Conflict(_) => 409,
            // Cancellation propagates as-is; the mapping is nominal.
            ServiceError::Cancelled => 499,
            ServiceError::Backend(_) => 500,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ServiceError::Cancelled)
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
