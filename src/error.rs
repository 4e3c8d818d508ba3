/// Errors surfaced by the flag cache and its network collaborators.
///
/// HTTP failures keep their status code so callers can tell an expired
/// token (401) from a missing permission (403) without string matching.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlagSyncError {
    /// Required connection settings are missing.
    #[error("not configured: missing {0}")]
    Configuration(String),
    /// The push channel could not be opened or broke before the first snapshot.
    #[error("stream transport error: {0}")]
    Transport(String),
    /// A frame or response body did not have the expected shape.
    #[error("unexpected payload in {context}: {message}")]
    Decode { context: String, message: String },
    #[error("unauthorized ({status})")]
    Auth { status: u16 },
    #[error("forbidden ({status})")]
    Permission { status: u16 },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("request failed with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    /// The cache was stopped before the operation could complete.
    #[error("flag store stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, FlagSyncError>;

impl FlagSyncError {
    /// Map a non-success HTTP status to its error kind.
    pub fn from_status(status: u16, resource: &str, body: String) -> Self {
        match status {
            401 => FlagSyncError::Auth { status },
            403 => FlagSyncError::Permission { status },
            404 => FlagSyncError::NotFound(resource.to_string()),
            _ => FlagSyncError::Status { status, body },
        }
    }

    pub fn decode(context: &str, err: impl std::fmt::Display) -> Self {
        FlagSyncError::Decode {
            context: context.to_string(),
            message: err.to_string(),
        }
    }

    /// The HTTP status code behind this error, if it came from a response.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            FlagSyncError::Auth { status }
            | FlagSyncError::Permission { status }
            | FlagSyncError::Status { status, .. } => Some(*status),
            FlagSyncError::NotFound(_) => Some(404),
            _ => None,
        }
    }

    /// Whether retrying the same request could succeed.
    /// Bad credentials and missing permissions will not fix themselves.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            FlagSyncError::Auth { .. }
                | FlagSyncError::Permission { .. }
                | FlagSyncError::Configuration(_)
                | FlagSyncError::Stopped
        )
    }
}

impl From<reqwest::Error> for FlagSyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return FlagSyncError::decode("response body", e);
        }
        match e.status() {
            Some(status) => FlagSyncError::from_status(status.as_u16(), "", e.to_string()),
            None => FlagSyncError::Network(e.to_string()),
        }
    }
}
