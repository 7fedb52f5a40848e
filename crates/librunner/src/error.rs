use runner_protocol::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("path denied: {0} escapes the workspace root")]
    PathDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("terminal spawn failed: {0}")]
    SpawnFailure(String),

    #[error("pty error: {0}")]
    Pty(String),

    #[error("invalid workspace id: {0}")]
    InvalidWorkspaceId(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// Convert to protocol error code and sanitized message.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            RunnerError::PathDenied(_) => (ErrorCode::PathDenied, self.to_string()),
            RunnerError::NotFound(_) => (ErrorCode::NotFound, self.to_string()),
            RunnerError::SpawnFailure(_) => (ErrorCode::SpawnFailure, self.to_string()),
            RunnerError::Pty(_) => (ErrorCode::ServerError, self.to_string()),
            RunnerError::InvalidWorkspaceId(_) => (ErrorCode::InvalidRequest, self.to_string()),
            RunnerError::Io(_) => (ErrorCode::IoFailure, "internal I/O error".to_string()),
        }
    }
}
