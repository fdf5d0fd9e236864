use berth_scheduler::{ApiError, ApiErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum DockerError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(#[from] http::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("runtime returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("host {0} has no reachable address")]
    NoAddress(String),

    #[error("stream error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DockerResult<T> = Result<T, DockerError>;

impl From<DockerError> for ApiError {
    fn from(err: DockerError) -> Self {
        let kind = match &err {
            DockerError::Status { status: 404, .. } => ApiErrorKind::NotFound,
            DockerError::Status { status, .. } if (400..500).contains(status) => {
                ApiErrorKind::Validation
            }
            DockerError::Status { .. } => ApiErrorKind::Other,
            DockerError::Request(_) | DockerError::Url(_) | DockerError::NoAddress(_) => {
                ApiErrorKind::Validation
            }
            DockerError::Connect { .. }
            | DockerError::Http(_)
            | DockerError::Decode(_)
            | DockerError::Io(_) => ApiErrorKind::Transport,
        };
        ApiError::new(kind, err.to_string())
    }
}
