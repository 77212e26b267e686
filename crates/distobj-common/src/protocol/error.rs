use thiserror::Error;

#[derive(Error, Debug)]
pub enum DistobjError {
    #[error("Truncated stream: needed {needed} bytes at offset {offset}, {available} available")]
    TruncatedStream {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("Malformed stream: {0}")]
    MalformedStream(String),

    #[error("Unknown class: {0}")]
    UnknownClass(String),

    #[error("Invalid object graph: {0}")]
    InvalidGraph(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Remote invocation failed: {0}")]
    RemoteInvocation(String),

    #[error("Message too large: {size} bytes (max {max} bytes)")]
    MessageTooLarge { size: usize, max: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DistobjError {
    /// Shorthand for a [`DistobjError::MalformedStream`] with a formatted reason.
    pub fn malformed(reason: impl Into<String>) -> Self {
        DistobjError::MalformedStream(reason.into())
    }

    /// Whether this error came from decoding bytes (as opposed to the link or the peer).
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            DistobjError::TruncatedStream { .. }
                | DistobjError::MalformedStream(_)
                | DistobjError::UnknownClass(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DistobjError>;
