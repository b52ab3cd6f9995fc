use thiserror::Error;

/// Failures reported by a transport link.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    /// The device could not be reached or refused the connection.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// A write was rejected by the link.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// The link is no longer connected.
    #[error("link disconnected")]
    Disconnected,
}

/// Errors returned to callers of session operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("device is not connected")]
    NotConnected,

    #[error("no valid configuration to send")]
    NothingToSend,

    /// The registry already holds the maximum number of live links.
    #[error("connection limit reached ({0} devices)")]
    TooManyConnections(usize),

    /// The session task has stopped.
    #[error("session closed")]
    Closed,

    #[error(transparent)]
    Link(#[from] LinkError),
}
