use thiserror::Error;

/// Why a request to the device (or its relay) failed.
///
/// The state machine treats every kind the same way; the distinction exists
/// for logs and the status line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection refused, timed out, DNS failure, or a non-success status.
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),
    /// The body was not valid JSON.
    #[error("{0}")]
    InvalidResponseBody(String),
    /// Valid JSON that does not acknowledge the request.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),
}

impl TransportError {
    /// Canonical parse failure, matching the device UI's wording.
    pub fn invalid_json() -> Self {
        TransportError::InvalidResponseBody("Invalid JSON".into())
    }
}

/// Errors surfaced by [`crate::sync_client::SyncClient`] and its handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// No bearer token or user id in the store. Nothing is attempted.
    #[error("missing credentials: sign in before connecting")]
    MissingCredentials,
    /// The handshake failed on every available transport.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The operation is not available for this variant (e.g. an explicit
    /// connect on the background loop).
    #[error("{0}")]
    Unsupported(&'static str),
    /// The background loop is not opted in.
    #[error("auto-connect is disabled")]
    AutoConnectDisabled,
    /// The scheduler task has exited.
    #[error("sync client has shut down")]
    Closed,
}
