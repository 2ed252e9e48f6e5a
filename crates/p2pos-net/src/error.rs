//! Error types for network operations.

/// Errors that can occur during network operations.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Failed to connect to a remote peer.
    #[error("connection error: {0}")]
    Connect(String),

    /// The remote peer does not serve the requested protocol.
    ///
    /// Version skew: callers mark the peer and skip the protocol until
    /// its next connect event.
    #[error("protocol not supported by peer")]
    ProtocolUnsupported,

    /// A deadline elapsed before the operation finished.
    #[error("deadline exceeded during {0}")]
    Timeout(&'static str),

    /// Failed to open a stream.
    #[error("stream open error: {0}")]
    StreamOpen(String),

    /// Error writing to a stream.
    #[error("write error: {0}")]
    Write(#[from] iroh::endpoint::WriteError),

    /// Stream was already closed when trying to finish.
    #[error("stream closed: {0}")]
    ClosedStream(#[from] iroh::endpoint::ClosedStream),

    /// Error reading a stream to EOF.
    #[error("read error: {0}")]
    ReadToEnd(#[from] iroh::endpoint::ReadToEndError),

    /// A JSON payload failed to decode.
    #[error("decode error: {0}")]
    Decode(String),

    /// A peer id or dial address failed to parse.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The remote answered an error instead of a payload.
    #[error("remote error: {0}")]
    Remote(String),
}

impl NetError {
    /// Classify a connect failure, surfacing ALPN rejection as the typed
    /// [`NetError::ProtocolUnsupported`] instead of a string match at the
    /// call sites.
    pub fn from_connect(err: impl std::fmt::Display) -> Self {
        let msg = err.to_string();
        let lower = msg.to_lowercase();
        if lower.contains("alpn") || lower.contains("no application protocol") {
            NetError::ProtocolUnsupported
        } else {
            NetError::Connect(msg)
        }
    }

    /// Whether this error means "mark the peer unsupported until its next
    /// connect event".
    pub fn is_protocol_unsupported(&self) -> bool {
        matches!(self, NetError::ProtocolUnsupported)
    }
}
