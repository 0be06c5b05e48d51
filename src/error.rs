/// error types surfaced through callbacks and the transport seam
///
use thiserror::Error;

/// Errors that can occur at the message-bus transport layer.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The broker connection is closed or could not be established.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The channel is closed; the caller should re-acquire one.
    #[error("channel closed")]
    ChannelClosed,

    /// Publish referenced an exchange that was never declared.
    #[error("unknown exchange: {0}")]
    UnknownExchange(String),

    /// Consume referenced a queue that was never declared.
    #[error("unknown queue: {0}")]
    UnknownQueue(String),
}

/// Errors delivered to cache callers, always through a callback's error
/// path -- no facade method returns these for queue or bus failures.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// A bus-level failure aborted the operation.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The response body could not be decoded into the requested type.
    #[error("decode error: {0}")]
    Decode(String),

    /// No response arrived within the configured load timeout.
    #[error("load timed out")]
    Timeout,

    /// The operation exists in the cache contract but is not supported.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        let err = CacheError::Decode("bad payload".to_string());
        assert_eq!(err.to_string(), "decode error: bad payload");

        let err = CacheError::from(TransportError::ChannelClosed);
        assert_eq!(err.to_string(), "transport error: channel closed");

        assert_eq!(CacheError::Timeout.to_string(), "load timed out");
    }

    #[test]
    fn clonable() {
        let err = CacheError::Timeout;
        let copy = err.clone();
        assert!(matches!(copy, CacheError::Timeout));
    }
}
