//! Error taxonomy for the client.
//!
//! `ErrorMessage` and `InvalidMessage` are the only errors a resolver
//! post-chain may swallow into a completion token; everything else
//! propagates. `Protocol` is fatal to the routing loop; `Connectivity`
//! is recoverable when reconnection is enabled.

/// All failures surfaced by the messaging engine and the session supervisor.
///
/// Variants carry rendered detail strings rather than source errors so the
/// value can be cloned into completion tokens and the send-error signal.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// Missing or invalid configuration; fatal at construction.
    #[error("config error: {0}")]
    Config(String),
    /// Wire format violated or an unexpected greeting/auth shape.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The server rejected the credentials.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// A required field could not be read from or written into a message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    /// The server returned an application-level error in the message body.
    #[error("server error: {0}")]
    ErrorMessage(String),
    /// REST response with a bad status or content type.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    /// Transport-level failure while sending or receiving.
    #[error("connectivity error: {0}")]
    Connectivity(String),
    /// A bounded await elapsed.
    #[error("timed out: {0}")]
    Timeout(String),
    /// The awaited completion token was cancelled.
    #[error("cancelled")]
    Cancelled,
    /// Structural matching descended past the depth budget.
    #[error("recursion limit {0} exceeded")]
    RecursionLimit(usize),
}

impl From<crate::config::ConfigError> for ClientError {
    fn from(e: crate::config::ConfigError) -> Self {
        ClientError::Config(e.to_string())
    }
}
