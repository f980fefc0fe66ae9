use thiserror::Error;

/// Everything that can go wrong on the receive path or the send path of a connection. None of
///  these is fatal for the engine: they are reported through
///  [`crate::listener::ProtocolListener::on_protocol_error`] or returned to the caller.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A frame header that cannot be parsed, or that declares a payload beyond the configured
    ///  ceiling. The frame is dropped.
    #[error("malformed frame header: {0}")]
    MalformedHeader(String),

    /// The binary header at the start of a version 2+ payload is inconsistent. The message is
    ///  dropped.
    #[error("malformed binary header: {0}")]
    MalformedSubHeader(String),

    /// A data frame that does not fit the single / first / consecutive sequence
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("attempt to send on session {0} prior to the StartService ACK")]
    SendBeforeServiceStarted(u8),

    /// The message-received notification itself failed
    #[error("message delivery failed: {0:#}")]
    DeliveryFailed(anyhow::Error),

    #[error("message of {0} bytes exceeds the maximum message size")]
    MessageTooLarge(usize),

    #[error("transport error: {0:#}")]
    Transport(anyhow::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
