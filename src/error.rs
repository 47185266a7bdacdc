use thiserror::Error;

/// Errors surfaced by the sender API and recorded by its background tasks.
///
/// Failures inside a per-receiver retransmission task are local to that
/// receiver and never become a value of this type for the caller. A lookup
/// miss in the retransmission table is not an error either - it is answered
/// on the wire with a `RETX_REJ` frame.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system error: {0}")]
    System(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Internal signal that the product-index delay queue was disabled,
    /// telling the timer task to exit cleanly.
    #[error("product-index delay queue is disabled")]
    QueueDisabled,

    #[error("sender is not started")]
    NotStarted,
}

impl SendError {
    /// An equivalent error value. The error slot and the caller of a failed
    /// send both need the failure, and `std::io::Error` does not implement
    /// `Clone`.
    pub(crate) fn duplicate(&self) -> SendError {
        match self {
            SendError::InvalidArgument(msg) => SendError::InvalidArgument(msg.clone()),
            SendError::Io(e) => SendError::Io(std::io::Error::new(e.kind(), e.to_string())),
            SendError::System(msg) => SendError::System(msg.clone()),
            SendError::MalformedFrame(msg) => SendError::MalformedFrame(msg.clone()),
            SendError::QueueDisabled => SendError::QueueDisabled,
            SendError::NotStarted => SendError::NotStarted,
        }
    }
}

impl From<bytes::TryGetError> for SendError {
    fn from(e: bytes::TryGetError) -> Self {
        SendError::MalformedFrame(e.to_string())
    }
}
