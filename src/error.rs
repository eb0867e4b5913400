use std::fmt;
use std::io;

/// Failure classes of the receive path.
///
/// None of these are fatal for the device: parse failures deliver the frame
/// without offload annotations, backend violations drop the offending buffer,
/// and resource exhaustion is retried on the next wake. They surface through
/// [`crate::RxStats`] counters and the `log` facade; only configuration and
/// lifecycle errors are returned to the caller, converted into [`io::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxError {
    /// The first buffer of a frame is too short to hold the headers.
    TooSmall,
    /// Not IPv4, or neither TCP nor UDP.
    UnknownProtocol,
    /// Malformed response bounds, id mismatch or a response for an unposted slot.
    BackendProtocolViolation,
    /// No free buffer, request id or grant was available.
    ResourceExhaustion,
    /// The receive path is shutting down.
    ShuttingDown,
    /// A configuration value is out of range.
    InvalidConfig(&'static str),
}

impl fmt::Display for RxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooSmall => write!(f, "first buffer too small for headers"),
            Self::UnknownProtocol => write!(f, "unsupported protocol"),
            Self::BackendProtocolViolation => write!(f, "backend protocol violation"),
            Self::ResourceExhaustion => write!(f, "out of receive resources"),
            Self::ShuttingDown => write!(f, "receive path is shutting down"),
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for RxError {}

impl From<RxError> for io::Error {
    fn from(e: RxError) -> Self {
        let kind = match e {
            RxError::TooSmall | RxError::UnknownProtocol => io::ErrorKind::InvalidData,
            RxError::BackendProtocolViolation => io::ErrorKind::InvalidData,
            RxError::ResourceExhaustion => io::ErrorKind::OutOfMemory,
            RxError::ShuttingDown => io::ErrorKind::NotConnected,
            RxError::InvalidConfig(_) => io::ErrorKind::InvalidInput,
        };
        io::Error::new(kind, e)
    }
}

/// Reports a defect in the backend or in local bookkeeping.
///
/// Production builds log and carry on; `strict` builds stop right here.
pub(crate) fn defect(msg: fmt::Arguments<'_>) {
    log::warn!("{msg}");
    #[cfg(feature = "strict")]
    panic!("{msg}");
}
