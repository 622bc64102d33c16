use std::io;
use std::net;

/// Bounded number of retries after a transient provider failure before the
/// session is considered dead.
pub const MAX_ERRORS: u32 = 10;

pub type TransportResult<T> = Result<T, TransportError>;

/// Outcome of a transport operation that could not complete.
///
/// `Wait` means the operation should be retried once the underlying resource
/// makes progress (a full ring, an unavailable provider). Everything else is
/// fatal to the channel or session it occurred on.
#[derive(Debug, Eq, PartialEq)]
pub enum TransportError {
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorType {
    PayloadTooLarge,
    EmptyPayload,
    InvalidPacket,
    BufferState,
    CreditAccounting,
    Resource,
    NotConnected,
    UnknownStream,
    UnknownPeer,
    AddrParse,
    Serialization,
    Io(io::ErrorKind),
}

impl From<io::Error> for TransportError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => TransportError::Wait,
            kind => TransportError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for TransportError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        TransportError::Fatal(ErrorType::AddrParse)
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for TransportResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(TransportError::Wait) => false,
            _ => true,
        }
    }
}

/// Status codes surfaced to user callbacks.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorCode {
    Ok,
    WriteError,
    ReadError,
    Timeout,
    InvalidPacket,
    ConnectError,
    DuplicateOn,
    NotConnected,
}

/// Self-describing encoded payload. The type name is the dispatch key both
/// on the wire and in the handler registries.
///
/// `serialize_into` must fill exactly `byte_size()` bytes; `parse_from` must
/// consume the whole buffer it is given.
pub trait Payload: Sized {
    const TYPE_NAME: &'static str;

    #[inline]
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn byte_size(&self) -> usize;

    fn serialize_into(&self, buf: &mut [u8]) -> TransportResult<()>;

    fn parse_from(buf: &[u8]) -> TransportResult<Self>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wouldblock_folds_to_wait() {
        let err: TransportError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, TransportError::Wait);

        let err: TransportError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert_eq!(
            err,
            TransportError::Fatal(ErrorType::Io(io::ErrorKind::BrokenPipe))
        );
    }

    #[test]
    fn test_wait_is_not_failure() {
        let wait: TransportResult<()> = Err(TransportError::Wait);
        assert!(!wait.has_failed());

        let fatal: TransportResult<()> = Err(TransportError::Fatal(ErrorType::Resource));
        assert!(fatal.has_failed());

        let ok: TransportResult<()> = Ok(());
        assert!(!ok.has_failed());
    }
}
