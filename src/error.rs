//! Error types for the SOCKS5 engine

use std::io;
use thiserror::Error;

use crate::protocol::ReplyCode;

/// Coarse classification of a [`SocksError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed, incomplete or unsupported wire message
    Protocol,
    /// Bad credentials or no acceptable method
    Authentication,
    /// CONNECT/BIND could not reach or accept its peer
    Network,
    /// I/O failure on an established relay
    Relay,
    /// Could not allocate a listening or relay socket
    Resource,
    /// Session was closed underneath the operation
    Closed,
}

/// Main error type of the SOCKS5 engine
#[derive(Error, Debug)]
pub enum SocksError {
    /// Stream ended in the middle of a message
    #[error("incomplete message: stream closed while reading {0}")]
    IncompleteMessage(&'static str),

    #[error("unsupported SOCKS version: {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("unsupported address type: {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("UDP fragmentation not supported (frag={0})")]
    Fragmented(u8),

    /// Any other malformed message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A command reply other than SUCCEEDED was sent or received
    #[error("request rejected: {0:?}")]
    Rejected(ReplyCode),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("no acceptable authentication methods")]
    NoAcceptableMethods,

    #[error("network error ({reply:?}): {source}")]
    Network {
        reply: ReplyCode,
        #[source]
        source: io::Error,
    },

    #[error("relay error: {0}")]
    Relay(#[source] io::Error),

    #[error("resource error: {0}")]
    Resource(#[source] io::Error),

    /// A lifecycle hook refused the session
    #[error("session aborted: {0}")]
    Aborted(String),

    #[error("session closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for SocksError
pub type Result<T> = std::result::Result<T, SocksError>;

impl SocksError {
    /// network builds a NetworkError carrying the reply code sent to the client
    pub fn network(reply: ReplyCode, source: io::Error) -> Self {
        SocksError::Network { reply, source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SocksError::IncompleteMessage(_)
            | SocksError::UnsupportedVersion(_)
            | SocksError::UnsupportedAddressType(_)
            | SocksError::Fragmented(_)
            | SocksError::Protocol(_)
            | SocksError::Io(_) => ErrorKind::Protocol,
            SocksError::Rejected(code) => match code {
                ReplyCode::CommandNotSupported | ReplyCode::AddrTypeUnsupported => {
                    ErrorKind::Protocol
                }
                ReplyCode::ServerFailure => ErrorKind::Resource,
                _ => ErrorKind::Network,
            },
            SocksError::Authentication(_) | SocksError::NoAcceptableMethods => {
                ErrorKind::Authentication
            }
            SocksError::Network { .. } => ErrorKind::Network,
            SocksError::Relay(_) => ErrorKind::Relay,
            SocksError::Resource(_) => ErrorKind::Resource,
            SocksError::Aborted(_) | SocksError::Closed => ErrorKind::Closed,
        }
    }

    /// reply_code returns the REP byte that best describes this error
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            SocksError::UnsupportedAddressType(_) => ReplyCode::AddrTypeUnsupported,
            SocksError::Rejected(code) => *code,
            SocksError::Network { reply, .. } => *reply,
            _ => ReplyCode::ServerFailure,
        }
    }
}

/// reply_for_io_error maps an outbound connect/accept failure onto a reply code
pub fn reply_for_io_error(err: &io::Error) -> ReplyCode {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
        io::ErrorKind::TimedOut => ReplyCode::TtlExpired,
        io::ErrorKind::NetworkUnreachable => ReplyCode::NetworkUnreachable,
        io::ErrorKind::HostUnreachable | io::ErrorKind::NotFound => ReplyCode::HostUnreachable,
        io::ErrorKind::PermissionDenied => ReplyCode::ConnectionNotAllowed,
        _ => ReplyCode::ServerFailure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_failures_map_to_reply_codes() {
        let cases = [
            (io::ErrorKind::ConnectionRefused, ReplyCode::ConnectionRefused),
            (io::ErrorKind::TimedOut, ReplyCode::TtlExpired),
            (io::ErrorKind::NetworkUnreachable, ReplyCode::NetworkUnreachable),
            (io::ErrorKind::HostUnreachable, ReplyCode::HostUnreachable),
            (io::ErrorKind::BrokenPipe, ReplyCode::ServerFailure),
        ];
        for (kind, expected) in cases {
            assert_eq!(reply_for_io_error(&io::Error::from(kind)), expected);
        }
    }

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(SocksError::IncompleteMessage("x").kind(), ErrorKind::Protocol);
        assert_eq!(SocksError::NoAcceptableMethods.kind(), ErrorKind::Authentication);
        assert_eq!(
            SocksError::Resource(io::Error::other("x")).reply_code(),
            ReplyCode::ServerFailure
        );
        let refused = SocksError::network(
            ReplyCode::ConnectionRefused,
            io::Error::from(io::ErrorKind::ConnectionRefused),
        );
        assert_eq!(refused.kind(), ErrorKind::Network);
        assert_eq!(refused.reply_code(), ReplyCode::ConnectionRefused);
    }
}
