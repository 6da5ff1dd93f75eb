//! Stable error taxonomy (C2). OS-specific error codes never cross this
//! boundary: every fallible operation maps down to one of the [`ErrorKind`]
//! variants per spec.md §4.2, and the original [`std::io::Error`] is kept
//! only as the `source()` for diagnostics, not as part of the matchable API.

use std::{fmt, io};

/// Stable error taxonomy kinds. Names, not OS codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No error; success.
    None,
    /// A non-blocking `connect` is still in flight.
    InProgress,
    /// The operation would block; retry after the next readiness notification.
    Later,
    AddressNotAvailable,
    AddressInUse,
    AccessDenied,
    ConnectionRefused,
    ConnectionReset,
    ConnectionTimedOut,
    /// An OS error that does not map to any of the above. Never an OS code
    /// itself, just "something else happened".
    Unknown,
}

impl ErrorKind {
    /// `IN_PROGRESS` and `LATER` are not terminal failures: they tell the
    /// caller to wait for reactor readiness and retry (spec.md §7).
    pub fn is_terminal(self) -> bool {
        !matches!(self, ErrorKind::InProgress | ErrorKind::Later | ErrorKind::None)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::None => "no error",
            ErrorKind::InProgress => "operation in progress",
            ErrorKind::Later => "operation would block",
            ErrorKind::AddressNotAvailable => "address not available",
            ErrorKind::AddressInUse => "address in use",
            ErrorKind::AccessDenied => "access denied",
            ErrorKind::ConnectionRefused => "connection refused",
            ErrorKind::ConnectionReset => "connection reset",
            ErrorKind::ConnectionTimedOut => "connection timed out",
            ErrorKind::Unknown => "unknown error",
        };
        f.write_str(s)
    }
}

/// A socket-core error. Carries a stable [`ErrorKind`] plus, when available,
/// the underlying OS error as `source()` for logging; never matched on by
/// callers, since that would reintroduce the OS-specific surface the
/// taxonomy exists to hide.
#[derive(Debug)]
pub struct SocketError {
    kind: ErrorKind,
    source: Option<io::Error>,
}

impl SocketError {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind, source: None }
    }

    pub(crate) fn from_io(kind: ErrorKind, e: io::Error) -> Self {
        Self { kind, source: Some(e) }
    }
}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(e) => write!(f, "{}: {}", self.kind, e),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for SocketError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<ErrorKind> for SocketError {
    fn from(kind: ErrorKind) -> Self {
        SocketError::new(kind)
    }
}

pub(crate) type SockResult<T> = Result<T, SocketError>;

/// Which family of operation produced the error, since the mapping rules
/// differ per spec.md §4.2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OpFamily {
    Connect,
    Bind,
    Listen,
    /// accept / send* / recv*, with whether the socket is a datagram socket
    /// (needed for the CONNECTION_RESET -> CONNECTION_REFUSED remap).
    Io { dgram: bool },
}

pub(crate) fn would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

/// Maps a failure from one of the "critical" setup steps of `open`/`accept`
/// (socket creation, setting non-blocking, reactor registration) that
/// spec.md §7 says must abort the operation and roll back partial state.
/// These don't have a narrower taxonomy in spec.md §4.2, so they always
/// collapse to `Unknown`; the caller still gets the raw `io::Error` as
/// `source()` for logging.
pub(crate) fn map_setup_error(e: io::Error) -> SocketError {
    SocketError::from_io(ErrorKind::Unknown, e)
}

#[cfg(unix)]
mod os {
    use std::io;

    fn code(e: &io::Error) -> Option<i32> {
        e.raw_os_error()
    }

    pub(super) fn is_in_progress(e: &io::Error) -> bool {
        code(e) == Some(libc::EINPROGRESS)
    }

    pub(super) fn is_addr_not_available(e: &io::Error) -> bool {
        code(e) == Some(libc::EADDRNOTAVAIL)
    }

    pub(super) fn is_addr_in_use(e: &io::Error) -> bool {
        code(e) == Some(libc::EADDRINUSE)
    }

    pub(super) fn is_access_denied(e: &io::Error) -> bool {
        matches!(code(e), Some(libc::EACCES) | Some(libc::EPERM))
    }

    pub(super) fn is_conn_refused(e: &io::Error) -> bool {
        code(e) == Some(libc::ECONNREFUSED)
    }

    pub(super) fn is_conn_reset(e: &io::Error) -> bool {
        code(e) == Some(libc::ECONNRESET)
    }

    pub(super) fn is_timed_out(e: &io::Error) -> bool {
        code(e) == Some(libc::ETIMEDOUT)
    }
}

#[cfg(windows)]
mod os {
    use std::io;
    use windows_sys::Win32::Networking::WinSock::{
        WSAEACCES, WSAEADDRINUSE, WSAEADDRNOTAVAIL, WSAECONNREFUSED, WSAECONNRESET,
        WSAETIMEDOUT, WSAEWOULDBLOCK,
    };

    fn code(e: &io::Error) -> Option<i32> {
        e.raw_os_error()
    }

    pub(super) fn is_in_progress(e: &io::Error) -> bool {
        code(e) == Some(WSAEWOULDBLOCK)
    }

    pub(super) fn is_addr_not_available(e: &io::Error) -> bool {
        code(e) == Some(WSAEADDRNOTAVAIL)
    }

    pub(super) fn is_addr_in_use(e: &io::Error) -> bool {
        code(e) == Some(WSAEADDRINUSE)
    }

    pub(super) fn is_access_denied(e: &io::Error) -> bool {
        code(e) == Some(WSAEACCES)
    }

    pub(super) fn is_conn_refused(e: &io::Error) -> bool {
        code(e) == Some(WSAECONNREFUSED)
    }

    pub(super) fn is_conn_reset(e: &io::Error) -> bool {
        code(e) == Some(WSAECONNRESET)
    }

    pub(super) fn is_timed_out(e: &io::Error) -> bool {
        code(e) == Some(WSAETIMEDOUT)
    }
}

/// Returns `true` if a pending non-blocking `connect()` should be treated as
/// in-flight rather than failed.
pub(crate) fn connect_is_pending(e: &io::Error) -> bool {
    would_block(e) || os::is_in_progress(e)
}

/// Maps the completion of a non-blocking connect (e.g. the error retrieved
/// via `SO_ERROR`/the Windows per-event completion code) to a taxonomy kind.
pub(crate) fn map_connect_result(raw: Option<io::Error>) -> SocketError {
    match raw {
        None => SocketError::new(ErrorKind::None),
        Some(e) if os::is_timed_out(&e) => SocketError::from_io(ErrorKind::ConnectionTimedOut, e),
        Some(e) if os::is_conn_refused(&e) => SocketError::from_io(ErrorKind::ConnectionRefused, e),
        Some(e) => SocketError::from_io(ErrorKind::Unknown, e),
    }
}

pub(crate) fn map_error(op: OpFamily, e: io::Error) -> SocketError {
    match op {
        OpFamily::Connect => {
            if connect_is_pending(&e) {
                return SocketError::new(ErrorKind::InProgress);
            }
            map_connect_result(Some(e))
        }
        OpFamily::Bind => {
            if os::is_addr_not_available(&e) {
                SocketError::from_io(ErrorKind::AddressNotAvailable, e)
            } else if os::is_addr_in_use(&e) {
                SocketError::from_io(ErrorKind::AddressInUse, e)
            } else if os::is_access_denied(&e) {
                SocketError::from_io(ErrorKind::AccessDenied, e)
            } else {
                SocketError::from_io(ErrorKind::Unknown, e)
            }
        }
        OpFamily::Listen => {
            if os::is_addr_in_use(&e) {
                SocketError::from_io(ErrorKind::AddressInUse, e)
            } else {
                SocketError::from_io(ErrorKind::Unknown, e)
            }
        }
        OpFamily::Io { dgram } => {
            if would_block(&e) {
                SocketError::new(ErrorKind::Later)
            } else if os::is_conn_reset(&e) {
                // On a connected datagram socket the OS surfaces a prior
                // ICMP-unreachable as ECONNRESET; the actual condition is
                // "peer refused", not "stream closed".
                if dgram {
                    SocketError::from_io(ErrorKind::ConnectionRefused, e)
                } else {
                    SocketError::from_io(ErrorKind::ConnectionReset, e)
                }
            } else if os::is_conn_refused(&e) {
                SocketError::from_io(ErrorKind::ConnectionRefused, e)
            } else {
                SocketError::from_io(ErrorKind::Unknown, e)
            }
        }
    }
}
