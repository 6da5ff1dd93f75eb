//! Global process init (C7): one-time startup performed before any socket is
//! opened. A scoped acquisition with guaranteed, idempotent-at-most-once
//! teardown (spec.md §9 design notes), backed by `once_cell` to gate the
//! one-time setup path.

use once_cell::sync::OnceCell;

static INIT: OnceCell<()> = OnceCell::new();

/// Performs process-wide socket library init exactly once. Safe to call
/// repeatedly; only the first call does anything. On Windows this requests
/// Winsock v2.2 and verifies the version the OS actually negotiated; on
/// POSIX there is nothing to do.
pub fn ensure_initialized() -> Result<(), crate::error::SocketError> {
    let mut result = Ok(());
    INIT.get_or_init(|| {
        result = platform::init();
    });
    result
}

#[cfg(unix)]
mod platform {
    pub(super) fn init() -> Result<(), crate::error::SocketError> {
        Ok(())
    }
}

#[cfg(windows)]
mod platform {
    use windows_sys::Win32::Networking::WinSock::{WSAStartup, WSADATA};

    use crate::error::{ErrorKind, SocketError};

    pub(super) fn init() -> Result<(), SocketError> {
        const REQUESTED: u16 = 0x0202; // Winsock v2.2, high byte = minor, low byte = major.
        let mut data: WSADATA = unsafe { std::mem::zeroed() };
        let rc = unsafe { WSAStartup(REQUESTED, &mut data) };
        if rc != 0 {
            return Err(SocketError::from_io(ErrorKind::Unknown, std::io::Error::from_raw_os_error(rc)));
        }
        if data.wVersion != REQUESTED {
            tracing::warn!(
                negotiated = data.wVersion,
                requested = REQUESTED,
                "Winsock negotiated a different version than requested"
            );
            return Err(SocketError::new(ErrorKind::Unknown));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        ensure_initialized().unwrap();
        ensure_initialized().unwrap();
    }
}
