//! Socket creation options: a `Copy` builder struct with chainable
//! `with_*` setters and a `Default`.

/// Options applied at [`crate::socket::Socket::open_with`] time.
#[derive(Debug, Clone, Copy)]
pub struct SocketOptions {
    /// Attempt `SO_REUSEADDR` before `bind` (stream sockets only, best-effort).
    pub reuse_addr: bool,
    /// Attempt `SO_REUSEPORT` before `bind`, where supported (best-effort).
    pub reuse_port: bool,
    /// `SO_SNDBUF` override, or `None` to leave the OS default.
    pub send_buf_size: Option<usize>,
    /// `SO_RCVBUF` override, or `None` to leave the OS default.
    pub recv_buf_size: Option<usize>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            reuse_addr: true,
            reuse_port: false,
            send_buf_size: None,
            recv_buf_size: None,
        }
    }
}

impl SocketOptions {
    #[must_use]
    pub fn with_reuse_addr(mut self, reuse_addr: bool) -> Self {
        self.reuse_addr = reuse_addr;
        self
    }

    #[must_use]
    pub fn with_reuse_port(mut self, reuse_port: bool) -> Self {
        self.reuse_port = reuse_port;
        self
    }

    #[must_use]
    pub fn with_send_buf_size(mut self, size: usize) -> Self {
        self.send_buf_size = Some(size);
        self
    }

    #[must_use]
    pub fn with_recv_buf_size(mut self, size: usize) -> Self {
        self.recv_buf_size = Some(size);
        self
    }
}

/// `listen(backlog)` uses this when `backlog < 0` is passed, per spec.md §4.5.
pub const DEFAULT_BACKLOG: i32 = 1024;
