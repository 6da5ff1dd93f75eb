//! Socket object (C5): owns the fd/handle, type, event state, connect
//! state, recv quota and error slot, and exposes the public contract of
//! spec.md §4.5. Split by OS (`unix` vs `windows`), since the two backends
//! genuinely differ in what a registration and a readiness notification
//! look like (spec.md §9 design notes).

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::Socket;
#[cfg(windows)]
pub use windows::Socket;

/// Stream or datagram. Fixed at `open`/`accept` time; never changes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Kind {
    Stream,
    Dgram,
}

impl Kind {
    pub(crate) fn to_socket2(self) -> socket2::Type {
        match self {
            Kind::Stream => socket2::Type::STREAM,
            Kind::Dgram => socket2::Type::DGRAM,
        }
    }

    pub(crate) fn is_dgram(self) -> bool {
        matches!(self, Kind::Dgram)
    }
}

/// Connect state machine (spec.md §3/§9): `connect_state == Completed` is
/// only reachable by way of `InProgress` (invariant 4), never straight from
/// `Idle`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub(crate) enum ConnectState {
    #[default]
    Idle,
    InProgress,
    Completed,
}
