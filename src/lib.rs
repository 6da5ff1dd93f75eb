//! `evio`: a portable non-blocking socket core integrated with a
//! reactor-style event loop.
//!
//! A [`socket::Socket`] wraps one OS socket (stream or datagram) plus the
//! bookkeeping a reactor-driven, single-threaded event loop needs around it:
//! its current event-lifecycle phase, a non-blocking `connect` state
//! machine, a bounded-per-dispatch recv quota, and a handler table that is
//! either one global callback or up to one callback per logical event
//! (read/write/accept/connect). Datagram sockets additionally support
//! stamping and recovering the local IP a packet was sent from or delivered
//! to, via `IP_PKTINFO`/`IPV6_PKTINFO` ancillary messages where the
//! platform supports them.
//!
//! The crate does not ship an event loop of its own to drive applications;
//! it defines the [`reactor::posix::Reactor`] (POSIX) / [`reactor::win::WindowsReactor`]
//! (Windows) contract a reactor must satisfy, and ships one reference
//! implementation per OS ([`reactor::MioReactor`] / [`reactor::EventReactor`])
//! so the crate can be exercised and tested standalone.
#![warn(missing_docs, unreachable_pub)]

pub mod addr;
mod dispatch;
pub mod error;
pub mod events;
mod init;
pub mod options;
mod pktinfo;
pub mod reactor;
pub mod socket;
pub(crate) mod utils;

pub use addr::{Addr, IpHint};
pub use error::{ErrorKind, SocketError};
pub use events::{Event, EventSet};
pub use init::ensure_initialized;
pub use options::SocketOptions;
pub use socket::{Kind, Socket};

#[cfg(unix)]
pub use reactor::{MioReactor, RawReady, Reactor};
#[cfg(windows)]
pub use reactor::{EventReactor, WindowsReactor};
