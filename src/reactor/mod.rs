//! The reactor is an external collaborator (spec.md §1, §6): this crate only
//! defines the contract it must satisfy and, for each OS, one reference
//! implementation that lets the crate be exercised standalone.
//!
//! Picking the backend statically per target OS (rather than behind a
//! runtime `dyn` on the OS dimension) gives two concrete strategies behind
//! one adapter interface, chosen with `#[cfg]`.

#[cfg(unix)]
pub mod posix;
#[cfg(windows)]
pub mod win;

#[cfg(unix)]
pub use posix::{MioReactor, RawReady, Reactor};
#[cfg(windows)]
pub use win::{EventReactor, WindowsReactor};
