//! POSIX reference reactor (C3's collaborator, spec.md §6): `mio::Poll`
//! driving a slab of per-fd callbacks (a `Slab<ScheduledIo>`-shaped
//! registration table behind `mio::Poll`), stripped of the task-waking
//! machinery that doesn't apply to a callback API: there is no
//! `Context`/`Waker` here, just "fd became readable/writable, call back
//! whoever registered it".

use std::{cell::RefCell, io, rc::Rc, time::Duration};

use mio::unix::SourceFd;

use crate::utils::slab::Slab;

/// Raw OS readiness delivered to a registration's callback. Intentionally
/// *not* a [`crate::events::EventSet`]: a readable fd might mean `READ` or
/// `ACCEPT` depending on the socket's current `wait_events` (spec.md §4.3),
/// so the ambiguity is resolved one layer up, in `Socket`.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawReady {
    pub readable: bool,
    pub writable: bool,
}

impl RawReady {
    fn from_mio(ev: &mio::event::Event) -> Self {
        RawReady {
            readable: ev.is_readable(),
            writable: ev.is_writable(),
        }
    }

    fn is_empty(self) -> bool {
        !self.readable && !self.writable
    }
}

/// The POSIX collaborator contract (spec.md §6): `register_fd(fd, events)`,
/// `set_fd_events`, `unregister_fd`.
pub trait Reactor {
    /// Registers `fd` for `interest`, returning an opaque registration id.
    /// `callback` is invoked (with readiness masked to the currently-
    /// requested interest) every time the reactor observes readiness.
    fn register_fd(
        &self,
        fd: std::os::unix::io::RawFd,
        interest: mio::Interest,
        callback: Rc<dyn Fn(RawReady)>,
    ) -> io::Result<usize>;

    /// Reprograms the interest mask for an existing registration. Per
    /// spec.md §5 ordering guarantee 3, this takes effect at the *next*
    /// reactor poll, not synchronously.
    fn set_fd_events(
        &self,
        fd: std::os::unix::io::RawFd,
        token: usize,
        interest: mio::Interest,
    ) -> io::Result<()>;

    fn unregister_fd(&self, fd: std::os::unix::io::RawFd, token: usize) -> io::Result<()>;
}

struct Registration {
    callback: Rc<dyn Fn(RawReady)>,
}

struct Inner {
    poll: mio::Poll,
    events: mio::Events,
    slab: Slab<Registration>,
}

/// `mio::Poll`-backed reference reactor. `!Send`/`!Sync` (`Rc`-based),
/// matching the single-threaded cooperative model of spec.md §5. `Clone`
/// shares the same underlying `Poll`/slab, the way a `Socket<R>` needs to
/// hand its reactor to an accepted connection's `Socket<R>`.
#[derive(Clone)]
pub struct MioReactor {
    inner: Rc<RefCell<Inner>>,
}

impl MioReactor {
    pub fn new() -> io::Result<Self> {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> io::Result<Self> {
        Ok(MioReactor {
            inner: Rc::new(RefCell::new(Inner {
                poll: mio::Poll::new()?,
                events: mio::Events::with_capacity(capacity),
                slab: Slab::new(),
            })),
        })
    }

    /// Runs one iteration: blocks up to `timeout` for readiness, then
    /// invokes every fired registration's callback. `None` blocks
    /// indefinitely; `Some(Duration::ZERO)` polls without blocking.
    pub fn poll(&self, timeout: Option<Duration>) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        match inner.poll.poll(&mut inner.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        // Collect (callback, ready) pairs before invoking any of them: a
        // callback may itself call `set_fd_events`/`unregister_fd` and
        // re-borrow `inner`, which `RefCell` would otherwise catch as a
        // double mutable borrow.
        let mut fired = Vec::new();
        for event in inner.events.iter() {
            let ready = RawReady::from_mio(event);
            if ready.is_empty() {
                continue;
            }
            if let Some(reg) = inner.slab.get(event.token().0) {
                fired.push((reg.callback.clone(), ready));
            }
        }
        drop(inner);

        for (callback, ready) in fired {
            callback(ready);
        }
        Ok(())
    }
}

impl Reactor for MioReactor {
    fn register_fd(
        &self,
        fd: std::os::unix::io::RawFd,
        interest: mio::Interest,
        callback: Rc<dyn Fn(RawReady)>,
    ) -> io::Result<usize> {
        let mut inner = self.inner.borrow_mut();
        let token = inner.slab.insert(Registration { callback });
        let mut source = SourceFd(&fd);
        match inner.poll.registry().register(&mut source, mio::Token(token), interest) {
            Ok(()) => Ok(token),
            Err(e) => {
                inner.slab.remove(token);
                Err(e)
            }
        }
    }

    fn set_fd_events(
        &self,
        fd: std::os::unix::io::RawFd,
        token: usize,
        interest: mio::Interest,
    ) -> io::Result<()> {
        let inner = self.inner.borrow();
        let mut source = SourceFd(&fd);
        inner.poll.registry().reregister(&mut source, mio::Token(token), interest)
    }

    fn unregister_fd(&self, fd: std::os::unix::io::RawFd, token: usize) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        let mut source = SourceFd(&fd);
        let result = inner.poll.registry().deregister(&mut source);
        inner.slab.try_remove(token);
        result
    }
}
