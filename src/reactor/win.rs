//! Windows reference reactor (spec.md §6): a `WaitForMultipleObjectsEx`
//! loop over per-socket `WSAEVENT` handles, the classic `WSAEventSelect` /
//! `WSAEnumNetworkEvents` model spec.md §4.3 describes (register_handle /
//! enable; FD_READ/FD_WRITE/FD_ACCEPT/FD_CONNECT bits select which
//! notifications signal the event object).
//!
//! Unlike an IOCP/AFD-poll backend, which emulates readiness on top of a
//! single completion port shared by both overlapped I/O and poll-style
//! sockets, this reactor only needs the plain event-object wait spec.md
//! §2/§6 actually asks for, so it is built directly on `WSAEventSelect`
//! rather than the AFD poll trick. Decoding *which* FD_* bits fired
//! (`WSAEnumNetworkEvents`) is the socket's own job (spec.md §4.3's backend
//! adapter), since that call needs the `SOCKET` handle, which this reactor
//! deliberately does not own; it only knows about the bare event object.

use std::{cell::RefCell, io, rc::Rc, time::Duration};

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, WAIT_FAILED, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows_sys::Win32::System::Threading::WaitForMultipleObjectsEx;

use crate::utils::slab::Slab;

/// The Windows collaborator contract (spec.md §6): `register_handle` /
/// `enable_handle` / `remove_handle`.
pub trait WindowsReactor {
    /// Registers an already-created `WSAEVENT` for waiting, returning an
    /// opaque registration id. `callback` is invoked with no arguments when
    /// the handle signals; the socket itself calls `WSAEnumNetworkEvents`
    /// to find out which FD_* bits fired.
    fn register_handle(&self, event_obj: HANDLE, callback: Rc<dyn Fn()>) -> io::Result<usize>;

    /// Marks a registration active; spec.md §6 names this `enable` as a
    /// distinct step from registration (the actual FD_* selection happens
    /// via `WSAEventSelect`, issued by the socket itself since that call
    /// needs the `SOCKET`, not just the event object).
    fn enable(&self, token: usize) -> io::Result<()>;

    fn remove_handle(&self, token: usize) -> io::Result<()>;
}

struct Registration {
    handle: HANDLE,
    callback: Rc<dyn Fn()>,
    enabled: bool,
}

struct Inner {
    slab: Slab<Registration>,
}

/// `WaitForMultipleObjectsEx`-backed reference reactor. `Clone` shares the
/// same registration slab, the way a `Socket<R>` hands its reactor to an
/// accepted connection's `Socket<R>`.
#[derive(Clone)]
pub struct EventReactor {
    inner: Rc<RefCell<Inner>>,
}

impl EventReactor {
    pub fn new() -> io::Result<Self> {
        Ok(EventReactor {
            inner: Rc::new(RefCell::new(Inner { slab: Slab::new() })),
        })
    }

    /// Waits up to `timeout` (`None` = indefinitely) for any registered,
    /// enabled event object to signal, then invokes that registration's
    /// callback. Services at most one handle per call, mirroring a single
    /// reactor tick; callers loop this the way they loop `MioReactor::poll`.
    pub fn poll(&self, timeout: Option<Duration>) -> io::Result<()> {
        let handles: Vec<HANDLE> = {
            let inner = self.inner.borrow();
            inner.slab.iter().filter(|(_, r)| r.enabled).map(|(_, r)| r.handle).collect()
        };
        if handles.is_empty() {
            if let Some(d) = timeout {
                std::thread::sleep(d);
            }
            return Ok(());
        }

        let millis = timeout.map(|d| d.as_millis() as u32).unwrap_or(u32::MAX);
        let rc = unsafe { WaitForMultipleObjectsEx(handles.len() as u32, handles.as_ptr(), 0, millis, 0) };
        if rc == WAIT_TIMEOUT {
            return Ok(());
        }
        if rc == WAIT_FAILED {
            return Err(io::Error::last_os_error());
        }
        let index = (rc.wrapping_sub(WAIT_OBJECT_0)) as usize;
        let Some(&signaled) = handles.get(index) else {
            return Ok(());
        };

        let callback = {
            let inner = self.inner.borrow();
            inner.slab.iter().find(|(_, r)| r.handle == signaled).map(|(_, r)| r.callback.clone())
        };
        if let Some(callback) = callback {
            callback();
        }
        Ok(())
    }
}

impl WindowsReactor for EventReactor {
    fn register_handle(&self, event_obj: HANDLE, callback: Rc<dyn Fn()>) -> io::Result<usize> {
        let mut inner = self.inner.borrow_mut();
        Ok(inner.slab.insert(Registration {
            handle: event_obj,
            callback,
            enabled: false,
        }))
    }

    fn enable(&self, token: usize) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        if let Some(reg) = inner.slab.get_mut(token) {
            reg.enabled = true;
        }
        Ok(())
    }

    fn remove_handle(&self, token: usize) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        if let Some(reg) = inner.slab.try_remove(token) {
            unsafe { CloseHandle(reg.handle) };
        }
        Ok(())
    }
}
