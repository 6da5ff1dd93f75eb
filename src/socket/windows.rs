//! Windows `Socket` (C5): the handle-owning half of the public contract,
//! backed by [`crate::reactor::win::WindowsReactor`] and the classic
//! `WSAEventSelect`/`WSAEnumNetworkEvents` model (spec.md §4.3, §6).
//!
//! Where the POSIX side masks raw readable/writable readiness against
//! `wait_events` to recover the logical event, this side asks Winsock
//! directly: `WSAEventSelect` only ever arms the FD_* bits the socket
//! currently wants, and `WSAEnumNetworkEvents` reports exactly which of
//! those fired (plus, for FD_CONNECT, the completion error code in the same
//! call) -- so there is no raw-readiness layer to translate here.

use std::{
    cell::{Cell, RefCell},
    io,
    mem::MaybeUninit,
    os::windows::io::AsRawSocket,
    rc::Rc,
};

use windows_sys::Win32::Networking::WinSock::{
    self, FD_ACCEPT, FD_CONNECT, FD_CONNECT_BIT, FD_READ, FD_WRITE, SOCKET, WSACreateEvent, WSAEnumNetworkEvents,
    WSAEventSelect, WSANETWORKEVENTS, WSA_INVALID_EVENT,
};

use crate::{
    addr::{Addr, IpHint},
    dispatch::{Handlers, Liveness},
    error::{map_error, map_setup_error, ErrorKind, OpFamily, SockResult, SocketError},
    events::{Event, EventSet, IoPhase},
    init,
    options::SocketOptions,
    pktinfo,
    reactor::win::WindowsReactor,
};

use super::{ConnectState, Kind};

struct MutableState {
    wait_events: EventSet,
    phase: IoPhase,
    connect_state: ConnectState,
    connect_result: Option<ErrorKind>,
    last_error: ErrorKind,
    recv_max: i64,
    recv_num: u64,
}

impl Default for MutableState {
    fn default() -> Self {
        MutableState {
            wait_events: EventSet::EMPTY,
            phase: IoPhase::Idle,
            connect_state: ConnectState::Idle,
            connect_result: None,
            last_error: ErrorKind::None,
            recv_max: -1,
            recv_num: 0,
        }
    }
}

struct Inner<R> {
    reactor: R,
    sock: RefCell<Option<socket2::Socket>>,
    event_obj: WinSock::WSAEVENT,
    token: Cell<Option<usize>>,
    kind: Kind,
    have_pktinfo: bool,
    reuse_addr: bool,
    reuse_port: bool,
    state: RefCell<MutableState>,
    handlers: RefCell<Handlers>,
    liveness: Liveness,
}

/// The Windows socket handle (spec.md §3/§4.5). See [`super::unix::Socket`]
/// for the shared shape; this struct differs only in the backend-interest
/// wiring.
pub struct Socket<R> {
    inner: Rc<Inner<R>>,
}

impl<R> Clone for Socket<R> {
    fn clone(&self) -> Self {
        Socket { inner: self.inner.clone() }
    }
}

/// Bitmask of FD_* events `WSAEventSelect` should arm for `mask`. Unlike the
/// POSIX side there is no empty-interest restriction: selecting zero events
/// is legal and simply means the event object never signals.
fn network_events(mask: EventSet) -> i32 {
    let mut bits = 0i32;
    if mask.contains(Event::Read) {
        bits |= FD_READ;
    }
    if mask.contains(Event::Write) {
        bits |= FD_WRITE;
    }
    if mask.contains(Event::Accept) {
        bits |= FD_ACCEPT;
    }
    if mask.contains(Event::Connect) {
        bits |= FD_CONNECT;
    }
    bits
}

impl<R: WindowsReactor + Clone + 'static> Socket<R> {
    pub fn open(reactor: R, domain: socket2::Domain, kind: Kind) -> SockResult<Self> {
        Self::open_with(reactor, domain, kind, SocketOptions::default())
    }

    pub fn open_with(reactor: R, domain: socket2::Domain, kind: Kind, opts: SocketOptions) -> SockResult<Self> {
        init::ensure_initialized()?;

        let sock = socket2::Socket::new(domain, kind.to_socket2(), None).map_err(map_setup_error)?;

        if let Some(size) = opts.send_buf_size {
            if let Err(e) = sock.set_send_buffer_size(size) {
                tracing::warn!(error = %e, "SO_SNDBUF override failed");
            }
        }
        if let Some(size) = opts.recv_buf_size {
            if let Err(e) = sock.set_recv_buffer_size(size) {
                tracing::warn!(error = %e, "SO_RCVBUF override failed");
            }
        }

        let have_pktinfo = if kind.is_dgram() {
            pktinfo::try_enable(&sock, domain == socket2::Domain::IPV6)
        } else {
            false
        };

        Self::from_parts(reactor, sock, kind, have_pktinfo, opts.reuse_addr, opts.reuse_port)
    }

    fn from_parts(
        reactor: R,
        sock: socket2::Socket,
        kind: Kind,
        have_pktinfo: bool,
        reuse_addr: bool,
        reuse_port: bool,
    ) -> SockResult<Self> {
        let event_obj = unsafe { WSACreateEvent() };
        if event_obj == WSA_INVALID_EVENT {
            return Err(map_setup_error(io::Error::last_os_error()));
        }

        // `WSAEventSelect` implicitly switches the socket into non-blocking
        // mode; `set_nonblocking` is still called so that a future
        // `WSAEventSelect(..., 0)` (all events cleared) does not revert it.
        if let Err(e) = sock.set_nonblocking(true) {
            unsafe { WinSock::WSACloseEvent(event_obj) };
            return Err(map_setup_error(e));
        }

        let inner = Rc::new(Inner {
            reactor: reactor.clone(),
            sock: RefCell::new(Some(sock)),
            event_obj,
            token: Cell::new(None),
            kind,
            have_pktinfo,
            reuse_addr,
            reuse_port,
            state: RefCell::new(MutableState::default()),
            handlers: RefCell::new(Handlers::default()),
            liveness: Liveness::new(),
        });

        let weak = Rc::downgrade(&inner);
        let callback: Rc<dyn Fn()> = Rc::new(move || {
            if let Some(inner) = weak.upgrade() {
                Socket::<R>::on_signal(&inner);
            }
        });

        let token = reactor.register_handle(event_obj, callback).map_err(map_setup_error)?;
        reactor.enable(token).map_err(map_setup_error)?;
        inner.token.set(Some(token));

        tracing::debug!(?kind, have_pktinfo, "socket opened");
        Ok(Socket { inner })
    }

    fn with_sock<T>(&self, f: impl FnOnce(&socket2::Socket) -> SockResult<T>) -> SockResult<T> {
        if !self.inner.liveness.is_alive() {
            return Err(SocketError::new(ErrorKind::Unknown));
        }
        let guard = self.inner.sock.borrow();
        match guard.as_ref() {
            Some(s) => f(s),
            None => Err(SocketError::new(ErrorKind::Unknown)),
        }
    }

    fn reprogram_backend(&self) {
        let mask = self.inner.state.borrow().wait_events;
        let guard = self.inner.sock.borrow();
        let Some(sock) = guard.as_ref() else { return };
        let rc = unsafe {
            WSAEventSelect(sock.as_raw_socket() as SOCKET, self.inner.event_obj, network_events(mask))
        };
        if rc != 0 {
            tracing::warn!(error = %io::Error::last_os_error(), "WSAEventSelect failed");
        }
    }

    fn on_signal(inner: &Rc<Inner<R>>) {
        if !inner.liveness.is_alive() {
            return;
        }
        let sock_raw = {
            let guard = inner.sock.borrow();
            match guard.as_ref() {
                Some(s) => s.as_raw_socket() as SOCKET,
                None => return,
            }
        };

        let mut net_events: WSANETWORKEVENTS = unsafe { std::mem::zeroed() };
        let rc = unsafe { WSAEnumNetworkEvents(sock_raw, inner.event_obj, &mut net_events) };
        if rc != 0 {
            tracing::warn!(error = %io::Error::last_os_error(), "WSAEnumNetworkEvents failed");
            return;
        }

        let logical = {
            let mut st = inner.state.borrow_mut();
            let mut set = EventSet::EMPTY;
            let bits = net_events.lNetworkEvents;

            if bits & FD_READ != 0 && st.wait_events.contains(Event::Read) {
                set |= Event::Read.into();
            }
            if bits & FD_WRITE != 0 && st.wait_events.contains(Event::Write) {
                set |= Event::Write.into();
            }
            if bits & FD_ACCEPT != 0 && st.wait_events.contains(Event::Accept) {
                set |= Event::Accept.into();
            }
            if bits & FD_CONNECT != 0 {
                if st.connect_state == ConnectState::InProgress {
                    let code = net_events.iErrorCode[FD_CONNECT_BIT as usize];
                    let raw = if code == 0 { None } else { Some(io::Error::from_raw_os_error(code)) };
                    let result = crate::error::map_connect_result(raw);
                    st.connect_result = Some(result.kind());
                    st.connect_state = ConnectState::Completed;
                    tracing::debug!(kind = ?result.kind(), "connect completed");
                }
                if st.wait_events.contains(Event::Connect) {
                    set |= Event::Connect.into();
                }
            }

            st.recv_num = 0;
            set
        };

        if logical.is_empty() {
            return;
        }
        inner.handlers.borrow_mut().dispatch(logical, &inner.liveness);
    }

    pub fn close(&self) {
        if !self.inner.liveness.is_alive() {
            return;
        }
        self.inner.liveness.kill();
        if let Some(token) = self.inner.token.take() {
            if let Err(e) = self.inner.reactor.remove_handle(token) {
                tracing::warn!(error = %e, "failed to remove event handle from reactor");
            }
        }
        self.inner.sock.borrow_mut().take();
        tracing::debug!("socket closed");
    }

    pub fn set_recv_max(&self, n: i64) {
        self.inner.state.borrow_mut().recv_max = n;
    }

    pub fn install_global_handler(&self, f: impl FnMut(EventSet) + 'static) {
        self.inner.handlers.borrow_mut().install_global(Box::new(f));
    }

    pub fn remove_global_handler(&self) {
        self.inner.handlers.borrow_mut().remove_global();
        self.inner.state.borrow_mut().wait_events = EventSet::EMPTY;
        self.inner.state.borrow_mut().phase = IoPhase::Idle;
        self.reprogram_backend();
    }

    pub fn install_event_handler(&self, ev: Event, f: impl FnMut() + 'static) {
        self.inner.handlers.borrow_mut().install_event(ev, Box::new(f));
    }

    pub fn remove_event_handler(&self, ev: Event) {
        self.inner.handlers.borrow_mut().remove_event(ev);
        let was_enabled = self.inner.state.borrow().wait_events.contains(ev);
        if was_enabled {
            self.disable_event(ev);
        }
    }

    pub fn set_global_events(&self, mask: EventSet) {
        assert!(
            self.inner.handlers.borrow().is_global(),
            "set_global_events requires a global handler to be installed"
        );
        let mut phase = IoPhase::Idle;
        for ev in mask.iter() {
            phase = phase
                .with_event(ev)
                .expect("set_global_events: mask mixes incompatible event families (invariant 3)");
        }
        {
            let mut st = self.inner.state.borrow_mut();
            st.wait_events = mask;
            st.phase = phase;
        }
        self.reprogram_backend();
    }

    pub fn enable_event(&self, ev: Event) {
        assert!(
            self.inner.handlers.borrow().has_handler_for(ev),
            "enable_event({ev:?}): no handler installed"
        );
        {
            let mut st = self.inner.state.borrow_mut();
            let new_phase = st
                .phase
                .with_event(ev)
                .expect("enable_event: incompatible with the socket's current lifecycle phase (invariant 3)");
            st.phase = new_phase;
            st.wait_events |= ev.into();
        }
        self.reprogram_backend();
    }

    pub fn disable_event(&self, ev: Event) {
        {
            let mut st = self.inner.state.borrow_mut();
            st.wait_events = st.wait_events.without(ev);
            if st.wait_events.is_empty() {
                st.phase = IoPhase::Idle;
            }
        }
        self.reprogram_backend();
    }

    pub fn connect(&self, addr: Addr) -> SockResult<()> {
        assert!(
            self.inner.state.borrow().connect_state == ConnectState::Idle,
            "connect: connect_state must be Idle"
        );
        let result = self.with_sock(|s| s.connect(&addr.to_os()).map_err(|e| map_error(OpFamily::Connect, e)));
        match result {
            Ok(()) => {
                self.inner.state.borrow_mut().last_error = ErrorKind::None;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::InProgress => {
                let mut st = self.inner.state.borrow_mut();
                st.connect_state = ConnectState::InProgress;
                st.last_error = ErrorKind::InProgress;
                Err(e)
            }
            Err(e) => {
                self.inner.state.borrow_mut().last_error = e.kind();
                Err(e)
            }
        }
    }

    pub fn get_connect_result(&self) -> SockResult<()> {
        let mut st = self.inner.state.borrow_mut();
        assert!(
            st.connect_state == ConnectState::Completed,
            "get_connect_result: connect_state must be Completed"
        );
        let kind = st.connect_result.take().unwrap_or(ErrorKind::Unknown);
        st.connect_state = ConnectState::Idle;
        if kind == ErrorKind::None {
            Ok(())
        } else {
            Err(SocketError::new(kind))
        }
    }

    pub fn bind(&self, addr: Addr) -> SockResult<()> {
        if self.inner.kind == Kind::Stream && self.inner.reuse_addr {
            if let Err(e) = self.with_sock(|s| s.set_reuse_address(true).map_err(map_setup_error)) {
                tracing::warn!(error = %e, "SO_REUSEADDR failed");
            }
        }
        if self.inner.reuse_port {
            if let Err(e) = self.with_sock(|s| s.set_reuse_port(true).map_err(map_setup_error)) {
                tracing::warn!(error = %e, "SO_REUSEPORT failed");
            }
        }
        self.with_sock(|s| s.bind(&addr.to_os()).map_err(|e| map_error(OpFamily::Bind, e)))
    }

    pub fn listen(&self, backlog: i32) -> SockResult<()> {
        let backlog = if backlog < 0 { crate::options::DEFAULT_BACKLOG } else { backlog };
        self.with_sock(|s| s.listen(backlog).map_err(|e| map_error(OpFamily::Listen, e)))
    }

    pub fn accept(&self, keep: bool) -> SockResult<(Option<Socket<R>>, Addr)> {
        let (accepted, os_addr) =
            self.with_sock(|s| s.accept().map_err(|e| map_error(OpFamily::Io { dgram: false }, e)))?;
        let addr = Addr::from_os(&os_addr)?;
        if !keep {
            drop(accepted);
            return Ok((None, addr));
        }
        let new_socket = Self::from_parts(self.inner.reactor.clone(), accepted, self.inner.kind, false, true, false)?;
        Ok((Some(new_socket), addr))
    }

    fn quota_ok(&self) -> bool {
        let mut st = self.inner.state.borrow_mut();
        if st.recv_max >= 0 && st.recv_num >= st.recv_max as u64 {
            return false;
        }
        st.recv_num += 1;
        true
    }

    pub fn send(&self, buf: &[u8]) -> SockResult<usize> {
        let dgram = self.inner.kind.is_dgram();
        self.with_sock(|s| s.send(buf).map_err(|e| map_error(OpFamily::Io { dgram }, e)))
    }

    pub fn recv(&self, buf: &mut [u8]) -> SockResult<usize> {
        if !self.quota_ok() {
            return Err(SocketError::new(ErrorKind::Later));
        }
        let dgram = self.inner.kind.is_dgram();
        self.with_sock(|s| {
            let uninit = unsafe { std::slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut MaybeUninit<u8>, buf.len()) };
            s.recv(uninit).map_err(|e| map_error(OpFamily::Io { dgram }, e))
        })
    }

    pub fn send_to(&self, addr: Addr, buf: &[u8]) -> SockResult<usize> {
        self.with_sock(|s| s.send_to(buf, &addr.to_os()).map_err(|e| map_error(OpFamily::Io { dgram: true }, e)))
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> SockResult<(usize, Addr)> {
        if !self.quota_ok() {
            return Err(SocketError::new(ErrorKind::Later));
        }
        self.recv_from_no_quota(buf)
    }

    fn recv_from_no_quota(&self, buf: &mut [u8]) -> SockResult<(usize, Addr)> {
        self.with_sock(|s| {
            let uninit = unsafe { std::slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut MaybeUninit<u8>, buf.len()) };
            let (n, os_addr) = s.recv_from(uninit).map_err(|e| map_error(OpFamily::Io { dgram: true }, e))?;
            Ok((n, Addr::from_os(&os_addr)?))
        })
    }

    pub fn send_to_from(&self, remote: Addr, local_hint: IpHint, buf: &[u8]) -> SockResult<usize> {
        if !self.inner.have_pktinfo {
            return self.send_to(remote, buf);
        }
        self.with_sock(|s| pktinfo::send_to_from(s, remote, local_hint, buf))
    }

    pub fn recv_from_to(&self, buf: &mut [u8]) -> SockResult<(usize, Addr, IpHint)> {
        if !self.quota_ok() {
            return Err(SocketError::new(ErrorKind::Later));
        }
        if !self.inner.have_pktinfo {
            let (n, addr) = self.recv_from_no_quota(buf)?;
            return Ok((n, addr, IpHint::None));
        }
        self.with_sock(|s| pktinfo::recv_from_to(s, buf))
    }

    pub fn have_pktinfo(&self) -> bool {
        self.inner.have_pktinfo
    }

    pub fn kind(&self) -> Kind {
        self.inner.kind
    }

    pub fn last_error(&self) -> ErrorKind {
        self.inner.state.borrow().last_error
    }
}

impl<R: WindowsReactor> Drop for Inner<R> {
    fn drop(&mut self) {
        self.liveness.kill();
        if let Some(token) = self.token.take() {
            let _ = self.reactor.remove_handle(token);
        }
        // `remove_handle` closes `event_obj` itself (spec.md §6); nothing
        // further to release here beyond the socket, which `RefCell::drop`
        // already handles.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::win::EventReactor;

    #[test]
    fn open_close_udp() {
        let r = EventReactor::new().unwrap();
        let s = Socket::open(r, socket2::Domain::IPV4, Kind::Dgram).unwrap();
        s.close();
    }

    #[test]
    fn recv_max_zero_blocks_immediately() {
        let r = EventReactor::new().unwrap();
        let s = Socket::open(r, socket2::Domain::IPV4, Kind::Dgram).unwrap();
        s.bind(Addr::from("127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap())).unwrap();
        s.set_recv_max(0);
        let mut buf = [0u8; 16];
        let err = s.recv_from(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Later);
    }
}
