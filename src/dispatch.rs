//! Handler table & dispatcher (C4): holds up to one handler per logical
//! event (or one global handler), and safely dispatches a readiness
//! notification across handler-initiated destruction of the socket.
//!
//! The re-entrancy story (spec.md §4.4, §9 design notes) is the liveness
//! token: a cheap `Rc<Cell<bool>>` the dispatcher samples before calling a
//! handler and checks again after. If the handler closed the socket, the
//! token reads dead and dispatch stops touching the socket immediately,
//! skipping any remaining handlers in the fixed order.

use std::{cell::Cell, rc::Rc};

use crate::events::{Event, EventSet};

/// Per-socket liveness sentinel. Cloning it does not keep the socket alive;
/// it only observes whether `close()` has run.
#[derive(Clone, Default)]
pub(crate) struct Liveness(Rc<Cell<bool>>);

impl Liveness {
    pub(crate) fn new() -> Self {
        Liveness(Rc::new(Cell::new(true)))
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.0.get()
    }

    pub(crate) fn kill(&self) {
        self.0.set(false);
    }
}

type GlobalHandler = Box<dyn FnMut(EventSet)>;
type EventHandler = Box<dyn FnMut()>;

/// Invariant 1 (spec.md §3): exactly one of {global handler, per-event
/// table} is in use. Encoded as an enum rather than two optional fields so
/// the exclusivity is structural, not asserted at each call site.
pub(crate) enum Handlers {
    None,
    Global(GlobalHandler),
    PerEvent([Option<EventHandler>; 4]),
}

impl Default for Handlers {
    fn default() -> Self {
        Handlers::None
    }
}

impl Handlers {
    pub(crate) fn is_global(&self) -> bool {
        matches!(self, Handlers::Global(_))
    }

    pub(crate) fn is_per_event(&self) -> bool {
        matches!(self, Handlers::PerEvent(_))
    }

    pub(crate) fn has_handler_for(&self, ev: Event) -> bool {
        match self {
            Handlers::Global(_) => true,
            Handlers::PerEvent(table) => table[ev.slot()].is_some(),
            Handlers::None => false,
        }
    }

    pub(crate) fn install_global(&mut self, f: GlobalHandler) {
        assert!(
            !self.is_per_event(),
            "install_global_handler: per-event handlers are already installed (invariant 1)"
        );
        *self = Handlers::Global(f);
    }

    pub(crate) fn remove_global(&mut self) {
        assert!(
            self.is_global(),
            "remove_global_handler: no global handler is installed"
        );
        *self = Handlers::None;
    }

    pub(crate) fn install_event(&mut self, ev: Event, f: EventHandler) {
        assert!(
            !self.is_global(),
            "install_event_handler: a global handler is already installed (invariant 1)"
        );
        if let Handlers::None = self {
            *self = Handlers::PerEvent(Default::default());
        }
        if let Handlers::PerEvent(table) = self {
            table[ev.slot()] = Some(f);
        }
    }

    /// Removes the per-event handler, returning whether it existed. The
    /// caller (Socket::remove_event_handler) auto-disables the event if it
    /// was enabled, per spec.md §4.5.
    pub(crate) fn remove_event(&mut self, ev: Event) -> bool {
        if let Handlers::PerEvent(table) = self {
            table[ev.slot()].take().is_some()
        } else {
            false
        }
    }

    /// Dispatches `ready` (already masked to the socket's `wait_events` by
    /// the backend adapter) per spec.md §4.4:
    ///
    /// - A global handler is called once with the whole set.
    /// - Otherwise per-event handlers run in fixed READ, WRITE, ACCEPT,
    ///   CONNECT order, and dispatch aborts the instant `liveness` goes
    ///   dead after any single handler returns.
    pub(crate) fn dispatch(&mut self, ready: EventSet, liveness: &Liveness) {
        if ready.is_empty() {
            return;
        }
        #[cfg(feature = "trace-dispatch")]
        tracing::trace!(?ready, "dispatching");
        match self {
            Handlers::Global(f) => {
                if liveness.is_alive() {
                    f(ready);
                }
            }
            Handlers::PerEvent(table) => {
                for ev in ready.iter() {
                    if !liveness.is_alive() {
                        return;
                    }
                    if let Some(f) = table[ev.slot()].as_mut() {
                        f();
                    }
                    if !liveness.is_alive() {
                        return;
                    }
                }
            }
            Handlers::None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_and_per_event_are_exclusive() {
        let mut h = Handlers::default();
        h.install_event(Event::Read, Box::new(|| {}));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            h.install_global(Box::new(|_| {}));
        }));
        assert!(result.is_err());
    }

    #[test]
    fn fixed_order_read_write_accept_connect() {
        let order = Rc::new(Cell::new(Vec::<&'static str>::new()));
        let mut h = Handlers::default();
        for (ev, label) in [
            (Event::Connect, "connect"),
            (Event::Accept, "accept"),
            (Event::Write, "write"),
            (Event::Read, "read"),
        ] {
            let order = order.clone();
            h.install_event(
                ev,
                Box::new(move || {
                    let mut v = order.take();
                    v.push(label);
                    order.set(v);
                }),
            );
        }
        let liveness = Liveness::new();
        h.dispatch(EventSet::READ | EventSet::WRITE | EventSet::ACCEPT | EventSet::CONNECT, &liveness);
        assert_eq!(order.take(), vec!["read", "write", "accept", "connect"]);
    }

    #[test]
    fn destruction_inside_handler_aborts_remaining_dispatch() {
        let liveness = Liveness::new();
        let called = Rc::new(Cell::new(0u32));

        let mut h = Handlers::default();
        {
            let liveness = liveness.clone();
            let called = called.clone();
            h.install_event(
                Event::Read,
                Box::new(move || {
                    called.set(called.get() + 1);
                    liveness.kill();
                }),
            );
        }
        {
            let called = called.clone();
            h.install_event(Event::Write, Box::new(move || called.set(called.get() + 1)));
        }

        h.dispatch(EventSet::READ | EventSet::WRITE, &liveness);
        assert_eq!(called.get(), 1, "write handler must not run after the socket died");
    }
}
