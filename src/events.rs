//! Logical event bitset and the socket lifecycle phase it is checked against.
//!
//! Forked in spirit from the readiness bitset in `driver/legacy/ready.rs`:
//! a small `Copy` newtype over an integer with const bitwise combinators,
//! rather than a `bitflags!`-generated type, so callers can build masks in
//! const contexts.

use std::{fmt, ops};

const READ: u8 = 0b0001;
const WRITE: u8 = 0b0010;
const ACCEPT: u8 = 0b0100;
const CONNECT: u8 = 0b1000;

/// A single logical event a socket can wait on.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum Event {
    Read,
    Write,
    Accept,
    Connect,
}

impl Event {
    /// Fixed dispatch order used by [`crate::socket::Socket`] when no global
    /// handler is installed: READ, WRITE, ACCEPT, CONNECT.
    pub const ALL_IN_ORDER: [Event; 4] = [Event::Read, Event::Write, Event::Accept, Event::Connect];

    pub(crate) const fn bit(self) -> EventSet {
        match self {
            Event::Read => EventSet(READ),
            Event::Write => EventSet(WRITE),
            Event::Accept => EventSet(ACCEPT),
            Event::Connect => EventSet(CONNECT),
        }
    }

    pub(crate) const fn slot(self) -> usize {
        match self {
            Event::Read => 0,
            Event::Write => 1,
            Event::Accept => 2,
            Event::Connect => 3,
        }
    }
}

/// A set of [`Event`]s, used both as the set of currently-enabled events on a
/// socket (`wait_events`) and as the set delivered to a global handler.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct EventSet(u8);

impl EventSet {
    pub const EMPTY: EventSet = EventSet(0);
    pub const READ: EventSet = EventSet(READ);
    pub const WRITE: EventSet = EventSet(WRITE);
    pub const ACCEPT: EventSet = EventSet(ACCEPT);
    pub const CONNECT: EventSet = EventSet(CONNECT);

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, ev: Event) -> bool {
        self.0 & ev.bit().0 == ev.bit().0
    }

    pub const fn union(self, other: EventSet) -> EventSet {
        EventSet(self.0 | other.0)
    }

    pub const fn without(self, ev: Event) -> EventSet {
        EventSet(self.0 & !ev.bit().0)
    }

    /// Iterates the set members in the fixed READ, WRITE, ACCEPT, CONNECT order.
    pub(crate) fn iter(self) -> impl Iterator<Item = Event> {
        Event::ALL_IN_ORDER.into_iter().filter(move |e| self.contains(*e))
    }
}

impl From<Event> for EventSet {
    fn from(ev: Event) -> Self {
        ev.bit()
    }
}

impl ops::BitOr for EventSet {
    type Output = EventSet;
    fn bitor(self, rhs: EventSet) -> EventSet {
        self.union(rhs)
    }
}

impl ops::BitOrAssign for EventSet {
    fn bitor_assign(&mut self, rhs: EventSet) {
        *self = *self | rhs;
    }
}

impl fmt::Debug for EventSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        for ev in self.iter() {
            set.entry(&ev);
        }
        set.finish()
    }
}

/// Lifecycle phase a socket is in, replacing the source's free-form runtime
/// asserts over READ/WRITE vs ACCEPT vs CONNECT with a construction-time
/// state machine (see spec.md §9 design notes / invariant 3).
///
/// A socket starts `Idle`. The first event enabled picks the phase; further
/// enables must belong to the same phase. Once `wait_events` empties again
/// (all events disabled), the phase resets to `Idle` so the socket can move
/// on to its next lifecycle stage (e.g. `Connecting` -> `Idle` -> `ReadWrite`
/// once a non-blocking connect completes and the caller switches to READ).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub(crate) enum IoPhase {
    #[default]
    Idle,
    ReadWrite,
    Accepting,
    Connecting,
}

impl IoPhase {
    fn family_of(ev: Event) -> IoPhase {
        match ev {
            Event::Read | Event::Write => IoPhase::ReadWrite,
            Event::Accept => IoPhase::Accepting,
            Event::Connect => IoPhase::Connecting,
        }
    }

    /// Returns the phase that would result from enabling `ev`, or `None` if
    /// that would violate invariant 3 (mixing READ/WRITE with ACCEPT, or
    /// either with CONNECT).
    pub(crate) fn with_event(self, ev: Event) -> Option<IoPhase> {
        let family = Self::family_of(ev);
        match self {
            IoPhase::Idle => Some(family),
            phase if phase == family => Some(phase),
            _ => None,
        }
    }
}
