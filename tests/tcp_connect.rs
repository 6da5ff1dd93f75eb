//! End-to-end TCP connect scenarios over the POSIX reference reactor:
//! successful loopback connect, and connect-refused against a closed port.

#![cfg(unix)]

use std::cell::Cell;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::Duration;

use evio::{Addr, ErrorKind, Event, Kind, MioReactor, Socket};

fn loopback(port: u16) -> Addr {
    Addr::from(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
}

fn drive_until<F: FnMut() -> bool>(reactor: &MioReactor, mut done: F) {
    for _ in 0..200 {
        if done() {
            return;
        }
        reactor.poll(Some(Duration::from_millis(10))).unwrap();
    }
    assert!(done(), "condition never became true within the poll budget");
}

#[test]
fn connect_succeeds_against_a_real_listener() {
    let reactor = MioReactor::new().unwrap();
    const PORT: u16 = 18231;

    let listener = Socket::open(reactor.clone(), socket2::Domain::IPV4, Kind::Stream).unwrap();
    listener.bind(loopback(PORT)).unwrap();
    listener.listen(16).unwrap();

    let client = Socket::open(reactor.clone(), socket2::Domain::IPV4, Kind::Stream).unwrap();
    let first = client.connect(loopback(PORT));
    assert_eq!(first.unwrap_err().kind(), ErrorKind::InProgress);

    let connected = Rc::new(Cell::new(false));
    let connected_in_handler = connected.clone();
    client.install_event_handler(Event::Connect, move || connected_in_handler.set(true));
    client.enable_event(Event::Connect);

    let mut accepted = None;
    drive_until(&reactor, || {
        if accepted.is_none() {
            if let Ok((Some(s), _)) = listener.accept(true) {
                accepted = Some(s);
            }
        }
        accepted.is_some() && connected.get()
    });

    client.get_connect_result().expect("connect should have completed successfully");
}

#[test]
fn connect_to_a_closed_port_is_refused() {
    let reactor = MioReactor::new().unwrap();
    let client = Socket::open(reactor.clone(), socket2::Domain::IPV4, Kind::Stream).unwrap();

    // Port 1 is reserved (tcpmux) and essentially never has a listener in
    // test environments; connecting to loopback on it reliably refuses.
    let target = loopback(1);
    let first = client.connect(target);
    let Err(first_err) = first else {
        // Extremely unlikely, but not wrong: nothing stops port 1 from
        // being open in an unusual environment.
        return;
    };
    if first_err.kind() != ErrorKind::InProgress {
        assert!(first_err.kind().is_terminal());
        return;
    }

    let failed = Rc::new(Cell::new(false));
    let failed_in_handler = failed.clone();
    client.install_event_handler(Event::Connect, move || failed_in_handler.set(true));
    client.enable_event(Event::Connect);

    drive_until(&reactor, || failed.get());

    let result = client.get_connect_result();
    assert!(result.is_err(), "connecting to a closed port must not silently succeed");
}
