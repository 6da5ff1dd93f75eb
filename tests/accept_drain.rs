//! End-to-end accept scenario over the POSIX reference reactor (spec.md §8
//! scenario 3): a drained accept (`out_socket = null`) still reports the
//! connecting peer's address while closing the accepted fd immediately.

#![cfg(unix)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use evio::{Addr, Kind, MioReactor, Socket};

fn loopback(port: u16) -> Addr {
    Addr::from(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
}

#[test]
fn drained_accept_reports_peer_and_closes_the_fd() {
    let reactor = MioReactor::new().unwrap();
    const PORT: u16 = 18251;

    let listener = Socket::open(reactor.clone(), socket2::Domain::IPV4, Kind::Stream).unwrap();
    listener.bind(loopback(PORT)).unwrap();
    listener.listen(8).unwrap();

    let client = Socket::open(reactor.clone(), socket2::Domain::IPV4, Kind::Stream).unwrap();
    let pending = client.connect(loopback(PORT));
    assert!(pending.is_err());

    let mut result = None;
    for _ in 0..200 {
        if let Ok((socket, peer)) = listener.accept(false) {
            result = Some((socket, peer));
            break;
        }
        reactor.poll(Some(Duration::from_millis(10))).unwrap();
    }

    let (socket, peer) = result.expect("listener never accepted the connection");
    assert!(socket.is_none(), "accept(keep = false) must not return a socket");
    assert_eq!(peer, Addr::from(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), peer.port())));
    assert_ne!(peer.port(), 0, "the connecting endpoint's ephemeral port must be reported");

    // A second connection attempt against the still-listening socket proves
    // the drained accept didn't leave the listener's queue or registration
    // wedged by the immediately-closed fd.
    let second_client = Socket::open(reactor.clone(), socket2::Domain::IPV4, Kind::Stream).unwrap();
    let _ = second_client.connect(loopback(PORT));
    let mut accepted_again = false;
    for _ in 0..200 {
        if listener.accept(true).is_ok() {
            accepted_again = true;
            break;
        }
        reactor.poll(Some(Duration::from_millis(10))).unwrap();
    }
    assert!(accepted_again, "listener must keep accepting after a drained accept");
}
