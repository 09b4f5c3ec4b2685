//! Two controllers wired back-to-back through in-memory transports:
//! invitation handshake, clock sync, and session teardown.

use std::net::SocketAddr;

use midilink::{
    Config, Delegate, MidiCommand, MockTransport, SessionController, SessionEvent, SocketKind,
};

const A_SSRC: u32 = 0x01020304;
const B_SSRC: u32 = 0x0A0B0C0D;

#[derive(Default)]
struct Recorder {
    commands: Vec<(u32, MidiCommand)>,
    events: Vec<SessionEvent>,
}

impl Delegate for Recorder {
    fn midi_received(&mut self, ssrc: u32, command: &MidiCommand) {
        self.commands.push((ssrc, command.clone()));
    }

    fn event(&mut self, event: SessionEvent) {
        self.events.push(event);
    }
}

type Controller = SessionController<MockTransport, Recorder>;

struct Endpoint {
    controller: Controller,
    control_addr: SocketAddr,
    data_addr: SocketAddr,
}

impl Endpoint {
    fn new(name: &str, port: u16, ssrc: u32, token: u32) -> Self {
        let config = Config {
            port,
            session_name: name.to_string(),
            ..Config::default()
        };
        let controller = SessionController::with_identity(
            config,
            MockTransport::new(),
            Recorder::default(),
            ssrc,
            token,
        )
        .unwrap();
        Self {
            controller,
            control_addr: format!("127.0.0.1:{port}").parse().unwrap(),
            data_addr: format!("127.0.0.1:{}", port + 1).parse().unwrap(),
        }
    }

    fn events(&self) -> &[SessionEvent] {
        &self.controller.delegate().events
    }
}

/// Moves every datagram `from` has sent into `to`'s inbox and processes it.
fn transfer(from: &mut Endpoint, to: &mut Endpoint) -> bool {
    let sent = from.controller.transport_mut().take_sent();
    let moved = !sent.is_empty();
    for (kind, dest, payload) in sent {
        let source = match kind {
            SocketKind::Control => from.control_addr,
            SocketKind::Data => from.data_addr,
        };
        assert_eq!(
            dest,
            match kind {
                SocketKind::Control => to.control_addr,
                SocketKind::Data => to.data_addr,
            },
            "datagram routed to an unexpected address"
        );
        to.controller
            .transport_mut()
            .push_incoming(kind, source, payload);
    }
    to.controller.poll_receive().unwrap();
    moved
}

/// Shuttles datagrams both ways until the wires are quiet.
fn pump(a: &mut Endpoint, b: &mut Endpoint) {
    loop {
        let a_to_b = transfer(a, b);
        let b_to_a = transfer(b, a);
        if !a_to_b && !b_to_a {
            break;
        }
    }
}

fn establish() -> (Endpoint, Endpoint) {
    let mut a = Endpoint::new("MIDIKit", 5004, A_SSRC, 0xDEADBEEF);
    let mut b = Endpoint::new("studio", 5104, B_SSRC, 0x0BADF00D);
    a.controller.add_peer(b.control_addr).unwrap();
    pump(&mut a, &mut b);
    (a, b)
}

#[test]
fn invitation_datagram_matches_wire_reference() {
    let mut a = Endpoint::new("MIDIKit", 5004, A_SSRC, 0xDEADBEEE);
    let b_addr: SocketAddr = "127.0.0.1:5104".parse().unwrap();
    a.controller.add_peer(b_addr).unwrap();
    let sent = a.controller.transport_mut().take_sent();
    assert_eq!(sent.len(), 1);
    let (kind, dest, wire) = &sent[0];
    assert_eq!(*kind, SocketKind::Control);
    assert_eq!(*dest, b_addr);
    // The first invitation token is the configured base plus one; the
    // reference vector uses 0xDEADBEEF with SSRC 0x01020304, name "MIDIKit".
    assert_eq!(
        &wire[..],
        &[
            0xFF, 0xFF, 0x49, 0x4E, 0x00, 0x00, 0x00, 0x02, 0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02,
            0x03, 0x04, 0x4D, 0x49, 0x44, 0x49, 0x4B, 0x69, 0x74, 0x00
        ]
    );
}

#[test]
fn handshake_establishes_both_sides() {
    let (a, b) = establish();
    assert_eq!(a.controller.session().registry().len(), 1);
    assert_eq!(b.controller.session().registry().len(), 1);

    let b_peer = a.controller.session().registry().by_ssrc(B_SSRC).unwrap();
    assert_eq!(b_peer.address(), b.data_addr);
    assert_eq!(b_peer.name(), Some("studio"));

    let a_peer = b.controller.session().registry().by_ssrc(A_SSRC).unwrap();
    assert_eq!(a_peer.address(), a.data_addr);
    assert_eq!(a_peer.name(), Some("MIDIKit"));

    assert!(a.events().contains(&SessionEvent::PeerEstablished {
        ssrc: B_SSRC,
        addr: b.data_addr,
    }));
    assert!(b.events().contains(&SessionEvent::PeerEstablished {
        ssrc: A_SSRC,
        addr: a.data_addr,
    }));
}

#[test]
fn first_sync_datagram_matches_wire_reference() {
    let (mut a, _b) = establish();
    a.controller.tick(0x1000).unwrap();
    let sent = a.controller.transport_mut().take_sent();
    let ck = sent
        .iter()
        .find(|(kind, _, wire)| *kind == SocketKind::Data && wire.starts_with(&[0xFF, 0xFF]))
        .expect("a scheduled sync should fire immediately after establishment");
    assert_eq!(
        &ck.2[..],
        &[
            0xFF, 0xFF, 0x43, 0x4B, 0x01, 0x02, 0x03, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00
        ]
    );
}

#[test]
fn three_leg_sync_measures_a_fixed_offset() {
    let (mut a, mut b) = establish();
    const OFFSET: u64 = 500_000; // B's clock runs ahead of A's
    const RTT: u64 = 440; // ~10 ms of symmetric round-trip travel at 44.1 kHz

    let t1 = 100_000;
    a.controller.tick(t1).unwrap(); // emits CK0 with t1
    let ck0 = a.controller.transport_mut().take_sent();
    assert_eq!(ck0.len(), 1);

    b.controller.tick(t1 + RTT / 2 + OFFSET).unwrap();
    b.controller
        .transport_mut()
        .push_incoming(SocketKind::Data, a.data_addr, ck0[0].2.clone());
    b.controller.poll_receive().unwrap();
    let ck1 = b.controller.transport_mut().take_sent();
    assert_eq!(ck1.len(), 1);

    a.controller.tick(t1 + RTT).unwrap();
    a.controller
        .transport_mut()
        .push_incoming(SocketKind::Data, b.data_addr, ck1[0].2.clone());
    a.controller.poll_receive().unwrap();
    let ck2 = a.controller.transport_mut().take_sent();
    assert_eq!(ck2.len(), 1);

    b.controller.tick(t1 + RTT + RTT / 2 + OFFSET).unwrap();
    b.controller
        .transport_mut()
        .push_incoming(SocketKind::Data, a.data_addr, ck2[0].2.clone());
    b.controller.poll_receive().unwrap();

    // With symmetric travel the measured offset is exact; the property
    // bound is ±RTT/2.
    let measured_by_a = a
        .controller
        .session()
        .registry()
        .by_ssrc(B_SSRC)
        .unwrap()
        .timestamp_diff();
    assert_eq!(measured_by_a, OFFSET as i64);

    let measured_by_b = b
        .controller
        .session()
        .registry()
        .by_ssrc(A_SSRC)
        .unwrap()
        .timestamp_diff();
    assert_eq!(measured_by_b, -(OFFSET as i64));

    assert!(a.events().iter().any(|e| matches!(
        e,
        SessionEvent::ClockSynchronized { ssrc: B_SSRC, .. }
    )));
}

#[test]
fn end_session_clears_the_remote_registry() {
    let (mut a, mut b) = establish();
    a.controller.remove_peer(b.data_addr).unwrap();
    assert!(a.controller.session().registry().is_empty());
    pump(&mut a, &mut b);
    assert!(b.controller.session().registry().is_empty());
    assert!(b
        .events()
        .contains(&SessionEvent::PeerClosed { ssrc: A_SSRC }));
}

#[test]
fn rejected_invitation_reaches_the_caller() {
    let mut a = Endpoint::new("MIDIKit", 5004, A_SSRC, 1);
    let config = Config {
        port: 5104,
        peer_limit: 0,
        ..Config::default()
    };
    let mut b = Endpoint {
        controller: SessionController::with_identity(
            config,
            MockTransport::new(),
            Recorder::default(),
            B_SSRC,
            2,
        )
        .unwrap(),
        control_addr: "127.0.0.1:5104".parse().unwrap(),
        data_addr: "127.0.0.1:5105".parse().unwrap(),
    };
    a.controller.add_peer(b.control_addr).unwrap();
    pump(&mut a, &mut b);
    assert!(a.events().contains(&SessionEvent::InviteRejected {
        addr: b.control_addr
    }));
    assert!(a.controller.session().registry().is_empty());
}
