#![deny(warnings)]

//! Session side of the transport: peer registry, AppleMIDI control
//! commands, the RTP session layer, the two-socket session controller, and
//! a polled UDP driver. The wire codecs live in `midilink-core`.

pub mod config;
pub mod control;
pub mod controller;
pub mod driver;
pub mod peer;
pub mod session;

pub use config::Config;
pub use control::{ControlCommand, FeedbackMessage, SessionMessage, SyncMessage};
pub use controller::{
    Counters, Delegate, SessionController, SessionEvent, SocketKind, Transport,
};
pub use driver::{MediaClock, UdpDriver, UdpTransport};
pub use peer::{Peer, PeerRegistry, PeerState};
pub use session::{IncomingMidi, RtpSession};

use std::collections::VecDeque;
use std::net::SocketAddr;

/// In-memory [`Transport`] for tests and dependency injection: sends are
/// captured, receives are fed from a queue.
#[derive(Debug, Default)]
pub struct MockTransport {
    pub sent: Vec<(SocketKind, SocketAddr, Vec<u8>)>,
    pub inbox: VecDeque<(SocketKind, SocketAddr, Vec<u8>)>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a datagram to be returned by the next `recv` on `socket`.
    pub fn push_incoming(&mut self, socket: SocketKind, from: SocketAddr, payload: Vec<u8>) {
        self.inbox.push_back((socket, from, payload));
    }

    /// Drains everything sent so far.
    pub fn take_sent(&mut self) -> Vec<(SocketKind, SocketAddr, Vec<u8>)> {
        std::mem::take(&mut self.sent)
    }
}

impl Transport for MockTransport {
    fn send(
        &mut self,
        socket: SocketKind,
        addr: SocketAddr,
        payload: &[u8],
    ) -> std::io::Result<usize> {
        self.sent.push((socket, addr, payload.to_vec()));
        Ok(payload.len())
    }

    fn recv(
        &mut self,
        socket: SocketKind,
        buf: &mut [u8],
    ) -> std::io::Result<Option<(usize, SocketAddr)>> {
        if let Some(pos) = self.inbox.iter().position(|(kind, _, _)| *kind == socket) {
            let (_, addr, payload) = self.inbox.remove(pos).expect("position is valid");
            let len = payload.len().min(buf.len());
            buf[..len].copy_from_slice(&payload[..len]);
            Ok(Some((len, addr)))
        } else {
            Ok(None)
        }
    }
}
