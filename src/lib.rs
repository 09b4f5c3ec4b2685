#![deny(warnings)]

//! RTP-MIDI (RFC 6295) over UDP with AppleMIDI session control.
//!
//! The workspace splits into wire codecs (`midilink-core`), session and
//! socket handling (`midilink-network`), and this facade, which re-exports
//! the public surface and adds a tokio-based host for event-driven
//! programs. Cooperative hosts poll [`UdpDriver`] directly:
//!
//! ```no_run
//! use midilink::{Config, Delegate, MidiCommand, UdpDriver};
//!
//! struct Printer;
//!
//! impl Delegate for Printer {
//!     fn midi_received(&mut self, ssrc: u32, command: &MidiCommand) {
//!         println!("0x{ssrc:08x}: {command:?}");
//!     }
//! }
//!
//! fn main() -> midilink::Result<()> {
//!     let mut driver = UdpDriver::bind(Config::default(), Printer)?;
//!     driver.add_peer("192.168.1.20:5004".parse().unwrap())?;
//!     loop {
//!         driver.tick()?;
//!         driver.poll_receive()?;
//!         driver.poll_send()?;
//!         std::thread::sleep(std::time::Duration::from_millis(1));
//!     }
//! }
//! ```

pub mod runner;

pub use midilink_core::{
    payload, rtp, Error, Journal, MidiCommand, MidiSection, PacketInfo, ParsedJournal,
    ReceivedPacket, Result, TimedCommand,
};
pub use midilink_network::{
    Config, ControlCommand, Counters, Delegate, FeedbackMessage, IncomingMidi, MediaClock,
    MockTransport, Peer, PeerRegistry, PeerState, RtpSession, SessionController, SessionEvent,
    SessionMessage, SocketKind, SyncMessage, Transport, UdpDriver, UdpTransport,
};
pub use runner::{AsyncDriver, TokioTransport};
