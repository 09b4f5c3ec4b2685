#![deny(warnings)]

//! Wire-level building blocks for RTP-MIDI (RFC 6295): the MIDI message
//! codec, variable-length quantities, RTP framing, the payload command
//! section, and the recovery journal. Everything here is synchronous and
//! allocation-light; sockets and peers live in `midilink-network`.

pub mod error;
pub mod journal;
pub mod message;
pub mod payload;
pub mod rtp;
pub mod seq;
pub mod vlq;

pub use error::{Error, Result};
pub use journal::{Journal, ParsedJournal};
pub use message::MidiCommand;
pub use payload::{MidiSection, TimedCommand};
pub use rtp::{PacketInfo, ReceivedPacket, PAYLOAD_TYPE_MIDI};
