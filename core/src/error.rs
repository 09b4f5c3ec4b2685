use std::net::SocketAddr;

use thiserror::Error;

/// Errors produced by the transport core.
///
/// Socket faults surface as [`Error::Io`]; everything else is recoverable and
/// is either reported to the caller or counted and dropped, depending on the
/// layer.
#[derive(Debug, Error)]
pub enum Error {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// A received datagram did not decode as the protocol it claimed to be.
    #[error("malformed datagram: {0}")]
    Malformed(&'static str),

    /// A wire structure failed to decode.
    #[error("decode error: {0}")]
    Decode(&'static str),

    /// The buffer ended before the structure was complete.
    #[error("buffer truncated")]
    Truncated,

    /// A command's leading byte is not a valid MIDI status.
    #[error("invalid command byte 0x{0:02x}")]
    BadCommand(u8),

    /// A value does not fit the bit-width of the field it addresses.
    #[error("property out of range: {0}")]
    BadProperty(&'static str),

    /// An RTP packet arrived from an SSRC that is not in the peer registry.
    #[error("no peer with ssrc 0x{0:08x}")]
    UnknownPeer(u32),

    /// A sequence gap exceeded the recovery window; journal reconstruction
    /// was skipped for this packet.
    #[error("sequence gap of {gap} exceeds the recovery window")]
    BadSequence { gap: u16 },

    #[error("a peer with ssrc 0x{0:08x} already exists")]
    DuplicateSsrc(u32),

    #[error("a peer with address {0} already exists")]
    DuplicateAddress(SocketAddr),

    /// The outbound queue is full, or a value exceeds its encodable range.
    #[error("capacity exceeded")]
    Overflow,
}

pub type Result<T> = std::result::Result<T, Error>;
