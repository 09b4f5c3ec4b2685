//! AppleMIDI session-control commands.
//!
//! Every command starts with the 16-bit signature `0xFFFF` and a two-ASCII
//! letter tag, and may arrive on either socket. IN/OK/NO/BY share one body
//! layout; CK and RS have their own.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use midilink_core::error::{Error, Result};

use crate::config::MAX_SESSION_NAME;

pub const SIGNATURE: u16 = 0xFFFF;
pub const PROTOCOL_VERSION: u32 = 2;

const CMD_INVITATION: [u8; 2] = *b"IN";
const CMD_ACCEPTED: [u8; 2] = *b"OK";
const CMD_REJECTED: [u8; 2] = *b"NO";
const CMD_END_SESSION: [u8; 2] = *b"BY";
const CMD_SYNC: [u8; 2] = *b"CK";
const CMD_FEEDBACK: [u8; 2] = *b"RS";

/// Body shared by IN, OK, NO and BY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMessage {
    pub version: u32,
    pub token: u32,
    pub ssrc: u32,
    pub name: Option<String>,
}

impl SessionMessage {
    pub fn new(token: u32, ssrc: u32, name: Option<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            token,
            ssrc,
            name,
        }
    }
}

/// Clock-sync exchange; `count` walks 0 → 1 → 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncMessage {
    pub ssrc: u32,
    pub count: u8,
    pub timestamps: [u64; 3],
}

/// Highest in-order sequence the peer has fully processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackMessage {
    pub ssrc: u32,
    pub seqnum: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Invitation(SessionMessage),
    Accepted(SessionMessage),
    Rejected(SessionMessage),
    EndSession(SessionMessage),
    Sync(SyncMessage),
    Feedback(FeedbackMessage),
}

/// True when the datagram carries the AppleMIDI signature and a known
/// command tag. Used to demultiplex the shared sockets.
pub fn is_control_packet(data: &[u8]) -> bool {
    if data.len() < 4 || data[0] != 0xFF || data[1] != 0xFF {
        return false;
    }
    matches!(
        [data[2], data[3]],
        CMD_INVITATION | CMD_ACCEPTED | CMD_REJECTED | CMD_END_SESSION | CMD_SYNC | CMD_FEEDBACK
    )
}

impl ControlCommand {
    fn tag(&self) -> [u8; 2] {
        match self {
            ControlCommand::Invitation(_) => CMD_INVITATION,
            ControlCommand::Accepted(_) => CMD_ACCEPTED,
            ControlCommand::Rejected(_) => CMD_REJECTED,
            ControlCommand::EndSession(_) => CMD_END_SESSION,
            ControlCommand::Sync(_) => CMD_SYNC,
            ControlCommand::Feedback(_) => CMD_FEEDBACK,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u16(SIGNATURE);
        buf.put_slice(&self.tag());
        match self {
            ControlCommand::Invitation(msg)
            | ControlCommand::Accepted(msg)
            | ControlCommand::Rejected(msg)
            | ControlCommand::EndSession(msg) => {
                buf.put_u32(msg.version);
                buf.put_u32(msg.token);
                buf.put_u32(msg.ssrc);
                if let Some(name) = &msg.name {
                    if name.len() > MAX_SESSION_NAME {
                        return Err(Error::BadProperty("session name exceeds 15 bytes"));
                    }
                    buf.put_slice(name.as_bytes());
                    buf.put_u8(0);
                }
            }
            ControlCommand::Sync(sync) => {
                buf.put_u32(sync.ssrc);
                buf.put_u8(sync.count);
                buf.put_bytes(0, 3);
                for ts in sync.timestamps {
                    buf.put_u64(ts);
                }
            }
            ControlCommand::Feedback(fb) => {
                buf.put_u32(fb.ssrc);
                // 32-bit field; the sequence occupies the low 16 bits.
                buf.put_u32(u32::from(fb.seqnum));
            }
        }
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::Malformed("control datagram shorter than signature"));
        }
        let mut reader = Bytes::copy_from_slice(data);
        if reader.get_u16() != SIGNATURE {
            return Err(Error::Malformed("missing AppleMIDI signature"));
        }
        let tag = [reader.get_u8(), reader.get_u8()];
        match tag {
            CMD_INVITATION | CMD_ACCEPTED | CMD_REJECTED | CMD_END_SESSION => {
                let msg = SessionMessage::decode(&mut reader)?;
                Ok(match tag {
                    CMD_INVITATION => ControlCommand::Invitation(msg),
                    CMD_ACCEPTED => ControlCommand::Accepted(msg),
                    CMD_REJECTED => ControlCommand::Rejected(msg),
                    _ => ControlCommand::EndSession(msg),
                })
            }
            CMD_SYNC => {
                if reader.remaining() < 32 {
                    return Err(Error::Malformed("sync command too short"));
                }
                let ssrc = reader.get_u32();
                let count = reader.get_u8();
                reader.advance(3);
                let timestamps = [reader.get_u64(), reader.get_u64(), reader.get_u64()];
                Ok(ControlCommand::Sync(SyncMessage {
                    ssrc,
                    count,
                    timestamps,
                }))
            }
            CMD_FEEDBACK => {
                if reader.remaining() < 8 {
                    return Err(Error::Malformed("receiver feedback too short"));
                }
                let ssrc = reader.get_u32();
                let seqnum = reader.get_u32();
                if seqnum > u32::from(u16::MAX) {
                    return Err(Error::Malformed("feedback sequence exceeds 16 bits"));
                }
                Ok(ControlCommand::Feedback(FeedbackMessage {
                    ssrc,
                    seqnum: seqnum as u16,
                }))
            }
            _ => Err(Error::Malformed("unknown AppleMIDI command")),
        }
    }
}

impl SessionMessage {
    fn decode(reader: &mut Bytes) -> Result<Self> {
        if reader.remaining() < 12 {
            return Err(Error::Malformed("session command too short"));
        }
        let version = reader.get_u32();
        let token = reader.get_u32();
        let ssrc = reader.get_u32();
        let name = if reader.has_remaining() {
            let bytes = reader.chunk();
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            let trimmed = &bytes[..end.min(MAX_SESSION_NAME)];
            let name = std::str::from_utf8(trimmed)
                .map_err(|_| Error::Malformed("session name is not valid UTF-8"))?
                .to_string();
            Some(name)
        } else {
            None
        };
        Ok(Self {
            version,
            token,
            ssrc,
            name,
        })
    }
}
