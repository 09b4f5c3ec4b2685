//! RTP-MIDI payload codec.
//!
//! The payload opens with a one- or two-byte flag header (`B Z P J` plus the
//! command-section length), followed by a delta-time/command chain and,
//! when `J` is set, the recovery journal. Delta-times are variable-length
//! quantities in RTP timestamp units.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::message::MidiCommand;
use crate::vlq;

const FLAG_B: u8 = 0x80;
const FLAG_Z: u8 = 0x40;
const FLAG_P: u8 = 0x20;
const FLAG_J: u8 = 0x10;

/// One command of a packet, with its delta-time relative to the previous
/// command (or to the packet timestamp for the first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedCommand {
    pub delta: u32,
    pub command: MidiCommand,
}

impl TimedCommand {
    pub fn new(delta: u32, command: MidiCommand) -> Self {
        Self { delta, command }
    }
}

/// Decoded payload: the command list and the raw journal section, if any.
#[derive(Debug, Clone)]
pub struct MidiSection {
    pub commands: Vec<TimedCommand>,
    pub journal: Option<Bytes>,
}

/// Encodes the command section, appending `journal` when it is non-empty.
///
/// `Z` is set iff the first command carries a non-zero delta; `B` is chosen
/// by the section length; `P` is never set (running status is not carried
/// across packets on send).
pub fn encode_section(commands: &[TimedCommand], journal: Option<&[u8]>) -> Result<BytesMut> {
    let mut section = BytesMut::new();
    let mut first_delta_nonzero = false;
    for (i, timed) in commands.iter().enumerate() {
        if i == 0 {
            if timed.delta != 0 {
                first_delta_nonzero = true;
                vlq::encode_into(timed.delta, &mut section)?;
            }
        } else {
            vlq::encode_into(timed.delta, &mut section)?;
        }
        timed.command.encode_to(&mut section);
    }

    let len = section.len();
    if len > 0x0FFF {
        return Err(Error::BadProperty("command section exceeds 12-bit length"));
    }
    let journal = journal.filter(|j| !j.is_empty());

    let long = len >= 16;
    let mut flags = (len & 0x0F) as u8;
    if long {
        flags |= FLAG_B;
    }
    if first_delta_nonzero {
        flags |= FLAG_Z;
    }
    if journal.is_some() {
        flags |= FLAG_J;
    }

    let mut buf = BytesMut::with_capacity(2 + len + journal.map_or(0, <[u8]>::len));
    buf.extend_from_slice(&[flags]);
    if long {
        buf.extend_from_slice(&[(len >> 4) as u8]);
    }
    buf.extend_from_slice(&section);
    if let Some(journal) = journal {
        buf.extend_from_slice(journal);
    }
    Ok(buf)
}

/// Decodes a payload. `carried_status` supplies the running status from the
/// previous packet and is consulted only when the `P` flag is set;
/// `pending_sysex` is the fragment index expected next when the previous
/// packet ended inside a SysEx transfer, in which case the section opens
/// with data-only continuation bytes instead of a status byte.
pub fn decode_section(
    data: &[u8],
    carried_status: Option<u8>,
    pending_sysex: Option<u8>,
) -> Result<MidiSection> {
    let mut reader = Bytes::copy_from_slice(data);
    if reader.is_empty() {
        return Err(Error::Truncated);
    }
    let flags = reader.get_u8();
    let mut len = usize::from(flags & 0x0F);
    if flags & FLAG_B != 0 {
        if reader.is_empty() {
            return Err(Error::Truncated);
        }
        len |= usize::from(reader.get_u8()) << 4;
    }
    if reader.remaining() < len {
        return Err(Error::Truncated);
    }
    let section = reader.split_to(len);

    let mut running = if flags & FLAG_P != 0 {
        Some(carried_status.ok_or(Error::Decode("phantom status without prior packet"))?)
    } else {
        None
    };
    let mut open_sysex = pending_sysex;
    let mut commands = Vec::new();
    let mut body = &section[..];
    let mut first = true;

    while !body.is_empty() {
        let delta = if first && flags & FLAG_Z == 0 {
            0
        } else {
            let (delta, consumed) = vlq::decode(body)?;
            body = &body[consumed..];
            delta
        };
        first = false;

        let (command, consumed) = match open_sysex {
            Some(fragment) => MidiCommand::decode_continuation(fragment, body)?,
            None => MidiCommand::decode(body, running)?,
        };
        body = &body[consumed..];

        match &command {
            MidiCommand::SystemExclusive {
                fragment,
                terminated,
                ..
            } => {
                open_sysex = (!terminated).then(|| fragment.wrapping_add(1));
                running = None;
            }
            MidiCommand::RealTime { .. } => {}
            cmd if cmd.is_channel_voice() => running = Some(cmd.status()),
            // System common clears running status.
            _ => running = None,
        }
        commands.push(TimedCommand::new(delta, command));
    }

    let journal = if flags & FLAG_J != 0 {
        if reader.is_empty() {
            return Err(Error::Decode("journal flag set on empty journal"));
        }
        Some(reader)
    } else {
        None
    };

    Ok(MidiSection { commands, journal })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note_on(channel: u8, key: u8, velocity: u8) -> MidiCommand {
        MidiCommand::note_on(channel, key, velocity).unwrap()
    }

    #[test]
    fn single_note_on_wire_form() {
        let commands = [TimedCommand::new(0, note_on(0, 60, 100))];
        let wire = encode_section(&commands, None).unwrap();
        // B=0, Z=0, P=0, J=0, LEN=3
        assert_eq!(&wire[..], &[0x03, 0x90, 0x3C, 0x64]);
    }

    #[test]
    fn roundtrip_with_deltas() {
        let commands = vec![
            TimedCommand::new(0, note_on(0, 60, 100)),
            TimedCommand::new(480, note_on(0, 64, 90)),
            TimedCommand::new(480, MidiCommand::note_off(0, 60, 0).unwrap()),
        ];
        let wire = encode_section(&commands, None).unwrap();
        let section = decode_section(&wire, None, None).unwrap();
        assert_eq!(section.commands, commands);
        assert!(section.journal.is_none());
    }

    #[test]
    fn leading_delta_sets_z() {
        let commands = [TimedCommand::new(96, note_on(2, 40, 80))];
        let wire = encode_section(&commands, None).unwrap();
        assert_eq!(wire[0] & FLAG_Z, FLAG_Z);
        let section = decode_section(&wire, None, None).unwrap();
        assert_eq!(section.commands[0].delta, 96);
    }

    #[test]
    fn long_section_uses_twelve_bit_length() {
        let commands: Vec<TimedCommand> = (0..8)
            .map(|i| TimedCommand::new(i as u32, note_on(0, 20 + i as u8, 64)))
            .collect();
        let wire = encode_section(&commands, None).unwrap();
        assert_eq!(wire[0] & FLAG_B, FLAG_B);
        let len = usize::from(wire[0] & 0x0F) | (usize::from(wire[1]) << 4);
        assert_eq!(len, wire.len() - 2);
        let section = decode_section(&wire, None, None).unwrap();
        assert_eq!(section.commands, commands);
    }

    #[test]
    fn running_status_within_section() {
        // 90 3C 64, then delta 0 and data-only bytes reusing the status.
        let wire = [0x06, 0x90, 0x3C, 0x64, 0x00, 0x3E, 0x50];
        let section = decode_section(&wire, None, None).unwrap();
        assert_eq!(
            section.commands,
            vec![
                TimedCommand::new(0, note_on(0, 0x3C, 0x64)),
                TimedCommand::new(0, note_on(0, 0x3E, 0x50)),
            ]
        );
    }

    #[test]
    fn phantom_status_uses_carried_status() {
        let wire = [0x22, 0x3C, 0x64]; // P=1, LEN=2, data-only command
        let section = decode_section(&wire, Some(0x91), None).unwrap();
        assert_eq!(
            section.commands,
            vec![TimedCommand::new(0, note_on(1, 0x3C, 0x64))]
        );
        assert!(matches!(
            decode_section(&wire, None, None),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn journal_section_is_split_off() {
        let commands = [TimedCommand::new(0, note_on(0, 60, 100))];
        let wire = encode_section(&commands, Some(&[0xAA, 0xBB])).unwrap();
        assert_eq!(wire[0] & FLAG_J, FLAG_J);
        let section = decode_section(&wire, None, None).unwrap();
        assert_eq!(&section.journal.unwrap()[..], &[0xAA, 0xBB]);
    }

    #[test]
    fn empty_journal_is_not_flagged() {
        let commands = [TimedCommand::new(0, note_on(0, 60, 100))];
        let wire = encode_section(&commands, Some(&[])).unwrap();
        assert_eq!(wire[0] & FLAG_J, 0);
    }

    #[test]
    fn declared_length_beyond_buffer_is_truncated() {
        assert!(matches!(
            decode_section(&[0x0F, 0x90, 0x3C], None, None),
            Err(Error::Truncated)
        ));
    }

    #[test]
    fn invalid_status_is_bad_command() {
        assert!(matches!(
            decode_section(&[0x03, 0xF4, 0x00, 0x00], None, None),
            Err(Error::BadCommand(0xF4))
        ));
    }

    #[test]
    fn sysex_reassembly_spans_packets() {
        // An unterminated start always runs to the end of its section; the
        // continuation arrives in the next packet as data-only bytes.
        let first = [0x03, 0xF0, 0x7D, 0x01];
        let section = decode_section(&first, None, None).unwrap();
        assert_eq!(
            section.commands,
            vec![TimedCommand::new(
                0,
                MidiCommand::sysex_fragment(0, vec![0x7D, 0x01], false).unwrap()
            )]
        );

        // Closing fragment followed by an ordinary command.
        let second = [0x07, 0x02, 0x03, 0xF7, 0x00, 0x90, 0x3C, 0x64];
        let section = decode_section(&second, None, Some(1)).unwrap();
        assert_eq!(
            section.commands,
            vec![
                TimedCommand::new(
                    0,
                    MidiCommand::sysex_fragment(1, vec![0x02, 0x03], true).unwrap()
                ),
                TimedCommand::new(0, note_on(0, 0x3C, 0x64)),
            ]
        );

        // A middle fragment that fills its whole section stays open.
        let middle = [0x02, 0x04, 0x05];
        let section = decode_section(&middle, None, Some(1)).unwrap();
        assert_eq!(
            section.commands,
            vec![TimedCommand::new(
                0,
                MidiCommand::sysex_fragment(1, vec![0x04, 0x05], false).unwrap()
            )]
        );
    }
}
