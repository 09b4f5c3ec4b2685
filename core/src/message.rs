//! MIDI message wire codec.
//!
//! Each message form the transport needs to inspect is one variant of
//! [`MidiCommand`]; detection is pattern matching on the status byte. SysEx
//! payloads are owned by their variant so a fragment buffer has exactly one
//! owner.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A single MIDI message, either a complete command or one SysEx fragment.
///
/// Fragment 0 of a SysEx transfer carries the `0xF0` status and the
/// manufacturer ID; later fragments carry data only, and the final fragment
/// ends with `0xF7` (`terminated`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MidiCommand {
    NoteOff { channel: u8, key: u8, velocity: u8 },
    NoteOn { channel: u8, key: u8, velocity: u8 },
    PolyphonicKeyPressure { channel: u8, key: u8, pressure: u8 },
    ControlChange { channel: u8, control: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    ChannelPressure { channel: u8, pressure: u8 },
    PitchBend { channel: u8, value: u16 },
    SystemExclusive { fragment: u8, data: Vec<u8>, terminated: bool },
    TimeCodeQuarterFrame { value: u8 },
    SongPosition { beats: u16 },
    SongSelect { song: u8 },
    TuneRequest,
    RealTime { status: u8 },
}

fn data7(value: u8, what: &'static str) -> Result<u8> {
    if value > 0x7F {
        return Err(Error::BadProperty(what));
    }
    Ok(value)
}

fn channel4(channel: u8) -> Result<u8> {
    if channel > 0x0F {
        return Err(Error::BadProperty("channel exceeds 4 bits"));
    }
    Ok(channel)
}

fn data14(value: u16, what: &'static str) -> Result<u16> {
    if value > 0x3FFF {
        return Err(Error::BadProperty(what));
    }
    Ok(value)
}

impl MidiCommand {
    pub fn note_off(channel: u8, key: u8, velocity: u8) -> Result<Self> {
        Ok(MidiCommand::NoteOff {
            channel: channel4(channel)?,
            key: data7(key, "key exceeds 7 bits")?,
            velocity: data7(velocity, "velocity exceeds 7 bits")?,
        })
    }

    pub fn note_on(channel: u8, key: u8, velocity: u8) -> Result<Self> {
        Ok(MidiCommand::NoteOn {
            channel: channel4(channel)?,
            key: data7(key, "key exceeds 7 bits")?,
            velocity: data7(velocity, "velocity exceeds 7 bits")?,
        })
    }

    pub fn poly_pressure(channel: u8, key: u8, pressure: u8) -> Result<Self> {
        Ok(MidiCommand::PolyphonicKeyPressure {
            channel: channel4(channel)?,
            key: data7(key, "key exceeds 7 bits")?,
            pressure: data7(pressure, "pressure exceeds 7 bits")?,
        })
    }

    pub fn control_change(channel: u8, control: u8, value: u8) -> Result<Self> {
        Ok(MidiCommand::ControlChange {
            channel: channel4(channel)?,
            control: data7(control, "controller number exceeds 7 bits")?,
            value: data7(value, "controller value exceeds 7 bits")?,
        })
    }

    pub fn program_change(channel: u8, program: u8) -> Result<Self> {
        Ok(MidiCommand::ProgramChange {
            channel: channel4(channel)?,
            program: data7(program, "program exceeds 7 bits")?,
        })
    }

    pub fn channel_pressure(channel: u8, pressure: u8) -> Result<Self> {
        Ok(MidiCommand::ChannelPressure {
            channel: channel4(channel)?,
            pressure: data7(pressure, "pressure exceeds 7 bits")?,
        })
    }

    pub fn pitch_bend(channel: u8, value: u16) -> Result<Self> {
        Ok(MidiCommand::PitchBend {
            channel: channel4(channel)?,
            value: data14(value, "pitch-wheel value exceeds 14 bits")?,
        })
    }

    pub fn sysex_fragment(fragment: u8, data: Vec<u8>, terminated: bool) -> Result<Self> {
        if data.iter().any(|&b| b > 0x7F) {
            return Err(Error::BadProperty("sysex payload contains a status byte"));
        }
        Ok(MidiCommand::SystemExclusive {
            fragment,
            data,
            terminated,
        })
    }

    pub fn time_code(value: u8) -> Result<Self> {
        Ok(MidiCommand::TimeCodeQuarterFrame {
            value: data7(value, "quarter-frame value exceeds 7 bits")?,
        })
    }

    pub fn song_position(beats: u16) -> Result<Self> {
        Ok(MidiCommand::SongPosition {
            beats: data14(beats, "song position exceeds 14 bits")?,
        })
    }

    pub fn song_select(song: u8) -> Result<Self> {
        Ok(MidiCommand::SongSelect {
            song: data7(song, "song number exceeds 7 bits")?,
        })
    }

    pub fn real_time(status: u8) -> Result<Self> {
        if !(0xF8..=0xFF).contains(&status) || status == 0xF9 || status == 0xFD {
            return Err(Error::BadProperty("not a real-time status"));
        }
        Ok(MidiCommand::RealTime { status })
    }

    /// The status byte this command is routed by. SysEx fragments all route
    /// as `0xF0` even though continuations carry no status on the wire.
    pub fn status(&self) -> u8 {
        match self {
            MidiCommand::NoteOff { channel, .. } => 0x80 | channel,
            MidiCommand::NoteOn { channel, .. } => 0x90 | channel,
            MidiCommand::PolyphonicKeyPressure { channel, .. } => 0xA0 | channel,
            MidiCommand::ControlChange { channel, .. } => 0xB0 | channel,
            MidiCommand::ProgramChange { channel, .. } => 0xC0 | channel,
            MidiCommand::ChannelPressure { channel, .. } => 0xD0 | channel,
            MidiCommand::PitchBend { channel, .. } => 0xE0 | channel,
            MidiCommand::SystemExclusive { .. } => 0xF0,
            MidiCommand::TimeCodeQuarterFrame { .. } => 0xF1,
            MidiCommand::SongPosition { .. } => 0xF2,
            MidiCommand::SongSelect { .. } => 0xF3,
            MidiCommand::TuneRequest => 0xF6,
            MidiCommand::RealTime { status } => *status,
        }
    }

    /// Channel for channel-voice commands, `None` for system commands.
    pub fn channel(&self) -> Option<u8> {
        match self {
            MidiCommand::NoteOff { channel, .. }
            | MidiCommand::NoteOn { channel, .. }
            | MidiCommand::PolyphonicKeyPressure { channel, .. }
            | MidiCommand::ControlChange { channel, .. }
            | MidiCommand::ProgramChange { channel, .. }
            | MidiCommand::ChannelPressure { channel, .. }
            | MidiCommand::PitchBend { channel, .. } => Some(*channel),
            _ => None,
        }
    }

    pub fn is_channel_voice(&self) -> bool {
        self.channel().is_some()
    }

    /// Number of bytes this command occupies on the wire.
    pub fn wire_len(&self) -> usize {
        match self {
            MidiCommand::NoteOff { .. }
            | MidiCommand::NoteOn { .. }
            | MidiCommand::PolyphonicKeyPressure { .. }
            | MidiCommand::ControlChange { .. }
            | MidiCommand::PitchBend { .. }
            | MidiCommand::SongPosition { .. } => 3,
            MidiCommand::ProgramChange { .. }
            | MidiCommand::ChannelPressure { .. }
            | MidiCommand::TimeCodeQuarterFrame { .. }
            | MidiCommand::SongSelect { .. } => 2,
            MidiCommand::TuneRequest | MidiCommand::RealTime { .. } => 1,
            MidiCommand::SystemExclusive {
                fragment,
                data,
                terminated,
            } => {
                let status = usize::from(*fragment == 0);
                let end = usize::from(*terminated);
                status + data.len() + end
            }
        }
    }

    /// Wire length implied by a status byte; `None` for SysEx, whose length
    /// is delimited by `0xF7` or the end of the section.
    pub fn wire_len_from_status(status: u8) -> Result<Option<usize>> {
        match status & 0xF0 {
            0x80 | 0x90 | 0xA0 | 0xB0 | 0xE0 => Ok(Some(3)),
            0xC0 | 0xD0 => Ok(Some(2)),
            0xF0 => match status {
                0xF0 => Ok(None),
                0xF1 | 0xF3 => Ok(Some(2)),
                0xF2 => Ok(Some(3)),
                0xF6 => Ok(Some(1)),
                0xF8 | 0xFA | 0xFB | 0xFC | 0xFE | 0xFF => Ok(Some(1)),
                other => Err(Error::BadCommand(other)),
            },
            _ => Err(Error::BadCommand(status)),
        }
    }

    /// Appends the wire form of this command to `buf`.
    pub fn encode_to(&self, buf: &mut BytesMut) {
        match self {
            MidiCommand::NoteOff { key, velocity, .. }
            | MidiCommand::NoteOn { key, velocity, .. } => {
                buf.put_u8(self.status());
                buf.put_u8(*key);
                buf.put_u8(*velocity);
            }
            MidiCommand::PolyphonicKeyPressure { key, pressure, .. } => {
                buf.put_u8(self.status());
                buf.put_u8(*key);
                buf.put_u8(*pressure);
            }
            MidiCommand::ControlChange { control, value, .. } => {
                buf.put_u8(self.status());
                buf.put_u8(*control);
                buf.put_u8(*value);
            }
            MidiCommand::ProgramChange { program, .. } => {
                buf.put_u8(self.status());
                buf.put_u8(*program);
            }
            MidiCommand::ChannelPressure { pressure, .. } => {
                buf.put_u8(self.status());
                buf.put_u8(*pressure);
            }
            MidiCommand::PitchBend { value, .. } => {
                buf.put_u8(self.status());
                buf.put_u8((value & 0x7F) as u8);
                buf.put_u8((value >> 7) as u8);
            }
            MidiCommand::SystemExclusive {
                fragment,
                data,
                terminated,
            } => {
                if *fragment == 0 {
                    buf.put_u8(0xF0);
                }
                buf.put_slice(data);
                if *terminated {
                    buf.put_u8(0xF7);
                }
            }
            MidiCommand::TimeCodeQuarterFrame { value } => {
                buf.put_u8(0xF1);
                buf.put_u8(*value);
            }
            MidiCommand::SongPosition { beats } => {
                buf.put_u8(0xF2);
                buf.put_u8((beats & 0x7F) as u8);
                buf.put_u8((beats >> 7) as u8);
            }
            MidiCommand::SongSelect { song } => {
                buf.put_u8(0xF3);
                buf.put_u8(*song);
            }
            MidiCommand::TuneRequest => buf.put_u8(0xF6),
            MidiCommand::RealTime { status } => buf.put_u8(*status),
        }
    }

    /// Decodes one command from the front of `data`, honouring a running
    /// status for channel-voice commands. Returns the command and the bytes
    /// consumed.
    pub fn decode(data: &[u8], running: Option<u8>) -> Result<(Self, usize)> {
        let first = *data.first().ok_or(Error::Truncated)?;
        let (status, offset) = if first & 0x80 != 0 {
            (first, 1)
        } else {
            let status = running.ok_or(Error::BadCommand(first))?;
            if status & 0xF0 == 0xF0 {
                return Err(Error::BadCommand(first));
            }
            (status, 0)
        };
        let body = &data[offset..];

        let byte = |idx: usize| -> Result<u8> {
            let b = *body.get(idx).ok_or(Error::Truncated)?;
            if b > 0x7F {
                return Err(Error::BadCommand(b));
            }
            Ok(b)
        };

        let channel = status & 0x0F;
        let command = match status & 0xF0 {
            0x80 => MidiCommand::NoteOff {
                channel,
                key: byte(0)?,
                velocity: byte(1)?,
            },
            0x90 => MidiCommand::NoteOn {
                channel,
                key: byte(0)?,
                velocity: byte(1)?,
            },
            0xA0 => MidiCommand::PolyphonicKeyPressure {
                channel,
                key: byte(0)?,
                pressure: byte(1)?,
            },
            0xB0 => MidiCommand::ControlChange {
                channel,
                control: byte(0)?,
                value: byte(1)?,
            },
            0xC0 => MidiCommand::ProgramChange {
                channel,
                program: byte(0)?,
            },
            0xD0 => MidiCommand::ChannelPressure {
                channel,
                pressure: byte(0)?,
            },
            0xE0 => {
                let lsb = byte(0)?;
                let msb = byte(1)?;
                MidiCommand::PitchBend {
                    channel,
                    value: (u16::from(msb) << 7) | u16::from(lsb),
                }
            }
            0xF0 => match status {
                0xF0 => return Self::decode_sysex_start(body),
                0xF1 => MidiCommand::TimeCodeQuarterFrame { value: byte(0)? },
                0xF2 => {
                    let lsb = byte(0)?;
                    let msb = byte(1)?;
                    MidiCommand::SongPosition {
                        beats: (u16::from(msb) << 7) | u16::from(lsb),
                    }
                }
                0xF3 => MidiCommand::SongSelect { song: byte(0)? },
                0xF6 => MidiCommand::TuneRequest,
                0xF8 | 0xFA | 0xFB | 0xFC | 0xFE | 0xFF => MidiCommand::RealTime { status },
                other => return Err(Error::BadCommand(other)),
            },
            _ => return Err(Error::BadCommand(status)),
        };
        // wire_len counts the status byte; with running status it was not
        // present in the buffer.
        let consumed = command.wire_len() - 1 + offset;
        Ok((command, consumed))
    }

    fn decode_sysex_start(body: &[u8]) -> Result<(Self, usize)> {
        let mut data = Vec::new();
        for (i, &b) in body.iter().enumerate() {
            if b == 0xF7 {
                return Ok((
                    MidiCommand::SystemExclusive {
                        fragment: 0,
                        data,
                        terminated: true,
                    },
                    1 + i + 1,
                ));
            }
            if b > 0x7F {
                return Err(Error::BadCommand(b));
            }
            data.push(b);
        }
        let consumed = 1 + data.len();
        Ok((
            MidiCommand::SystemExclusive {
                fragment: 0,
                data,
                terminated: false,
            },
            consumed,
        ))
    }

    /// Decodes a SysEx continuation fragment: data only, optionally ended by
    /// `0xF7`.
    pub fn decode_continuation(fragment: u8, body: &[u8]) -> Result<(Self, usize)> {
        let mut data = Vec::new();
        for (i, &b) in body.iter().enumerate() {
            if b == 0xF7 {
                return Ok((
                    MidiCommand::SystemExclusive {
                        fragment,
                        data,
                        terminated: true,
                    },
                    i + 1,
                ));
            }
            if b > 0x7F {
                return Err(Error::BadCommand(b));
            }
            data.push(b);
        }
        let consumed = data.len();
        Ok((
            MidiCommand::SystemExclusive {
                fragment,
                data,
                terminated: false,
            },
            consumed,
        ))
    }
}
