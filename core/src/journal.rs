//! RTP-MIDI recovery journal.
//!
//! The sender records the most recent persistent-effect state per channel
//! (program, controls, parameter system, pitch wheel, active notes, recent
//! releases, pressure) plus a system chapter, each entry stamped with the
//! send sequence number of its last update. The journal is appended to
//! outgoing packets so a receiver can rebuild the state lost in a gap;
//! receiver feedback truncates it.
//!
//! Wire layout, network byte order, bit-packed headers:
//!
//! ```text
//! journal     := |S|Y|A|H|TOTCHAN(4)| checkpoint(16) [system] [channel]*
//! system      := |S|D|C|Q|F|X|LENGTH(10)| [simple] [select] [position] [mtc] [sysex]
//! channel     := |S|CHAN(4)|H|LENGTH(10)|TOC(8)| chapters…
//! ```
//!
//! `Y`/`A` flag the presence of the system journal and of `TOTCHAN + 1`
//! channel journals. The TOC bits are, high to low, P C M W N E T A, and
//! the chapters follow in that order.

use std::collections::VecDeque;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::message::MidiCommand;
use crate::seq;

const FLAG_S: u8 = 0x80;
const FLAG_Y: u8 = 0x40;
const FLAG_A: u8 = 0x20;

const TOC_P: u8 = 0x80;
const TOC_C: u8 = 0x40;
const TOC_M: u8 = 0x20;
const TOC_W: u8 = 0x10;
const TOC_N: u8 = 0x08;
const TOC_E: u8 = 0x04;
const TOC_T: u8 = 0x02;
const TOC_A: u8 = 0x01;

const SYS_D: u16 = 0x4000;
const SYS_C: u16 = 0x2000;
const SYS_Q: u16 = 0x1000;
const SYS_F: u16 = 0x0800;
const SYS_X: u16 = 0x0400;

/// Simple system statuses journaled as a presence bitmask, in recovery
/// order: clock, start, continue, stop, active sensing, tune request, reset.
const SIMPLE_STATUSES: [u8; 7] = [0xF8, 0xFA, 0xFB, 0xFC, 0xFE, 0xF6, 0xFF];

/// Bound on the per-channel release log; chapter headers carry 7-bit counts
/// and the channel length field is 10 bits.
const OFF_LOG_LIMIT: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot<T> {
    value: T,
    seq: u16,
}

impl<T> Slot<T> {
    fn new(value: T, seq: u16) -> Self {
        Self { value, seq }
    }

    fn live(&self, checkpoint: u16) -> bool {
        seq::newer(self.seq, checkpoint)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProgramState {
    program: u8,
    bank_msb: Option<u8>,
    bank_lsb: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ControlState {
    value: u8,
    /// Toggle semantics for switch controllers (64–69): on iff value ≥ 64.
    toggle: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct ParameterState {
    nrpn: bool,
    number_msb: u8,
    number_lsb: u8,
    data_msb: Option<u8>,
    data_lsb: Option<u8>,
    /// Net data increments (+) / decrements (−) not yet folded into a data
    /// entry, saturating at ±7.
    pending: i8,
}

#[derive(Debug, Clone, Copy)]
struct OffEntry {
    key: u8,
    velocity: u8,
    seq: u16,
}

#[derive(Debug, Clone)]
struct ChannelJournal {
    program: Option<Slot<ProgramState>>,
    bank_msb: Option<u8>,
    bank_lsb: Option<u8>,
    controls: Vec<Option<Slot<ControlState>>>,
    parameter: Option<Slot<ParameterState>>,
    wheel: Option<Slot<u16>>,
    notes: Vec<Option<Slot<u8>>>,
    off_log: VecDeque<OffEntry>,
    pressure: Option<Slot<u8>>,
    poly: Vec<Option<Slot<u8>>>,
}

impl Default for ChannelJournal {
    fn default() -> Self {
        Self {
            program: None,
            bank_msb: None,
            bank_lsb: None,
            controls: vec![None; 128],
            parameter: None,
            wheel: None,
            notes: vec![None; 128],
            off_log: VecDeque::new(),
            pressure: None,
            poly: vec![None; 128],
        }
    }
}

#[derive(Debug, Clone, Default)]
struct SystemJournal {
    /// status byte → seq of its latest occurrence.
    simple: Vec<(u8, u16)>,
    mtc: Option<Slot<u8>>,
    song_position: Option<Slot<u16>>,
    song_select: Option<Slot<u8>>,
    /// Fragment index and termination flag of the latest SysEx activity.
    sysex: Option<Slot<(u8, bool)>>,
}

/// Sender-side journal state for one peer.
#[derive(Debug, Clone)]
pub struct Journal {
    checkpoint: u16,
    last_update: Option<u16>,
    channels: Vec<Option<ChannelJournal>>,
    system: SystemJournal,
}

impl Journal {
    /// `checkpoint` is the sequence number of the last packet the peer is
    /// assumed to have; entries at or before it are never emitted.
    pub fn with_checkpoint(checkpoint: u16) -> Self {
        Self {
            checkpoint,
            last_update: None,
            channels: (0..16).map(|_| None).collect(),
            system: SystemJournal::default(),
        }
    }

    pub fn checkpoint(&self) -> u16 {
        self.checkpoint
    }

    /// True when nothing newer than the checkpoint is recorded.
    pub fn is_empty(&self) -> bool {
        self.last_update
            .map_or(true, |last| !seq::newer(last, self.checkpoint))
    }

    fn channel_mut(&mut self, channel: u8) -> &mut ChannelJournal {
        self.channels[usize::from(channel & 0x0F)].get_or_insert_with(ChannelJournal::default)
    }

    /// Records one outgoing command under the packet sequence that carries
    /// it.
    pub fn record(&mut self, sequence: u16, command: &MidiCommand) {
        match *command {
            MidiCommand::NoteOn {
                channel,
                key,
                velocity,
            } if velocity > 0 => {
                let ch = self.channel_mut(channel);
                ch.notes[usize::from(key)] = Some(Slot::new(velocity, sequence));
            }
            MidiCommand::NoteOn { channel, key, .. } => {
                self.channel_mut(channel).release(key, 0, sequence);
            }
            MidiCommand::NoteOff {
                channel,
                key,
                velocity,
            } => {
                self.channel_mut(channel).release(key, velocity, sequence);
            }
            MidiCommand::PolyphonicKeyPressure {
                channel,
                key,
                pressure,
            } => {
                self.channel_mut(channel).poly[usize::from(key)] =
                    Some(Slot::new(pressure, sequence));
            }
            MidiCommand::ControlChange {
                channel,
                control,
                value,
            } => {
                self.channel_mut(channel).control_change(control, value, sequence);
            }
            MidiCommand::ProgramChange { channel, program } => {
                let ch = self.channel_mut(channel);
                ch.program = Some(Slot::new(
                    ProgramState {
                        program,
                        bank_msb: ch.bank_msb,
                        bank_lsb: ch.bank_lsb,
                    },
                    sequence,
                ));
            }
            MidiCommand::ChannelPressure { channel, pressure } => {
                self.channel_mut(channel).pressure = Some(Slot::new(pressure, sequence));
            }
            MidiCommand::PitchBend { channel, value } => {
                self.channel_mut(channel).wheel = Some(Slot::new(value, sequence));
            }
            MidiCommand::SystemExclusive {
                fragment,
                terminated,
                ..
            } => {
                self.system.sysex = Some(Slot::new((fragment, terminated), sequence));
            }
            MidiCommand::TimeCodeQuarterFrame { value } => {
                self.system.mtc = Some(Slot::new(value, sequence));
            }
            MidiCommand::SongPosition { beats } => {
                self.system.song_position = Some(Slot::new(beats, sequence));
            }
            MidiCommand::SongSelect { song } => {
                self.system.song_select = Some(Slot::new(song, sequence));
            }
            MidiCommand::TuneRequest => self.system.touch_simple(0xF6, sequence),
            MidiCommand::RealTime { status } => self.system.touch_simple(status, sequence),
        }
        self.last_update = Some(sequence);
    }

    /// Drops every entry acknowledged by `ack` and advances the checkpoint.
    pub fn truncate(&mut self, ack: u16) {
        if !seq::newer(ack, self.checkpoint) {
            return;
        }
        self.checkpoint = ack;
        for slot in self.channels.iter_mut() {
            if let Some(ch) = slot {
                ch.drop_acknowledged(ack);
                if ch.is_empty() {
                    *slot = None;
                }
            }
        }
        self.system.drop_acknowledged(ack);
    }

    /// Serializes the chapters still uncovered by the checkpoint; `None`
    /// when the journal has nothing to say.
    pub fn encode(&self) -> Option<BytesMut> {
        let mut channel_parts: Vec<BytesMut> = Vec::new();
        for (index, slot) in self.channels.iter().enumerate() {
            if let Some(ch) = slot {
                if let Some(part) = ch.encode(index as u8, self.checkpoint) {
                    channel_parts.push(part);
                }
            }
        }
        let system_part = self.system.encode(self.checkpoint);
        if channel_parts.is_empty() && system_part.is_none() {
            return None;
        }

        let single_loss = self
            .last_update
            .map_or(false, |last| last == self.checkpoint.wrapping_add(1));

        let mut buf = BytesMut::with_capacity(64);
        let mut byte0 = 0u8;
        if single_loss {
            byte0 |= FLAG_S;
        }
        if system_part.is_some() {
            byte0 |= FLAG_Y;
        }
        if !channel_parts.is_empty() {
            byte0 |= FLAG_A;
            byte0 |= (channel_parts.len() - 1) as u8;
        }
        buf.put_u8(byte0);
        buf.put_u16(self.checkpoint);
        if let Some(part) = system_part {
            buf.put_slice(&part);
        }
        for part in channel_parts {
            buf.put_slice(&part);
        }
        Some(buf)
    }
}

impl ChannelJournal {
    fn release(&mut self, key: u8, velocity: u8, sequence: u16) {
        self.notes[usize::from(key)] = None;
        self.off_log.retain(|entry| entry.key != key);
        if self.off_log.len() == OFF_LOG_LIMIT {
            self.off_log.pop_front();
        }
        self.off_log.push_back(OffEntry {
            key,
            velocity,
            seq: sequence,
        });
    }

    fn control_change(&mut self, control: u8, value: u8, sequence: u16) {
        let toggle = (64..=69).contains(&control) && value >= 64;
        self.controls[usize::from(control)] = Some(Slot::new(ControlState { value, toggle }, sequence));
        match control {
            0 => self.bank_msb = Some(value),
            32 => self.bank_lsb = Some(value),
            101 => self.parameter_mut(sequence, |p| {
                p.nrpn = false;
                p.number_msb = value;
            }),
            100 => self.parameter_mut(sequence, |p| {
                p.nrpn = false;
                p.number_lsb = value;
            }),
            99 => self.parameter_mut(sequence, |p| {
                p.nrpn = true;
                p.number_msb = value;
            }),
            98 => self.parameter_mut(sequence, |p| {
                p.nrpn = true;
                p.number_lsb = value;
            }),
            6 => self.parameter_mut(sequence, |p| {
                p.data_msb = Some(value);
                p.pending = 0;
            }),
            38 => self.parameter_mut(sequence, |p| p.data_lsb = Some(value)),
            96 => self.parameter_mut(sequence, |p| p.pending = (p.pending + 1).min(7)),
            97 => self.parameter_mut(sequence, |p| p.pending = (p.pending - 1).max(-7)),
            _ => {}
        }
    }

    fn parameter_mut(&mut self, sequence: u16, update: impl FnOnce(&mut ParameterState)) {
        let mut slot = self
            .parameter
            .take()
            .unwrap_or_else(|| Slot::new(ParameterState::default(), sequence));
        update(&mut slot.value);
        slot.seq = sequence;
        self.parameter = Some(slot);
    }

    fn drop_acknowledged(&mut self, ack: u16) {
        let stale = |seq: u16| !seq::newer(seq, ack);
        if self.program.map_or(false, |s| stale(s.seq)) {
            self.program = None;
        }
        for control in self.controls.iter_mut() {
            if control.map_or(false, |s| stale(s.seq)) {
                *control = None;
            }
        }
        if self.parameter.map_or(false, |s| stale(s.seq)) {
            self.parameter = None;
        }
        if self.wheel.map_or(false, |s| stale(s.seq)) {
            self.wheel = None;
        }
        for note in self.notes.iter_mut() {
            if note.map_or(false, |s| stale(s.seq)) {
                *note = None;
            }
        }
        self.off_log.retain(|entry| !stale(entry.seq));
        if self.pressure.map_or(false, |s| stale(s.seq)) {
            self.pressure = None;
        }
        for pressure in self.poly.iter_mut() {
            if pressure.map_or(false, |s| stale(s.seq)) {
                *pressure = None;
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.program.is_none()
            && self.controls.iter().all(Option::is_none)
            && self.parameter.is_none()
            && self.wheel.is_none()
            && self.notes.iter().all(Option::is_none)
            && self.off_log.is_empty()
            && self.pressure.is_none()
            && self.poly.iter().all(Option::is_none)
    }

    fn encode(&self, channel: u8, checkpoint: u16) -> Option<BytesMut> {
        let mut chapters = BytesMut::new();
        let mut toc = 0u8;

        if let Some(slot) = self.program.filter(|s| s.live(checkpoint)) {
            toc |= TOC_P;
            chapters.put_u8(slot.value.program);
            let bank_known = slot.value.bank_msb.is_some() || slot.value.bank_lsb.is_some();
            chapters.put_u8((u8::from(bank_known) << 7) | slot.value.bank_msb.unwrap_or(0));
            chapters.put_u8(slot.value.bank_lsb.unwrap_or(0));
        }

        let controls: Vec<(u8, ControlState)> = self
            .controls
            .iter()
            .enumerate()
            .filter_map(|(n, slot)| {
                slot.filter(|s| s.live(checkpoint))
                    .map(|s| (n as u8, s.value))
            })
            .collect();
        if !controls.is_empty() {
            toc |= TOC_C;
            chapters.put_u8((controls.len() - 1) as u8);
            for (number, state) in &controls {
                chapters.put_u8(*number);
                chapters.put_u8((u8::from(state.toggle) << 7) | state.value);
            }
        }

        if let Some(slot) = self.parameter.filter(|s| s.live(checkpoint)) {
            toc |= TOC_M;
            let p = slot.value;
            let mut flags = 0u8;
            if p.nrpn {
                flags |= 0x40;
            }
            if p.data_msb.is_some() {
                flags |= 0x20;
            }
            if p.data_lsb.is_some() {
                flags |= 0x10;
            }
            if p.pending < 0 {
                flags |= 0x08;
            }
            flags |= p.pending.unsigned_abs() & 0x07;
            chapters.put_u8(flags);
            chapters.put_u8(p.number_msb);
            chapters.put_u8(p.number_lsb);
            chapters.put_u8(p.data_msb.unwrap_or(0));
            chapters.put_u8(p.data_lsb.unwrap_or(0));
        }

        if let Some(slot) = self.wheel.filter(|s| s.live(checkpoint)) {
            toc |= TOC_W;
            chapters.put_u8((slot.value >> 7) as u8);
            chapters.put_u8((slot.value & 0x7F) as u8);
        }

        let notes: Vec<(u8, u8)> = self
            .notes
            .iter()
            .enumerate()
            .filter_map(|(key, slot)| {
                slot.filter(|s| s.live(checkpoint))
                    .map(|s| (key as u8, s.value))
            })
            .collect();
        let offs: Vec<&OffEntry> = self
            .off_log
            .iter()
            .filter(|entry| seq::newer(entry.seq, checkpoint))
            .collect();
        if !notes.is_empty() || !offs.is_empty() {
            toc |= TOC_N;
            chapters.put_u8(notes.len().min(127) as u8);
            // LOW > HIGH encodes an empty OFFBITS range.
            let (low, high) = offs
                .iter()
                .fold((15u8, 0u8), |(lo, hi), e| (lo.min(e.key / 8), hi.max(e.key / 8)));
            chapters.put_u8((low << 4) | high);
            for (key, velocity) in notes.iter().take(127) {
                chapters.put_u8(*key);
                chapters.put_u8(0x80 | velocity);
            }
            if low <= high {
                for octet in low..=high {
                    let mut bits = 0u8;
                    for entry in &offs {
                        if entry.key / 8 == octet {
                            bits |= 1 << (entry.key % 8);
                        }
                    }
                    chapters.put_u8(bits);
                }
            }
        }

        if !offs.is_empty() {
            toc |= TOC_E;
            chapters.put_u8((offs.len() - 1) as u8);
            for entry in &offs {
                chapters.put_u8(entry.key);
                chapters.put_u8(entry.velocity);
            }
        }

        if let Some(slot) = self.pressure.filter(|s| s.live(checkpoint)) {
            toc |= TOC_T;
            chapters.put_u8(slot.value);
        }

        let poly: Vec<(u8, u8)> = self
            .poly
            .iter()
            .enumerate()
            .filter_map(|(key, slot)| {
                slot.filter(|s| s.live(checkpoint))
                    .map(|s| (key as u8, s.value))
            })
            .collect();
        if !poly.is_empty() {
            toc |= TOC_A;
            chapters.put_u8((poly.len() - 1) as u8);
            for (key, pressure) in &poly {
                chapters.put_u8(*key);
                chapters.put_u8(*pressure);
            }
        }

        if toc == 0 {
            return None;
        }
        let length = (chapters.len() + 3) as u32;
        let mut buf = BytesMut::with_capacity(chapters.len() + 3);
        let header = (u32::from(channel) << 19) | (length << 8) | u32::from(toc);
        buf.put_u8((header >> 16) as u8);
        buf.put_u8((header >> 8) as u8);
        buf.put_u8(header as u8);
        buf.put_slice(&chapters);
        Some(buf)
    }
}

impl SystemJournal {
    fn touch_simple(&mut self, status: u8, sequence: u16) {
        if let Some(entry) = self.simple.iter_mut().find(|(s, _)| *s == status) {
            entry.1 = sequence;
        } else {
            self.simple.push((status, sequence));
        }
    }

    fn drop_acknowledged(&mut self, ack: u16) {
        self.simple.retain(|(_, seq)| seq::newer(*seq, ack));
        let stale = |seq: u16| !seq::newer(seq, ack);
        if self.mtc.map_or(false, |s| stale(s.seq)) {
            self.mtc = None;
        }
        if self.song_position.map_or(false, |s| stale(s.seq)) {
            self.song_position = None;
        }
        if self.song_select.map_or(false, |s| stale(s.seq)) {
            self.song_select = None;
        }
        if self.sysex.map_or(false, |s| stale(s.seq)) {
            self.sysex = None;
        }
    }

    fn encode(&self, checkpoint: u16) -> Option<BytesMut> {
        let mut body = BytesMut::new();
        let mut flags = 0u16;

        let mut simple_mask = 0u8;
        for (status, seq) in &self.simple {
            if seq::newer(*seq, checkpoint) {
                if let Some(bit) = SIMPLE_STATUSES.iter().position(|s| s == status) {
                    simple_mask |= 1 << bit;
                }
            }
        }
        if simple_mask != 0 {
            flags |= SYS_D;
            body.put_u8(simple_mask);
        }
        if let Some(slot) = self.song_select.filter(|s| s.live(checkpoint)) {
            flags |= SYS_C;
            body.put_u8(slot.value);
        }
        if let Some(slot) = self.song_position.filter(|s| s.live(checkpoint)) {
            flags |= SYS_Q;
            body.put_u8((slot.value >> 7) as u8);
            body.put_u8((slot.value & 0x7F) as u8);
        }
        if let Some(slot) = self.mtc.filter(|s| s.live(checkpoint)) {
            flags |= SYS_F;
            body.put_u8(slot.value);
        }
        if let Some(slot) = self.sysex.filter(|s| s.live(checkpoint)) {
            flags |= SYS_X;
            body.put_u8((u8::from(slot.value.1) << 7) | (slot.value.0 & 0x7F));
        }

        if flags == 0 {
            return None;
        }
        let mut buf = BytesMut::with_capacity(body.len() + 2);
        buf.put_u16(flags | (body.len() as u16 + 2));
        buf.put_slice(&body);
        Some(buf)
    }
}

/// Receiver-side view of a decoded journal.
#[derive(Debug, Clone, Default)]
pub struct ParsedJournal {
    pub checkpoint: u16,
    pub single_loss: bool,
    pub system: Option<ParsedSystem>,
    pub channels: Vec<ParsedChannel>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedSystem {
    pub simple: Vec<u8>,
    pub song_select: Option<u8>,
    pub song_position: Option<u16>,
    pub mtc: Option<u8>,
    pub sysex: Option<(u8, bool)>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedChannel {
    pub channel: u8,
    pub program: Option<(u8, Option<u8>, Option<u8>)>,
    pub controls: Vec<(u8, u8, bool)>,
    pub parameter: Option<ParsedParameter>,
    pub wheel: Option<u16>,
    pub notes: Vec<(u8, u8)>,
    pub offs: Vec<(u8, u8)>,
    pub pressure: Option<u8>,
    pub poly: Vec<(u8, u8)>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ParsedParameter {
    pub nrpn: bool,
    pub number_msb: u8,
    pub number_lsb: u8,
    pub data_msb: Option<u8>,
    pub data_lsb: Option<u8>,
    pub pending: i8,
}

fn take(reader: &mut Bytes, n: usize) -> Result<Bytes> {
    if reader.remaining() < n {
        return Err(Error::Decode("journal shorter than its headers promise"));
    }
    Ok(reader.split_to(n))
}

impl ParsedJournal {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Bytes::copy_from_slice(data);
        if reader.remaining() < 3 {
            return Err(Error::Decode("journal header too short"));
        }
        let byte0 = reader.get_u8();
        let checkpoint = reader.get_u16();
        let single_loss = byte0 & FLAG_S != 0;

        let system = if byte0 & FLAG_Y != 0 {
            Some(ParsedSystem::decode(&mut reader)?)
        } else {
            None
        };

        let mut channels = Vec::new();
        if byte0 & FLAG_A != 0 {
            let count = usize::from(byte0 & 0x0F) + 1;
            for _ in 0..count {
                channels.push(ParsedChannel::decode(&mut reader)?);
            }
        }

        Ok(Self {
            checkpoint,
            single_loss,
            system,
            channels,
        })
    }

    /// Synthesizes the commands a receiver should observe for the lost
    /// range, in canonical order: system first, then each channel's
    /// P, C, M, W, N, E, T, A chapters.
    pub fn recover(&self) -> Vec<MidiCommand> {
        let mut out = Vec::new();
        if let Some(system) = &self.system {
            for &status in &system.simple {
                if status == 0xF6 {
                    out.push(MidiCommand::TuneRequest);
                } else {
                    out.push(MidiCommand::RealTime { status });
                }
            }
            if let Some(value) = system.mtc {
                out.push(MidiCommand::TimeCodeQuarterFrame { value });
            }
            if let Some(beats) = system.song_position {
                out.push(MidiCommand::SongPosition { beats });
            }
            if let Some(song) = system.song_select {
                out.push(MidiCommand::SongSelect { song });
            }
        }
        for ch in &self.channels {
            let channel = ch.channel;
            let cc = |control: u8, value: u8| MidiCommand::ControlChange {
                channel,
                control,
                value,
            };
            if let Some((program, bank_msb, bank_lsb)) = ch.program {
                if let Some(msb) = bank_msb {
                    out.push(cc(0, msb));
                }
                if let Some(lsb) = bank_lsb {
                    out.push(cc(32, lsb));
                }
                out.push(MidiCommand::ProgramChange { channel, program });
            }
            for &(control, value, _toggle) in &ch.controls {
                out.push(cc(control, value));
            }
            if let Some(p) = ch.parameter {
                if p.nrpn {
                    out.push(cc(99, p.number_msb));
                    out.push(cc(98, p.number_lsb));
                } else {
                    out.push(cc(101, p.number_msb));
                    out.push(cc(100, p.number_lsb));
                }
                if let Some(msb) = p.data_msb {
                    out.push(cc(6, msb));
                }
                if let Some(lsb) = p.data_lsb {
                    out.push(cc(38, lsb));
                }
                let (control, count) = if p.pending >= 0 {
                    (96, p.pending)
                } else {
                    (97, -p.pending)
                };
                for _ in 0..count {
                    out.push(cc(control, 0));
                }
            }
            if let Some(value) = ch.wheel {
                out.push(MidiCommand::PitchBend { channel, value });
            }
            for &(key, velocity) in &ch.notes {
                out.push(MidiCommand::NoteOn {
                    channel,
                    key,
                    velocity,
                });
            }
            for &(key, velocity) in &ch.offs {
                out.push(MidiCommand::NoteOff {
                    channel,
                    key,
                    velocity,
                });
            }
            if let Some(pressure) = ch.pressure {
                out.push(MidiCommand::ChannelPressure { channel, pressure });
            }
            for &(key, pressure) in &ch.poly {
                out.push(MidiCommand::PolyphonicKeyPressure {
                    channel,
                    key,
                    pressure,
                });
            }
        }
        out
    }
}

impl ParsedSystem {
    fn decode(reader: &mut Bytes) -> Result<Self> {
        if reader.remaining() < 2 {
            return Err(Error::Decode("system chapter header too short"));
        }
        let header = reader.get_u16();
        let length = usize::from(header & 0x03FF);
        if length < 2 {
            return Err(Error::Decode("system chapter length too small"));
        }
        let mut body = take(reader, length - 2)?;

        let mut parsed = ParsedSystem::default();
        if header & SYS_D != 0 {
            let mask = take(&mut body, 1)?[0];
            for (bit, &status) in SIMPLE_STATUSES.iter().enumerate() {
                if mask & (1 << bit) != 0 {
                    parsed.simple.push(status);
                }
            }
        }
        if header & SYS_C != 0 {
            parsed.song_select = Some(take(&mut body, 1)?[0] & 0x7F);
        }
        if header & SYS_Q != 0 {
            let bytes = take(&mut body, 2)?;
            parsed.song_position =
                Some((u16::from(bytes[0] & 0x7F) << 7) | u16::from(bytes[1] & 0x7F));
        }
        if header & SYS_F != 0 {
            parsed.mtc = Some(take(&mut body, 1)?[0] & 0x7F);
        }
        if header & SYS_X != 0 {
            let byte = take(&mut body, 1)?[0];
            parsed.sysex = Some((byte & 0x7F, byte & 0x80 != 0));
        }
        if !body.is_empty() {
            return Err(Error::Decode("system chapter has trailing bytes"));
        }
        Ok(parsed)
    }
}

impl ParsedChannel {
    fn decode(reader: &mut Bytes) -> Result<Self> {
        let header = take(reader, 3)?;
        let word = (u32::from(header[0]) << 16) | (u32::from(header[1]) << 8) | u32::from(header[2]);
        let channel = ((word >> 19) & 0x0F) as u8;
        let length = usize::from(((word >> 8) & 0x03FF) as u16);
        let toc = (word & 0xFF) as u8;
        if length < 3 {
            return Err(Error::Decode("channel journal length too small"));
        }
        let mut body = take(reader, length - 3)?;

        let mut parsed = ParsedChannel {
            channel,
            ..ParsedChannel::default()
        };

        if toc & TOC_P != 0 {
            let bytes = take(&mut body, 3)?;
            let bank_known = bytes[1] & 0x80 != 0;
            parsed.program = Some((
                bytes[0] & 0x7F,
                bank_known.then_some(bytes[1] & 0x7F),
                bank_known.then_some(bytes[2] & 0x7F),
            ));
        }
        if toc & TOC_C != 0 {
            let count = usize::from(take(&mut body, 1)?[0]) + 1;
            for _ in 0..count {
                let bytes = take(&mut body, 2)?;
                parsed
                    .controls
                    .push((bytes[0] & 0x7F, bytes[1] & 0x7F, bytes[1] & 0x80 != 0));
            }
        }
        if toc & TOC_M != 0 {
            let bytes = take(&mut body, 5)?;
            let flags = bytes[0];
            let magnitude = (flags & 0x07) as i8;
            parsed.parameter = Some(ParsedParameter {
                nrpn: flags & 0x40 != 0,
                number_msb: bytes[1] & 0x7F,
                number_lsb: bytes[2] & 0x7F,
                data_msb: (flags & 0x20 != 0).then_some(bytes[3] & 0x7F),
                data_lsb: (flags & 0x10 != 0).then_some(bytes[4] & 0x7F),
                pending: if flags & 0x08 != 0 { -magnitude } else { magnitude },
            });
        }
        if toc & TOC_W != 0 {
            let bytes = take(&mut body, 2)?;
            parsed.wheel = Some((u16::from(bytes[0] & 0x7F) << 7) | u16::from(bytes[1] & 0x7F));
        }
        let mut offbit_keys: Vec<u8> = Vec::new();
        if toc & TOC_N != 0 {
            let header = take(&mut body, 2)?;
            let count = usize::from(header[0] & 0x7F);
            let low = header[1] >> 4;
            let high = header[1] & 0x0F;
            for _ in 0..count {
                let bytes = take(&mut body, 2)?;
                parsed.notes.push((bytes[0] & 0x7F, bytes[1] & 0x7F));
            }
            if low <= high {
                for octet in low..=high {
                    let bits = take(&mut body, 1)?[0];
                    for bit in 0..8 {
                        if bits & (1 << bit) != 0 {
                            offbit_keys.push(octet * 8 + bit);
                        }
                    }
                }
            }
        }
        if toc & TOC_E != 0 {
            let count = usize::from(take(&mut body, 1)?[0]) + 1;
            for _ in 0..count {
                let bytes = take(&mut body, 2)?;
                parsed.offs.push((bytes[0] & 0x7F, bytes[1] & 0x7F));
            }
        }
        // Releases only present as OFFBITS (beyond the E log) surface with
        // velocity zero.
        for key in offbit_keys {
            if !parsed.offs.iter().any(|(k, _)| *k == key) {
                parsed.offs.push((key, 0));
            }
        }
        if toc & TOC_T != 0 {
            parsed.pressure = Some(take(&mut body, 1)?[0] & 0x7F);
        }
        if toc & TOC_A != 0 {
            let count = usize::from(take(&mut body, 1)?[0]) + 1;
            for _ in 0..count {
                let bytes = take(&mut body, 2)?;
                parsed.poly.push((bytes[0] & 0x7F, bytes[1] & 0x7F));
            }
        }
        if !body.is_empty() {
            return Err(Error::Decode("channel journal has trailing bytes"));
        }
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cc(channel: u8, control: u8, value: u8) -> MidiCommand {
        MidiCommand::control_change(channel, control, value).unwrap()
    }

    fn roundtrip(journal: &Journal) -> ParsedJournal {
        let wire = journal.encode().expect("journal should encode");
        ParsedJournal::decode(&wire).expect("journal should decode")
    }

    #[test]
    fn empty_journal_encodes_to_nothing() {
        let journal = Journal::with_checkpoint(9);
        assert!(journal.is_empty());
        assert!(journal.encode().is_none());
    }

    #[test]
    fn program_chapter_roundtrip() {
        let mut journal = Journal::with_checkpoint(9);
        journal.record(10, &MidiCommand::program_change(1, 7).unwrap());
        let parsed = roundtrip(&journal);
        assert_eq!(parsed.checkpoint, 9);
        assert!(parsed.single_loss);
        assert_eq!(parsed.channels.len(), 1);
        assert_eq!(parsed.channels[0].channel, 1);
        assert_eq!(parsed.channels[0].program, Some((7, None, None)));
        assert_eq!(
            parsed.recover(),
            vec![MidiCommand::ProgramChange {
                channel: 1,
                program: 7
            }]
        );
    }

    #[test]
    fn program_chapter_carries_bank_select() {
        let mut journal = Journal::with_checkpoint(0);
        journal.record(1, &cc(2, 0, 5));
        journal.record(1, &cc(2, 32, 9));
        journal.record(2, &MidiCommand::program_change(2, 30).unwrap());
        journal.truncate(1);
        let parsed = roundtrip(&journal);
        assert_eq!(parsed.channels[0].program, Some((30, Some(5), Some(9))));
        let recovered = parsed.recover();
        assert_eq!(
            recovered,
            vec![
                cc(2, 0, 5),
                cc(2, 32, 9),
                MidiCommand::ProgramChange {
                    channel: 2,
                    program: 30
                },
            ]
        );
    }

    #[test]
    fn control_chapter_keeps_latest_value_per_controller() {
        let mut journal = Journal::with_checkpoint(0);
        journal.record(1, &cc(0, 7, 100));
        journal.record(2, &cc(0, 7, 101));
        journal.record(3, &cc(0, 64, 127));
        let parsed = roundtrip(&journal);
        let controls = &parsed.channels[0].controls;
        assert_eq!(controls.len(), 2);
        assert!(controls.contains(&(7, 101, false)));
        assert!(controls.contains(&(64, 127, true)));
    }

    #[test]
    fn parameter_chapter_tracks_rpn_state() {
        let mut journal = Journal::with_checkpoint(0);
        journal.record(1, &cc(0, 101, 0));
        journal.record(1, &cc(0, 100, 2));
        journal.record(2, &cc(0, 6, 64));
        journal.record(3, &cc(0, 96, 0));
        journal.record(4, &cc(0, 96, 0));
        let parsed = roundtrip(&journal);
        let p = parsed.channels[0].parameter.unwrap();
        assert!(!p.nrpn);
        assert_eq!((p.number_msb, p.number_lsb), (0, 2));
        assert_eq!(p.data_msb, Some(64));
        assert_eq!(p.pending, 2);
    }

    #[test]
    fn note_chapter_tracks_ons_and_offs() {
        let mut journal = Journal::with_checkpoint(0);
        journal.record(1, &MidiCommand::note_on(0, 60, 100).unwrap());
        journal.record(2, &MidiCommand::note_on(0, 64, 90).unwrap());
        journal.record(3, &MidiCommand::note_off(0, 60, 40).unwrap());
        let parsed = roundtrip(&journal);
        let ch = &parsed.channels[0];
        assert_eq!(ch.notes, vec![(64, 90)]);
        assert_eq!(ch.offs, vec![(60, 40)]);
        let recovered = parsed.recover();
        assert_eq!(
            recovered,
            vec![
                MidiCommand::NoteOn {
                    channel: 0,
                    key: 64,
                    velocity: 90
                },
                MidiCommand::NoteOff {
                    channel: 0,
                    key: 60,
                    velocity: 40
                },
            ]
        );
    }

    #[test]
    fn wheel_pressure_and_poly_roundtrip() {
        let mut journal = Journal::with_checkpoint(0);
        journal.record(1, &MidiCommand::pitch_bend(5, 0x1234).unwrap());
        journal.record(2, &MidiCommand::channel_pressure(5, 33).unwrap());
        journal.record(3, &MidiCommand::poly_pressure(5, 61, 44).unwrap());
        let parsed = roundtrip(&journal);
        let ch = &parsed.channels[0];
        assert_eq!(ch.wheel, Some(0x1234));
        assert_eq!(ch.pressure, Some(33));
        assert_eq!(ch.poly, vec![(61, 44)]);
    }

    #[test]
    fn system_chapter_roundtrip() {
        let mut journal = Journal::with_checkpoint(0);
        journal.record(1, &MidiCommand::real_time(0xFA).unwrap());
        journal.record(2, &MidiCommand::time_code(0x21).unwrap());
        journal.record(3, &MidiCommand::song_position(0x0123).unwrap());
        journal.record(4, &MidiCommand::song_select(3).unwrap());
        let parsed = roundtrip(&journal);
        let system = parsed.system.unwrap();
        assert_eq!(system.simple, vec![0xFA]);
        assert_eq!(system.mtc, Some(0x21));
        assert_eq!(system.song_position, Some(0x0123));
        assert_eq!(system.song_select, Some(3));
    }

    #[test]
    fn truncate_drops_acknowledged_entries() {
        let mut journal = Journal::with_checkpoint(0);
        journal.record(5, &cc(0, 1, 10));
        journal.record(7, &cc(0, 2, 20));
        journal.record(11, &cc(0, 3, 30));
        journal.record(14, &cc(0, 4, 40));
        journal.truncate(10);
        assert_eq!(journal.checkpoint(), 10);
        let parsed = roundtrip(&journal);
        let numbers: Vec<u8> = parsed.channels[0].controls.iter().map(|c| c.0).collect();
        assert_eq!(numbers, vec![3, 4]);

        journal.truncate(14);
        assert!(journal.is_empty());
        assert!(journal.encode().is_none());
    }

    #[test]
    fn truncate_ignores_stale_acks() {
        let mut journal = Journal::with_checkpoint(10);
        journal.record(11, &cc(0, 1, 10));
        journal.truncate(5);
        assert_eq!(journal.checkpoint(), 10);
        assert!(!journal.is_empty());
    }

    #[test]
    fn truncation_works_across_wraparound() {
        let mut journal = Journal::with_checkpoint(0xFFFE);
        journal.record(0xFFFF, &cc(0, 1, 10));
        journal.record(1, &cc(0, 2, 20));
        journal.truncate(0xFFFF);
        let parsed = roundtrip(&journal);
        assert_eq!(parsed.channels[0].controls, vec![(2, 20, false)]);
    }

    #[test]
    fn malformed_journal_is_rejected() {
        assert!(ParsedJournal::decode(&[0x20]).is_err());
        // Claims one channel journal but carries none.
        assert!(ParsedJournal::decode(&[FLAG_A, 0x00, 0x09]).is_err());
        // Channel journal whose length under-runs its own header.
        let mut journal = Journal::with_checkpoint(0);
        journal.record(1, &cc(0, 1, 10));
        let mut wire = journal.encode().unwrap().to_vec();
        let last = wire.len();
        wire.truncate(last - 1);
        assert!(ParsedJournal::decode(&wire).is_err());
    }
}
