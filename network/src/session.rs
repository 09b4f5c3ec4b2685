//! RTP session layer: sequence-numbered framing on top of the peer
//! registry, with the recovery journal woven into both directions.

use bytes::BytesMut;
use log::{debug, warn};

use midilink_core::error::{Error, Result};
use midilink_core::{payload, rtp, seq, MidiCommand, ParsedJournal, TimedCommand};

use crate::peer::PeerRegistry;

/// How many queued commands one packet may carry.
pub const BATCH_LIMIT: usize = 8;

/// Result of one inbound RTP datagram.
#[derive(Debug, Clone)]
pub struct IncomingMidi {
    pub ssrc: u32,
    pub sequence_number: u16,
    /// Commands synthesized from the journal to cover a sequence gap. They
    /// precede the packet's own commands.
    pub recovered: Vec<MidiCommand>,
    pub commands: Vec<TimedCommand>,
    /// Duplicate or reordered packet, delivered but not advancing state.
    pub stale: bool,
    /// Gap size when it exceeded the recovery window (or the journal could
    /// not cover it) and reconstruction was skipped.
    pub unrecovered_gap: Option<u16>,
}

/// Send/receive state for one local SSRC.
#[derive(Debug)]
pub struct RtpSession {
    ssrc: u32,
    registry: PeerRegistry,
    outbound: std::collections::VecDeque<TimedCommand>,
    queue_limit: usize,
    journalling: bool,
    recovery_window: u16,
}

impl RtpSession {
    pub fn new(ssrc: u32, queue_limit: usize, recovery_window: u16) -> Self {
        Self {
            ssrc,
            registry: PeerRegistry::new(),
            outbound: std::collections::VecDeque::new(),
            queue_limit,
            journalling: true,
            recovery_window,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut PeerRegistry {
        &mut self.registry
    }

    pub fn journalling(&self) -> bool {
        self.journalling
    }

    pub fn set_journalling(&mut self, on: bool) {
        self.journalling = on;
    }

    /// Queues a command for the next send pass. Fails with
    /// [`Error::Overflow`] when the queue is full.
    pub fn enqueue(&mut self, command: TimedCommand) -> Result<()> {
        if self.outbound.len() >= self.queue_limit {
            return Err(Error::Overflow);
        }
        self.outbound.push_back(command);
        Ok(())
    }

    pub fn queued(&self) -> usize {
        self.outbound.len()
    }

    /// Pops the next batch of queued commands, preserving FIFO order.
    pub fn next_batch(&mut self) -> Vec<TimedCommand> {
        let take = self.outbound.len().min(BATCH_LIMIT);
        self.outbound.drain(..take).collect()
    }

    /// Frames `commands` for one peer: payload-encode with the peer's
    /// journal suffix, stamp the peer's next sequence number, record the
    /// commands in the journal, and advance the sequence.
    pub fn packetize(
        &mut self,
        peer_ssrc: u32,
        commands: &[TimedCommand],
        timestamp: u32,
    ) -> Result<BytesMut> {
        let journalling = self.journalling;
        let ssrc = self.ssrc;
        let peer = self
            .registry
            .by_ssrc_mut(peer_ssrc)
            .ok_or(Error::UnknownPeer(peer_ssrc))?;

        let journal_bytes = if journalling {
            peer.out_journal.encode()
        } else {
            None
        };
        let payload = payload::encode_section(commands, journal_bytes.as_deref())?;

        let info = rtp::PacketInfo::new(ssrc, peer.send_seqnum, timestamp);
        let wire = rtp::encode_packet(&info, &payload)?;

        if journalling {
            for timed in commands {
                peer.out_journal.record(peer.send_seqnum, &timed.command);
            }
        }
        peer.send_seqnum = peer.send_seqnum.wrapping_add(1);
        Ok(wire)
    }

    /// Decodes one datagram from the data socket and classifies its
    /// sequence number against the sending peer's state.
    pub fn handle_datagram(&mut self, data: &[u8]) -> Result<IncomingMidi> {
        let packet = rtp::decode_packet(data)?;
        let sequence = packet.info.sequence_number;
        let recovery_window = self.recovery_window;
        let peer = self
            .registry
            .by_ssrc_mut(packet.info.ssrc)
            .ok_or(Error::UnknownPeer(packet.info.ssrc))?;

        let section =
            payload::decode_section(&packet.payload, peer.carried_status, peer.pending_sysex)?;

        let mut incoming = IncomingMidi {
            ssrc: packet.info.ssrc,
            sequence_number: sequence,
            recovered: Vec::new(),
            commands: section.commands,
            stale: false,
            unrecovered_gap: None,
        };

        let gap = match peer.receive_seqnum {
            None => 0,
            Some(last) => {
                let distance = seq::distance(sequence, last);
                if distance <= 0 {
                    incoming.stale = true;
                    debug!(
                        "duplicate or reordered packet {} from 0x{:08x} (last {})",
                        sequence, incoming.ssrc, last
                    );
                    return Ok(incoming);
                }
                (distance - 1) as u16
            }
        };

        if gap > 0 {
            if gap <= recovery_window {
                match &section.journal {
                    Some(journal) => match ParsedJournal::decode(journal) {
                        Ok(parsed) => {
                            let last = peer.receive_seqnum.unwrap_or(sequence);
                            if seq::newer(parsed.checkpoint, last) {
                                // The journal no longer covers our position.
                                incoming.unrecovered_gap = Some(gap);
                            } else {
                                incoming.recovered = parsed.recover();
                            }
                        }
                        Err(e) => {
                            warn!("ignoring malformed journal from 0x{:08x}: {e}", incoming.ssrc);
                            incoming.unrecovered_gap = Some(gap);
                        }
                    },
                    None => incoming.unrecovered_gap = Some(gap),
                }
            } else {
                incoming.unrecovered_gap = Some(gap);
            }
        }

        peer.receive_seqnum = Some(sequence);
        peer.feedback_due = true;
        if let Some(status) = incoming
            .commands
            .iter()
            .rev()
            .find(|t| t.command.is_channel_voice())
            .map(|t| t.command.status())
        {
            peer.carried_status = Some(status);
        }
        // An unterminated SysEx is always the section's last command; an
        // empty section (journal-only packet) leaves the reassembly open.
        if let Some(timed) = incoming.commands.last() {
            peer.pending_sysex = match timed.command {
                MidiCommand::SystemExclusive {
                    fragment,
                    terminated: false,
                    ..
                } => Some(fragment.wrapping_add(1)),
                _ => None,
            };
        }

        Ok(incoming)
    }
}
