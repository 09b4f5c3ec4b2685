//! AppleMIDI session controller.
//!
//! Drives the two-socket state machine: invitations with retry/backoff,
//! the three-leg clock sync, end-session, receiver feedback, and the
//! demultiplexing of AppleMIDI commands from RTP traffic on the shared
//! data socket. All timers run off `tick`; the controller never blocks.

use std::net::SocketAddr;

use log::{debug, info, warn};
use rand::Rng;

use midilink_core::error::{Error, Result};
use midilink_core::{MidiCommand, TimedCommand};

use crate::config::Config;
use crate::control::{
    is_control_packet, ControlCommand, FeedbackMessage, SessionMessage, SyncMessage,
};
use crate::peer::{Peer, PeerState};
use crate::session::RtpSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Control,
    Data,
}

/// The two UDP sockets, abstracted so hosts and tests choose the I/O.
/// `recv` returns `None` when no datagram is pending.
pub trait Transport {
    fn send(&mut self, socket: SocketKind, addr: SocketAddr, payload: &[u8])
        -> std::io::Result<usize>;
    fn recv(
        &mut self,
        socket: SocketKind,
        buf: &mut [u8],
    ) -> std::io::Result<Option<(usize, SocketAddr)>>;
}

/// Host hooks, passed in at construction.
pub trait Delegate {
    /// Called for every decoded MIDI command, including commands
    /// synthesized by journal recovery.
    fn midi_received(&mut self, ssrc: u32, command: &MidiCommand) {
        let _ = (ssrc, command);
    }

    fn event(&mut self, event: SessionEvent) {
        let _ = event;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    PeerEstablished { ssrc: u32, addr: SocketAddr },
    PeerClosed { ssrc: u32 },
    InviteRejected { addr: SocketAddr },
    InviteFailed { addr: SocketAddr },
    ClockSynchronized { ssrc: u32, timestamp_diff: i64 },
}

/// Pollable tallies of recoverable faults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub malformed: u64,
    pub stray: u64,
    pub duplicate: u64,
    pub bad_sequence: u64,
    pub unknown_peer: u64,
    pub recovered: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InviteStage {
    Control,
    Data,
}

#[derive(Debug)]
struct PendingInvite {
    token: u32,
    control_addr: SocketAddr,
    data_addr: SocketAddr,
    stage: InviteStage,
    attempts: u32,
    backoff_ms: u64,
    next_retry_at: u64,
}

#[derive(Debug)]
struct AcceptedInvite {
    token: u32,
    control_addr: SocketAddr,
    name: Option<String>,
}

pub struct SessionController<T: Transport, D: Delegate> {
    config: Config,
    transport: T,
    delegate: D,
    session: RtpSession,
    token: u32,
    invites: Vec<PendingInvite>,
    accepted: Vec<AcceptedInvite>,
    counters: Counters,
    /// Media clock, advanced by `tick`.
    now: u64,
}

impl<T: Transport, D: Delegate> SessionController<T, D> {
    pub fn new(config: Config, transport: T, delegate: D) -> Result<Self> {
        Self::with_identity(config, transport, delegate, rand::random(), rand::random())
    }

    /// Construction with a fixed SSRC and invitation token, for hosts that
    /// need deterministic identities.
    pub fn with_identity(
        config: Config,
        transport: T,
        delegate: D,
        ssrc: u32,
        token: u32,
    ) -> Result<Self> {
        config.validate()?;
        let session = RtpSession::new(ssrc, config.outbound_queue_limit, config.recovery_window);
        Ok(Self {
            config,
            transport,
            delegate,
            session,
            token,
            invites: Vec::new(),
            accepted: Vec::new(),
            counters: Counters::default(),
            now: 0,
        })
    }

    pub fn ssrc(&self) -> u32 {
        self.session.ssrc()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    pub fn session(&self) -> &RtpSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut RtpSession {
        &mut self.session
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn delegate(&self) -> &D {
        &self.delegate
    }

    pub fn delegate_mut(&mut self) -> &mut D {
        &mut self.delegate
    }

    pub fn set_journalling(&mut self, on: bool) {
        self.session.set_journalling(on);
    }

    /// Enqueues a command for the next `poll_send`, FIFO.
    pub fn send_message(&mut self, command: MidiCommand) -> Result<()> {
        self.session.enqueue(TimedCommand::new(0, command))
    }

    pub fn send_timed(&mut self, command: TimedCommand) -> Result<()> {
        self.session.enqueue(command)
    }

    /// Starts inviting the peer whose control socket listens at `addr`;
    /// its data socket is assumed at `port + 1`.
    pub fn add_peer(&mut self, addr: SocketAddr) -> Result<()> {
        let mut data_addr = addr;
        data_addr.set_port(addr.port().wrapping_add(1));
        let token = self.token.wrapping_add(self.invites.len() as u32).wrapping_add(1);

        let command = ControlCommand::Invitation(SessionMessage::new(
            token,
            self.ssrc(),
            Some(self.config.session_name.clone()),
        ));
        self.send_command(SocketKind::Control, addr, &command)?;
        info!("inviting {addr} (token 0x{token:08x})");

        let backoff_ms = self.config.invitation_retry_ms;
        self.invites.push(PendingInvite {
            token,
            control_addr: addr,
            data_addr,
            stage: InviteStage::Control,
            attempts: 1,
            backoff_ms: (backoff_ms * 2).min(self.config.invitation_retry_max_ms),
            next_retry_at: self.now + self.config.ms_to_ticks(backoff_ms),
        });
        Ok(())
    }

    /// Ends the session with the peer at `addr` (control or data address):
    /// sends `BY` and drops the record without waiting for acknowledgement.
    pub fn remove_peer(&mut self, addr: SocketAddr) -> Result<()> {
        if let Some(pos) = self
            .invites
            .iter()
            .position(|i| i.control_addr == addr || i.data_addr == addr)
        {
            self.invites.remove(pos);
            return Ok(());
        }
        let ssrc = self
            .session
            .registry()
            .by_address(addr)
            .map(Peer::ssrc)
            .ok_or(Error::UnknownPeer(0))?;
        self.close_peer(ssrc)
    }

    fn close_peer(&mut self, ssrc: u32) -> Result<()> {
        let Some(peer) = self.session.registry_mut().by_ssrc_mut(ssrc) else {
            return Ok(());
        };
        peer.state = PeerState::Closing;
        let control_addr = peer.control_addr;
        let command =
            ControlCommand::EndSession(SessionMessage::new(self.token, self.ssrc(), None));
        if let Err(e) = self.send_command(SocketKind::Control, control_addr, &command) {
            warn!("end-session to {control_addr} failed: {e}");
        }
        self.session.registry_mut().remove(ssrc);
        self.delegate.event(SessionEvent::PeerClosed { ssrc });
        Ok(())
    }

    /// Reads every pending datagram from both sockets and advances the
    /// session state machine.
    pub fn poll_receive(&mut self) -> Result<()> {
        let mut buf = [0u8; 2048];
        for kind in [SocketKind::Control, SocketKind::Data] {
            loop {
                match self.transport.recv(kind, &mut buf)? {
                    Some((len, addr)) => self.handle_datagram(kind, &buf[..len], addr)?,
                    None => break,
                }
            }
        }
        Ok(())
    }

    /// Packetizes the next queued batch and writes at most one RTP packet
    /// per established peer.
    pub fn poll_send(&mut self) -> Result<()> {
        if self.session.queued() == 0 {
            return Ok(());
        }
        if self.session.registry().is_empty() {
            // Keep the queue until a session is established; Overflow
            // bounds it.
            return Ok(());
        }
        let batch = self.session.next_batch();
        let timestamp = self.now as u32;
        let mut first_error: Option<Error> = None;

        for ssrc in self.session.registry().ssrcs() {
            let Some(peer) = self.session.registry().by_ssrc(ssrc) else {
                continue;
            };
            if peer.state() != PeerState::Established {
                continue;
            }
            let addr = peer.address();
            let wire = match self.session.packetize(ssrc, &batch, timestamp) {
                Ok(wire) => wire,
                Err(e) => {
                    warn!("packetize for 0x{ssrc:08x} failed: {e}");
                    continue;
                }
            };
            match self.transport.send(SocketKind::Data, addr, &wire) {
                Ok(_) => {
                    if let Some(peer) = self.session.registry_mut().by_ssrc_mut(ssrc) {
                        peer.send_failures = 0;
                    }
                }
                Err(e) => {
                    warn!("send to 0x{ssrc:08x} at {addr} failed: {e}");
                    let exhausted = {
                        let peer = self.session.registry_mut().by_ssrc_mut(ssrc);
                        peer.map_or(false, |p| {
                            p.send_failures += 1;
                            p.send_failures >= self.config.invitation_retry_limit
                        })
                    };
                    if first_error.is_none() {
                        first_error = Some(Error::Io(e));
                    }
                    if exhausted {
                        self.close_peer(ssrc)?;
                    }
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Advances the media clock and fires due timers: invitation retries,
    /// scheduled syncs, receiver feedback.
    pub fn tick(&mut self, now_ticks: u64) -> Result<()> {
        self.now = now_ticks;
        self.retry_invitations()?;
        self.run_sync_schedule()?;
        self.flush_feedback()?;
        Ok(())
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    fn retry_invitations(&mut self) -> Result<()> {
        let mut index = 0;
        while index < self.invites.len() {
            if self.now < self.invites[index].next_retry_at {
                index += 1;
                continue;
            }
            if self.invites[index].attempts >= self.config.invitation_retry_limit {
                let invite = self.invites.remove(index);
                warn!(
                    "invitation to {} abandoned after {} attempts",
                    invite.control_addr, invite.attempts
                );
                self.delegate.event(SessionEvent::InviteFailed {
                    addr: invite.control_addr,
                });
                continue;
            }
            let (kind, target, token) = {
                let invite = &self.invites[index];
                match invite.stage {
                    InviteStage::Control => (SocketKind::Control, invite.control_addr, invite.token),
                    InviteStage::Data => (SocketKind::Data, invite.data_addr, invite.token),
                }
            };
            let command = ControlCommand::Invitation(SessionMessage::new(
                token,
                self.ssrc(),
                Some(self.config.session_name.clone()),
            ));
            self.send_command(kind, target, &command)?;
            let wait = self.invites[index].backoff_ms;
            let next = self.now + self.config.ms_to_ticks(wait);
            let invite = &mut self.invites[index];
            invite.attempts += 1;
            invite.backoff_ms = (wait * 2).min(self.config.invitation_retry_max_ms);
            invite.next_retry_at = next;
            index += 1;
        }
        Ok(())
    }

    fn run_sync_schedule(&mut self) -> Result<()> {
        let due: Vec<(u32, SocketAddr)> = self
            .session
            .registry()
            .iter()
            .filter(|p| {
                p.initiator
                    && p.state() == PeerState::Established
                    && p.next_sync_at.map_or(false, |at| at <= self.now)
            })
            .map(|p| (p.ssrc(), p.address()))
            .collect();
        for (ssrc, addr) in due {
            if let Some(peer) = self.session.registry().by_ssrc(ssrc) {
                if peer.sync_t1.is_some() {
                    // A leg of the previous exchange was dropped; restart
                    // from count 0.
                    debug!("sync with 0x{ssrc:08x} incomplete, restarting");
                }
            }
            let command = ControlCommand::Sync(SyncMessage {
                ssrc: self.ssrc(),
                count: 0,
                timestamps: [self.now, 0, 0],
            });
            self.send_command(SocketKind::Data, addr, &command)?;
            let interval = self.jittered_sync_interval();
            if let Some(peer) = self.session.registry_mut().by_ssrc_mut(ssrc) {
                peer.sync_t1 = Some(self.now);
                peer.next_sync_at = Some(self.now + interval);
            }
        }
        Ok(())
    }

    fn flush_feedback(&mut self) -> Result<()> {
        let due: Vec<(u32, SocketAddr, u16)> = self
            .session
            .registry()
            .iter()
            .filter(|p| p.feedback_due)
            .filter_map(|p| p.receive_seqnum().map(|s| (p.ssrc(), p.control_address(), s)))
            .collect();
        for (ssrc, addr, seqnum) in due {
            let command = ControlCommand::Feedback(FeedbackMessage {
                ssrc: self.ssrc(),
                seqnum,
            });
            self.send_command(SocketKind::Control, addr, &command)?;
            if let Some(peer) = self.session.registry_mut().by_ssrc_mut(ssrc) {
                peer.feedback_due = false;
            }
        }
        Ok(())
    }

    fn jittered_sync_interval(&self) -> u64 {
        let base = self.config.ms_to_ticks(self.config.sync_interval_ms);
        let percent = rand::thread_rng().gen_range(80..=120);
        base * percent / 100
    }

    fn send_command(
        &mut self,
        kind: SocketKind,
        addr: SocketAddr,
        command: &ControlCommand,
    ) -> Result<()> {
        let wire = command.encode()?;
        self.transport.send(kind, addr, &wire)?;
        Ok(())
    }

    fn handle_datagram(&mut self, kind: SocketKind, data: &[u8], addr: SocketAddr) -> Result<()> {
        if is_control_packet(data) {
            match ControlCommand::decode(data) {
                Ok(command) => self.handle_command(kind, command, addr)?,
                Err(e) => {
                    self.counters.malformed += 1;
                    warn!("dropping malformed AppleMIDI datagram from {addr}: {e}");
                }
            }
            return Ok(());
        }
        if kind == SocketKind::Control {
            // RTP is only permitted on the data socket.
            self.counters.stray += 1;
            debug!("dropping stray datagram on control socket from {addr}");
            return Ok(());
        }
        match self.session.handle_datagram(data) {
            Ok(incoming) => {
                if incoming.stale {
                    self.counters.duplicate += 1;
                }
                if let Some(gap) = incoming.unrecovered_gap {
                    self.counters.bad_sequence += 1;
                    let fault = Error::BadSequence { gap };
                    warn!("0x{:08x}: {fault}; packet delivered without reconstruction", incoming.ssrc);
                }
                self.counters.recovered += incoming.recovered.len() as u64;
                for command in &incoming.recovered {
                    self.delegate.midi_received(incoming.ssrc, command);
                }
                for timed in &incoming.commands {
                    self.delegate.midi_received(incoming.ssrc, &timed.command);
                }
            }
            Err(Error::UnknownPeer(ssrc)) => {
                self.counters.unknown_peer += 1;
                debug!("RTP packet from unknown ssrc 0x{ssrc:08x} at {addr}");
            }
            Err(e) => {
                self.counters.malformed += 1;
                warn!("dropping undecodable RTP datagram from {addr}: {e}");
            }
        }
        Ok(())
    }

    fn handle_command(
        &mut self,
        kind: SocketKind,
        command: ControlCommand,
        addr: SocketAddr,
    ) -> Result<()> {
        match command {
            ControlCommand::Invitation(msg) => self.handle_invitation(kind, msg, addr),
            ControlCommand::Accepted(msg) => self.handle_accepted(msg),
            ControlCommand::Rejected(msg) => {
                if let Some(pos) = self.invites.iter().position(|i| i.token == msg.token) {
                    let invite = self.invites.remove(pos);
                    info!("invitation rejected by {}", invite.control_addr);
                    self.delegate.event(SessionEvent::InviteRejected {
                        addr: invite.control_addr,
                    });
                }
                Ok(())
            }
            ControlCommand::EndSession(msg) => {
                if self.session.registry_mut().remove(msg.ssrc).is_some() {
                    info!("peer 0x{:08x} ended the session", msg.ssrc);
                    self.delegate.event(SessionEvent::PeerClosed { ssrc: msg.ssrc });
                }
                Ok(())
            }
            ControlCommand::Sync(sync) => self.handle_sync(kind, sync, addr),
            ControlCommand::Feedback(fb) => {
                if let Some(peer) = self.session.registry_mut().by_ssrc_mut(fb.ssrc) {
                    peer.out_journal.truncate(fb.seqnum);
                    debug!(
                        "journal for 0x{:08x} truncated to checkpoint {}",
                        fb.ssrc, fb.seqnum
                    );
                }
                Ok(())
            }
        }
    }

    fn handle_invitation(
        &mut self,
        kind: SocketKind,
        msg: SessionMessage,
        addr: SocketAddr,
    ) -> Result<()> {
        match kind {
            SocketKind::Control => {
                let at_capacity =
                    self.session.registry().len() + self.accepted.len() >= self.config.peer_limit;
                let ssrc_taken = self.session.registry().by_ssrc(msg.ssrc).is_some();
                if at_capacity || ssrc_taken {
                    info!("rejecting invitation from {addr}");
                    let reply =
                        ControlCommand::Rejected(SessionMessage::new(msg.token, self.ssrc(), None));
                    return self.send_command(kind, addr, &reply);
                }
                self.accepted.retain(|a| a.token != msg.token);
                self.accepted.push(AcceptedInvite {
                    token: msg.token,
                    control_addr: addr,
                    name: msg.name,
                });
                let reply = ControlCommand::Accepted(SessionMessage::new(
                    msg.token,
                    self.ssrc(),
                    Some(self.config.session_name.clone()),
                ));
                self.send_command(kind, addr, &reply)
            }
            SocketKind::Data => {
                let Some(pos) = self.accepted.iter().position(|a| a.token == msg.token) else {
                    debug!("data-socket invitation from {addr} without control handshake");
                    let reply =
                        ControlCommand::Rejected(SessionMessage::new(msg.token, self.ssrc(), None));
                    return self.send_command(kind, addr, &reply);
                };
                let accepted = self.accepted.remove(pos);
                let mut peer = Peer::new(msg.ssrc, addr, accepted.control_addr, rand::random());
                peer.name = accepted.name.or(msg.name);
                match self.session.registry_mut().add(peer) {
                    Ok(()) => {
                        info!("peer 0x{:08x} at {addr} joined the session", msg.ssrc);
                        let reply = ControlCommand::Accepted(SessionMessage::new(
                            msg.token,
                            self.ssrc(),
                            Some(self.config.session_name.clone()),
                        ));
                        self.send_command(kind, addr, &reply)?;
                        self.delegate.event(SessionEvent::PeerEstablished {
                            ssrc: msg.ssrc,
                            addr,
                        });
                        Ok(())
                    }
                    Err(e) => {
                        warn!("cannot add peer 0x{:08x}: {e}", msg.ssrc);
                        let reply = ControlCommand::Rejected(SessionMessage::new(
                            msg.token,
                            self.ssrc(),
                            None,
                        ));
                        self.send_command(kind, addr, &reply)
                    }
                }
            }
        }
    }

    fn handle_accepted(&mut self, msg: SessionMessage) -> Result<()> {
        let Some(pos) = self.invites.iter().position(|i| i.token == msg.token) else {
            debug!("unsolicited invitation acceptance (token 0x{:08x})", msg.token);
            return Ok(());
        };
        match self.invites[pos].stage {
            InviteStage::Control => {
                // Control socket accepted; complete the handshake on the
                // data socket with a fresh retry schedule.
                let (token, data_addr) = (self.invites[pos].token, self.invites[pos].data_addr);
                let command = ControlCommand::Invitation(SessionMessage::new(
                    token,
                    self.ssrc(),
                    Some(self.config.session_name.clone()),
                ));
                self.send_command(SocketKind::Data, data_addr, &command)?;
                let backoff_ms = self.config.invitation_retry_ms;
                let next = self.now + self.config.ms_to_ticks(backoff_ms);
                let invite = &mut self.invites[pos];
                invite.stage = InviteStage::Data;
                invite.attempts = 1;
                invite.backoff_ms = (backoff_ms * 2).min(self.config.invitation_retry_max_ms);
                invite.next_retry_at = next;
                Ok(())
            }
            InviteStage::Data => {
                let invite = self.invites.remove(pos);
                let mut peer = Peer::new(
                    msg.ssrc,
                    invite.data_addr,
                    invite.control_addr,
                    rand::random(),
                );
                peer.name = msg.name;
                peer.initiator = true;
                peer.next_sync_at = Some(self.now);
                match self.session.registry_mut().add(peer) {
                    Ok(()) => {
                        info!(
                            "session with 0x{:08x} at {} established",
                            msg.ssrc, invite.data_addr
                        );
                        self.delegate.event(SessionEvent::PeerEstablished {
                            ssrc: msg.ssrc,
                            addr: invite.data_addr,
                        });
                        Ok(())
                    }
                    Err(e) => {
                        warn!("cannot add accepted peer 0x{:08x}: {e}", msg.ssrc);
                        Ok(())
                    }
                }
            }
        }
    }

    fn handle_sync(&mut self, kind: SocketKind, sync: SyncMessage, addr: SocketAddr) -> Result<()> {
        if sync.ssrc == self.ssrc() {
            return Ok(());
        }
        let now = self.now;
        let mut timestamps = sync.timestamps;
        match sync.count {
            0 => {
                timestamps[1] = now;
                let reply = ControlCommand::Sync(SyncMessage {
                    ssrc: self.ssrc(),
                    count: 1,
                    timestamps,
                });
                self.send_command(kind, addr, &reply)
            }
            1 => {
                timestamps[2] = now;
                let [t1, t2, t3] = timestamps;
                let diff = t2 as i64 + (t3.wrapping_sub(t1) as i64) / 2 - t3 as i64;
                let reply = ControlCommand::Sync(SyncMessage {
                    ssrc: self.ssrc(),
                    count: 2,
                    timestamps,
                });
                self.send_command(kind, addr, &reply)?;
                if let Some(peer) = self.session.registry_mut().by_ssrc_mut(sync.ssrc) {
                    peer.timestamp_diff = diff;
                    peer.sync_t1 = None;
                    self.delegate.event(SessionEvent::ClockSynchronized {
                        ssrc: sync.ssrc,
                        timestamp_diff: diff,
                    });
                }
                Ok(())
            }
            2 => {
                let [t1, _, t3] = timestamps;
                let diff = t3 as i64 + (t3.wrapping_sub(t1) as i64) / 2 - now as i64;
                if let Some(peer) = self.session.registry_mut().by_ssrc_mut(sync.ssrc) {
                    peer.timestamp_diff = diff;
                    self.delegate.event(SessionEvent::ClockSynchronized {
                        ssrc: sync.ssrc,
                        timestamp_diff: diff,
                    });
                }
                Ok(())
            }
            other => {
                // The wire protocol ends at count 2; anything else is
                // ignored rather than answered.
                debug!("ignoring sync leg {other} from {addr}");
                Ok(())
            }
        }
    }
}
