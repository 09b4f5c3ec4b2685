//! Peer records and the registry that maps SSRC ↔ address.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;

use midilink_core::error::{Error, Result};
use midilink_core::Journal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Established,
    /// End-session sent; the record is dropped once the send completes.
    Closing,
}

/// One remote participant. Created when an invitation handshake completes
/// (or by an explicit registry add), destroyed on end-session or removal.
pub struct Peer {
    pub(crate) ssrc: u32,
    pub(crate) addr: SocketAddr,
    pub(crate) control_addr: SocketAddr,
    pub(crate) name: Option<String>,
    pub(crate) state: PeerState,
    /// We initiated this session and therefore drive the sync schedule.
    pub(crate) initiator: bool,
    pub(crate) send_seqnum: u16,
    pub(crate) receive_seqnum: Option<u16>,
    /// Running status carried across packets, for payloads with the phantom
    /// flag set.
    pub(crate) carried_status: Option<u8>,
    /// Fragment index expected next when the peer's previous packet ended
    /// inside a SysEx transfer.
    pub(crate) pending_sysex: Option<u8>,
    /// Peer clock minus ours, in media ticks, from the last sync exchange.
    pub(crate) timestamp_diff: i64,
    pub(crate) out_journal: Journal,
    pub(crate) next_sync_at: Option<u64>,
    /// t1 of a sync exchange we started and have not completed.
    pub(crate) sync_t1: Option<u64>,
    pub(crate) feedback_due: bool,
    pub(crate) send_failures: u32,
    cookie: Option<Box<dyn Any + Send>>,
}

impl Peer {
    pub fn new(ssrc: u32, addr: SocketAddr, control_addr: SocketAddr, initial_seqnum: u16) -> Self {
        Self {
            ssrc,
            addr,
            control_addr,
            name: None,
            state: PeerState::Established,
            initiator: false,
            send_seqnum: initial_seqnum,
            receive_seqnum: None,
            carried_status: None,
            pending_sysex: None,
            timestamp_diff: 0,
            out_journal: Journal::with_checkpoint(initial_seqnum.wrapping_sub(1)),
            next_sync_at: None,
            sync_t1: None,
            feedback_due: false,
            send_failures: 0,
            cookie: None,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Data-socket address of the peer.
    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    pub fn control_address(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn send_seqnum(&self) -> u16 {
        self.send_seqnum
    }

    pub fn receive_seqnum(&self) -> Option<u16> {
        self.receive_seqnum
    }

    pub fn timestamp_diff(&self) -> i64 {
        self.timestamp_diff
    }

    /// Host-owned data attached to this peer.
    pub fn set_cookie(&mut self, cookie: Box<dyn Any + Send>) {
        self.cookie = Some(cookie);
    }

    pub fn cookie(&self) -> Option<&(dyn Any + Send)> {
        self.cookie.as_deref()
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("ssrc", &format_args!("0x{:08x}", self.ssrc))
            .field("addr", &self.addr)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("send_seqnum", &self.send_seqnum)
            .field("receive_seqnum", &self.receive_seqnum)
            .field("timestamp_diff", &self.timestamp_diff)
            .finish()
    }
}

/// The peer set of one session. No two members share an SSRC or an address.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Vec<Peer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, peer: Peer) -> Result<()> {
        if self.by_ssrc(peer.ssrc).is_some() {
            return Err(Error::DuplicateSsrc(peer.ssrc));
        }
        if self.peers.iter().any(|p| p.addr == peer.addr) {
            return Err(Error::DuplicateAddress(peer.addr));
        }
        self.peers.push(peer);
        Ok(())
    }

    pub fn remove(&mut self, ssrc: u32) -> Option<Peer> {
        let index = self.peers.iter().position(|p| p.ssrc == ssrc)?;
        Some(self.peers.remove(index))
    }

    pub fn by_ssrc(&self, ssrc: u32) -> Option<&Peer> {
        self.peers.iter().find(|p| p.ssrc == ssrc)
    }

    pub fn by_ssrc_mut(&mut self, ssrc: u32) -> Option<&mut Peer> {
        self.peers.iter_mut().find(|p| p.ssrc == ssrc)
    }

    /// Looks a peer up by either its data or control address.
    pub fn by_address(&self, addr: SocketAddr) -> Option<&Peer> {
        self.peers
            .iter()
            .find(|p| p.addr == addr || p.control_addr == addr)
    }

    pub fn by_address_mut(&mut self, addr: SocketAddr) -> Option<&mut Peer> {
        self.peers
            .iter_mut()
            .find(|p| p.addr == addr || p.control_addr == addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.iter_mut()
    }

    /// Snapshot of member SSRCs, in insertion order. Send loops iterate the
    /// snapshot so a concurrent removal cannot invalidate them.
    pub fn ssrcs(&self) -> Vec<u32> {
        self.peers.iter().map(|p| p.ssrc).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn peer(ssrc: u32, port: u16) -> Peer {
        Peer::new(ssrc, addr(port), addr(port - 1), 100)
    }

    #[test]
    fn add_find_remove() {
        let mut registry = PeerRegistry::new();
        registry.add(peer(0x11, 5005)).unwrap();
        registry.add(peer(0x22, 5105)).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.by_ssrc(0x11).unwrap().address(), addr(5005));
        assert_eq!(registry.by_address(addr(5105)).unwrap().ssrc(), 0x22);
        // Control address resolves to the same peer.
        assert_eq!(registry.by_address(addr(5104)).unwrap().ssrc(), 0x22);

        let removed = registry.remove(0x11).unwrap();
        assert_eq!(removed.ssrc(), 0x11);
        assert!(registry.by_ssrc(0x11).is_none());
        assert!(registry.remove(0x11).is_none());
    }

    #[test]
    fn duplicate_ssrc_is_rejected() {
        let mut registry = PeerRegistry::new();
        registry.add(peer(0x11, 5005)).unwrap();
        assert!(matches!(
            registry.add(peer(0x11, 6005)),
            Err(Error::DuplicateSsrc(0x11))
        ));
    }

    #[test]
    fn duplicate_address_is_rejected() {
        let mut registry = PeerRegistry::new();
        registry.add(peer(0x11, 5005)).unwrap();
        assert!(matches!(
            registry.add(peer(0x22, 5005)),
            Err(Error::DuplicateAddress(_))
        ));
    }

    #[test]
    fn snapshot_survives_removal() {
        let mut registry = PeerRegistry::new();
        registry.add(peer(0x11, 5005)).unwrap();
        registry.add(peer(0x22, 5105)).unwrap();
        let snapshot = registry.ssrcs();
        registry.remove(0x11);
        for ssrc in snapshot {
            // Stale entries resolve to None instead of invalidating the walk.
            let _ = registry.by_ssrc(ssrc);
        }
        assert_eq!(registry.len(), 1);
    }
}
