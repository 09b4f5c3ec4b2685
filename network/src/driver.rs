//! Cooperative polled host: two non-blocking UDP sockets and a media clock
//! driving the session controller.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Instant;

use midilink_core::error::Result;
use midilink_core::MidiCommand;

use crate::config::Config;
use crate::controller::{Counters, Delegate, SessionController, SocketKind, Transport};

/// The control/data socket pair. Both sockets are non-blocking; `recv`
/// reports an empty queue as `None`.
#[derive(Debug)]
pub struct UdpTransport {
    control: UdpSocket,
    data: UdpSocket,
}

impl UdpTransport {
    /// Binds `0.0.0.0:port` for control and `port + 1` for data.
    pub fn bind(port: u16) -> Result<Self> {
        let control = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        let data = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port + 1))?;
        Self::from_sockets(control, data)
    }

    /// Adopts an already-bound socket pair.
    pub fn from_sockets(control: UdpSocket, data: UdpSocket) -> Result<Self> {
        control.set_nonblocking(true)?;
        data.set_nonblocking(true)?;
        Ok(Self { control, data })
    }

    pub fn local_ports(&self) -> Result<(u16, u16)> {
        Ok((
            self.control.local_addr()?.port(),
            self.data.local_addr()?.port(),
        ))
    }

    fn socket(&self, kind: SocketKind) -> &UdpSocket {
        match kind {
            SocketKind::Control => &self.control,
            SocketKind::Data => &self.data,
        }
    }
}

impl Transport for UdpTransport {
    fn send(
        &mut self,
        socket: SocketKind,
        addr: SocketAddr,
        payload: &[u8],
    ) -> std::io::Result<usize> {
        self.socket(socket).send_to(payload, addr)
    }

    fn recv(
        &mut self,
        socket: SocketKind,
        buf: &mut [u8],
    ) -> std::io::Result<Option<(usize, SocketAddr)>> {
        match self.socket(socket).recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Wall clock in media ticks at the session's sampling rate.
#[derive(Debug, Clone)]
pub struct MediaClock {
    origin: Instant,
    rate: u32,
}

impl MediaClock {
    pub fn new(rate: u32) -> Self {
        Self {
            origin: Instant::now(),
            rate,
        }
    }

    pub fn now_ticks(&self) -> u64 {
        let elapsed = self.origin.elapsed();
        elapsed.as_secs() * u64::from(self.rate)
            + u64::from(elapsed.subsec_nanos()) * u64::from(self.rate) / 1_000_000_000
    }
}

/// Single-threaded driver. The caller pumps `tick`, `poll_receive` and
/// `poll_send`; none of them block beyond one `sendto`/`recvfrom`.
pub struct UdpDriver<D: Delegate> {
    controller: SessionController<UdpTransport, D>,
    clock: MediaClock,
}

impl<D: Delegate> UdpDriver<D> {
    pub fn bind(config: Config, delegate: D) -> Result<Self> {
        let transport = UdpTransport::bind(config.port)?;
        Self::from_transport(config, transport, delegate)
    }

    pub fn from_transport(config: Config, transport: UdpTransport, delegate: D) -> Result<Self> {
        let clock = MediaClock::new(config.sampling_rate);
        let controller = SessionController::new(config, transport, delegate)?;
        Ok(Self { controller, clock })
    }

    pub fn controller(&self) -> &SessionController<UdpTransport, D> {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut SessionController<UdpTransport, D> {
        &mut self.controller
    }

    pub fn clock(&self) -> &MediaClock {
        &self.clock
    }

    pub fn local_ports(&self) -> Result<(u16, u16)> {
        self.controller.transport().local_ports()
    }

    pub fn add_peer(&mut self, addr: SocketAddr) -> Result<()> {
        self.controller.add_peer(addr)
    }

    pub fn remove_peer(&mut self, addr: SocketAddr) -> Result<()> {
        self.controller.remove_peer(addr)
    }

    pub fn send_message(&mut self, command: MidiCommand) -> Result<()> {
        self.controller.send_message(command)
    }

    pub fn set_journalling(&mut self, on: bool) {
        self.controller.set_journalling(on);
    }

    pub fn counters(&self) -> Counters {
        self.controller.counters()
    }

    pub fn poll_receive(&mut self) -> Result<()> {
        self.controller.poll_receive()
    }

    pub fn poll_send(&mut self) -> Result<()> {
        self.controller.poll_send()
    }

    /// Fires due timers against the driver's own media clock.
    pub fn tick(&mut self) -> Result<()> {
        let now = self.clock.now_ticks();
        self.controller.tick(now)
    }
}
