//! Event-driven host adapter.
//!
//! Wraps the same [`SessionController`] the polled driver uses, but drives
//! it from tokio socket readiness and an interval timer instead of a caller
//! loop. There is exactly one protocol implementation; this module only
//! changes who wakes it up.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::net::UdpSocket;

use midilink_core::error::Result;
use midilink_core::MidiCommand;
use midilink_network::{
    Config, Counters, Delegate, MediaClock, SessionController, SocketKind, Transport,
};

/// Timer granularity for the internal tick loop; session timers are
/// second-scale, so this is ample.
const TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Control/data socket pair on tokio sockets. Sends use `try_send_to`, so
/// the transport never blocks; a datagram that does not fit the socket
/// buffer is dropped, as UDP semantics allow.
#[derive(Debug)]
pub struct TokioTransport {
    control: Arc<UdpSocket>,
    data: Arc<UdpSocket>,
}

impl TokioTransport {
    pub async fn bind(port: u16) -> Result<Self> {
        let control = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        let data = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port + 1)).await?;
        Ok(Self {
            control: Arc::new(control),
            data: Arc::new(data),
        })
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

    fn handles(&self) -> (Arc<UdpSocket>, Arc<UdpSocket>) {
        (Arc::clone(&self.control), Arc::clone(&self.data))
    }
}

impl Transport for TokioTransport {
    fn send(
        &mut self,
        socket: SocketKind,
        addr: SocketAddr,
        payload: &[u8],
    ) -> std::io::Result<usize> {
        match self.socket(socket).try_send_to(payload, addr) {
            Ok(sent) => Ok(sent),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                debug!("socket buffer full, dropping datagram to {addr}");
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    fn recv(
        &mut self,
        socket: SocketKind,
        buf: &mut [u8],
    ) -> std::io::Result<Option<(usize, SocketAddr)>> {
        match self.socket(socket).try_recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Session host for async programs: `run` loops on socket readiness and a
/// timer, feeding the controller's poll entry points.
pub struct AsyncDriver<D: Delegate> {
    controller: SessionController<TokioTransport, D>,
    clock: MediaClock,
}

impl<D: Delegate> AsyncDriver<D> {
    pub async fn bind(config: Config, delegate: D) -> Result<Self> {
        let transport = TokioTransport::bind(config.port).await?;
        let clock = MediaClock::new(config.sampling_rate);
        let controller = SessionController::new(config, transport, delegate)?;
        Ok(Self { controller, clock })
    }

    pub fn controller(&self) -> &SessionController<TokioTransport, D> {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut SessionController<TokioTransport, D> {
        &mut self.controller
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

    /// Drives the session until an I/O error surfaces. Hosts that need a
    /// shutdown path race this future against their own signal.
    pub async fn run(&mut self) -> Result<()> {
        let (control, data) = self.controller.transport().handles();
        let mut timer = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let now = self.clock.now_ticks();
                    self.controller.tick(now)?;
                    self.controller.poll_send()?;
                }
                ready = control.readable() => {
                    ready?;
                    self.controller.poll_receive()?;
                }
                ready = data.readable() => {
                    ready?;
                    self.controller.poll_receive()?;
                    self.controller.poll_send()?;
                }
            }
        }
    }
}
