use std::{
    error, fmt, io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, error, info, trace, warn};
use tokio::{net::TcpListener, sync::watch, task::JoinHandle, time};

use crate::{
    checksum::Checksummer,
    device::Device,
    ip::{IcmpMessage, IpError, IpPacket, TcpFlags, TcpSegment, TransportProtocolType},
};

mod table;
mod tcp;
mod udp;

pub use table::{Direction, NatTable, Table, Tuple};
pub use tcp::{RedirectedStream, TcpRedirector};
pub use udp::UdpRelay;

// Largest possible IPv4 or IPv6 (non-jumbo) packet.
const MAX_PACKET_SIZE: usize = 65535;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(15);
// RFC 5382, REQ-5: established connections must not expire in less than 2 hours 4 minutes.
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60 + 4 * 60);

pub struct Config {
    pub gateway: IpAddr,
    pub portal: IpAddr,
    pub listen_ip: IpAddr,
    pub checksummer: Checksummer,
}

/// Running NAT engine: the dispatch task plus the TCP and UDP handles for the proxy collaborator.
pub struct Engine<D: Device> {
    tcp: TcpRedirector,
    udp: UdpRelay<D>,
    dispatcher: JoinHandle<Result<(), NatError>>,
}

impl<D: Device> Engine<D> {
    pub fn tcp(&self) -> &TcpRedirector {
        &self.tcp
    }

    pub fn udp(&self) -> &UdpRelay<D> {
        &self.udp
    }

    pub fn close(&self) {
        self.tcp.close();
        self.udp.close();
    }

    /// Waits until the dispatch loop exits, either after `close` or when the device fails.
    pub async fn wait(self) -> Result<(), NatError> {
        self.dispatcher.await?
    }
}

/// Starts the NAT engine on `device`.
///
/// Gateway and portal must be distinct IPv4 addresses; IPv6 packets are still processed,
/// but only IPv4 TCP flows can be redirected to the listener.
pub async fn start<D: Device>(device: D, config: Config) -> Result<Engine<D>, NatError> {
    let (gateway, portal) = match (config.gateway, config.portal) {
        (IpAddr::V4(gateway), IpAddr::V4(portal)) => (gateway, portal),
        (IpAddr::V4(_), addr) | (addr, _) => return Err(NatError::InvalidAddress(addr)),
    };
    if gateway == portal {
        return Err(NatError::InvalidAddress(config.portal));
    }

    let listener = match TcpListener::bind(SocketAddr::new(config.listen_ip, 0)).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("Failed to open listener on {}: {}", config.listen_ip, err);
            return Err(err.into());
        }
    };
    let gateway_port = listener.local_addr()?.port();
    info!(
        "Redirecting TCP to {} (gateway {}:{}, portal {})",
        listener.local_addr()?,
        gateway,
        gateway_port,
        portal
    );

    let table = NatTable::new(Table::new(gateway_port, TCP_IDLE_TIMEOUT));
    let device = Arc::new(device);
    let tcp = TcpRedirector::new(listener, IpAddr::V4(portal), table.clone())?;
    let udp = UdpRelay::new(device.clone(), config.checksummer);

    tokio::spawn(run_cleanup(table.clone(), tcp.clone(), udp.clone()));

    let dispatcher = Dispatcher {
        device,
        gateway,
        portal,
        gateway_port,
        table,
        tcp: tcp.clone(),
        udp: udp.clone(),
        checksummer: config.checksummer,
    };
    let dispatcher = tokio::spawn(dispatcher.run());

    Ok(Engine {
        tcp,
        udp,
        dispatcher,
    })
}

async fn wait_closed<D: Device>(tcp: &TcpRedirector, udp: &UdpRelay<D>) {
    tcp.closed().await;
    udp.closed().await;
}

async fn run_cleanup<D: Device>(table: NatTable, tcp: TcpRedirector, udp: UdpRelay<D>) {
    let mut interval = time::interval(CLEANUP_INTERVAL);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = wait_closed(&tcp, &udp) => {
                debug!("Cleanup task stopped");
                return;
            }
        }
        let now = Instant::now();
        let tcp_removed = table.cleanup(now).await;
        let udp_removed = udp.cleanup(now);
        if tcp_removed > 0 || udp_removed > 0 {
            debug!(
                "Removed {} TCP redirects and {} UDP calls, {} and {} remaining",
                tcp_removed,
                udp_removed,
                table.lock().await.len(),
                udp.len()
            );
        }
    }
}

/// Closes a component once; every waiter is woken, including ones that subscribe later.
#[derive(Clone)]
struct CloseSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl CloseSignal {
    fn new() -> CloseSignal {
        let (sender, _) = watch::channel(false);
        CloseSignal {
            sender: Arc::new(sender),
        }
    }

    /// Returns true if this call closed the component.
    fn close(&self) -> bool {
        !self.sender.send_replace(true)
    }

    fn is_closed(&self) -> bool {
        *self.sender.borrow()
    }

    async fn closed(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender is owned by self, so the channel cannot be dropped while waiting.
        let _ = receiver.wait_for(|closed| *closed).await;
    }
}

enum RoutingAction {
    Drop(&'static str),
    // Packet was rewritten in place, only its first bytes need to be sent.
    WriteBack(usize),
    Consumed,
}

struct Dispatcher<D: Device> {
    device: Arc<D>,
    gateway: Ipv4Addr,
    portal: Ipv4Addr,
    gateway_port: u16,
    table: NatTable,
    tcp: TcpRedirector,
    udp: UdpRelay<D>,
    checksummer: Checksummer,
}

impl<D: Device> Dispatcher<D> {
    async fn run(self) -> Result<(), NatError> {
        let result = self.read_loop().await;
        match result {
            Ok(()) => debug!("Dispatch loop stopped"),
            Err(ref err) => warn!("Dispatch loop failed: {}", err),
        }
        self.tcp.close();
        self.udp.close();
        result
    }

    async fn read_loop(&self) -> Result<(), NatError> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            let bytes = tokio::select! {
                read = self.device.read_packet(&mut buf) => read?,
                _ = wait_closed(&self.tcp, &self.udp) => return Ok(()),
            };
            if bytes == 0 {
                info!("Device reached EOF");
                return Ok(());
            }
            let length = match self.process_packet(&mut buf[..bytes]).await {
                Ok(RoutingAction::WriteBack(length)) => length,
                Ok(RoutingAction::Consumed) => continue,
                Ok(RoutingAction::Drop(reason)) => {
                    trace!("Dropping packet: {}", reason);
                    continue;
                }
                Err(err) => {
                    trace!("Dropping invalid packet: {}", err);
                    continue;
                }
            };
            if let Err(err) = self.device.write_packet(&buf[..length]).await {
                debug!("Failed to write packet to device: {}", err);
            }
        }
    }

    async fn process_packet(&self, data: &mut [u8]) -> Result<RoutingAction, IpError> {
        let mut packet = IpPacket::from_data(data)?;
        match &packet {
            IpPacket::V4(ip) => {
                if !ip.validate_checksum(&self.checksummer) {
                    return Ok(RoutingAction::Drop("IPv4 header checksum is invalid"));
                }
                if ip.is_fragmented() {
                    return Ok(RoutingAction::Drop("IPv4 packet is fragmented"));
                }
            }
            IpPacket::V6(ip) => {
                if ip.next_header() == TransportProtocolType::IPV6_FRAGMENT {
                    return Ok(RoutingAction::Drop("IPv6 packet is fragmented"));
                }
            }
        }
        if packet.ttl() == 0 {
            return Ok(RoutingAction::Drop("TTL or hop limit is 0"));
        }
        if log::log_enabled!(log::Level::Trace) {
            trace!("Received packet {}", packet);
        }

        let is_ipv4 = matches!(packet, IpPacket::V4(_));
        match (packet.transport_protocol(), is_ipv4) {
            (TransportProtocolType::TCP, _) => self.process_tcp(&mut packet).await,
            (TransportProtocolType::UDP, _) => {
                self.udp.handle_packet(&mut packet)?;
                Ok(RoutingAction::Consumed)
            }
            (TransportProtocolType::ICMP, true) | (TransportProtocolType::IPV6_ICMP, false) => {
                self.process_icmp_echo(&mut packet)
            }
            _ => Ok(RoutingAction::Drop("Unsupported transport protocol")),
        }
    }

    async fn process_tcp(&self, packet: &mut IpPacket<'_>) -> Result<RoutingAction, IpError> {
        let (src_port, dst_port, flags) = {
            let tcp = TcpSegment::from_data(packet.payload_mut())?;
            (tcp.src_port(), tcp.dst_port(), tcp.flags())
        };
        let src_addr = packet.src_addr();
        let dst_addr = packet.dst_addr();

        if dst_addr == self.portal {
            if src_addr != self.gateway || src_port != self.gateway_port {
                return Ok(RoutingAction::Drop("Packet to portal is not from the listener"));
            }
            let tuple = {
                let mut table = self.table.lock().await;
                let tuple = table.tuple_of(dst_port);
                if tuple.is_some() {
                    table.observe(dst_port, flags, Direction::Return);
                }
                tuple
            };
            let tuple = match tuple {
                Some(tuple) => tuple,
                None => return Ok(RoutingAction::Drop("No redirect for returning TCP packet")),
            };
            self.rewrite_tcp(packet, tuple.destination, tuple.source)?;
            Ok(RoutingAction::WriteBack(packet.data().len()))
        } else {
            if !src_addr.is_ipv4() {
                // The listener only accepts IPv4 connections from the portal.
                return Ok(RoutingAction::Drop("IPv6 TCP cannot be redirected"));
            }
            let tuple = Tuple::new(
                SocketAddr::new(src_addr, src_port),
                SocketAddr::new(dst_addr, dst_port),
            );
            let port = {
                let mut table = self.table.lock().await;
                let port = match table.port_of(&tuple) {
                    Some(port) => port,
                    None if flags == TcpFlags::SYN => match table.new_conn(tuple) {
                        Ok(port) => {
                            debug!("Redirecting TCP {} through port {}", tuple, port);
                            port
                        }
                        Err(err) => {
                            warn!("Failed to redirect TCP {}: {}", tuple, err);
                            return Ok(RoutingAction::Drop("No ports available"));
                        }
                    },
                    None => return Ok(RoutingAction::Drop("No session for TCP packet")),
                };
                table.observe(port, flags, Direction::Forward);
                port
            };
            self.rewrite_tcp(
                packet,
                SocketAddr::new(IpAddr::V4(self.portal), port),
                SocketAddr::new(IpAddr::V4(self.gateway), self.gateway_port),
            )?;
            Ok(RoutingAction::WriteBack(packet.data().len()))
        }
    }

    fn rewrite_tcp(
        &self,
        packet: &mut IpPacket<'_>,
        src: SocketAddr,
        dst: SocketAddr,
    ) -> Result<(), IpError> {
        packet.set_src_addr(src.ip())?;
        packet.set_dst_addr(dst.ip())?;
        packet.dec_ttl();
        packet.reset_checksum(&self.checksummer);

        let pseudo_sum = packet.pseudo_sum(&self.checksummer);
        let mut tcp = TcpSegment::from_data(packet.payload_mut())?;
        tcp.set_src_port(src.port());
        tcp.set_dst_port(dst.port());
        tcp.reset_checksum(pseudo_sum, &self.checksummer);
        Ok(())
    }

    fn process_icmp_echo(&self, packet: &mut IpPacket<'_>) -> Result<RoutingAction, IpError> {
        let is_ipv4 = matches!(packet, IpPacket::V4(_));
        let (request, reply) = if is_ipv4 {
            (IcmpMessage::ECHO_REQUEST, IcmpMessage::ECHO_REPLY)
        } else {
            (IcmpMessage::V6_ECHO_REQUEST, IcmpMessage::V6_ECHO_REPLY)
        };
        {
            let mut icmp = IcmpMessage::from_data(packet.payload_mut())?;
            if icmp.icmp_type() != request || icmp.code() != 0 {
                return Ok(RoutingAction::Drop("ICMP message is not an echo request"));
            }
            icmp.set_type(reply);
        }

        let src_addr = packet.src_addr();
        let dst_addr = packet.dst_addr();
        packet.set_src_addr(dst_addr)?;
        packet.set_dst_addr(src_addr)?;
        packet.dec_ttl();
        packet.reset_checksum(&self.checksummer);

        // Only ICMPv6 includes the pseudo header.
        let pseudo_sum = if is_ipv4 {
            0
        } else {
            packet.pseudo_sum(&self.checksummer)
        };
        IcmpMessage::from_data(packet.payload_mut())?.reset_checksum(pseudo_sum, &self.checksummer);
        Ok(RoutingAction::WriteBack(packet.data().len()))
    }
}

#[derive(Debug)]
pub enum NatError {
    Internal(&'static str),
    InvalidAddress(IpAddr),
    PortsExhausted,
    Closed,
    Ip(IpError),
    Io(io::Error),
    Join(tokio::task::JoinError),
}

impl fmt::Display for NatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Internal(msg) => f.write_str(msg),
            Self::InvalidAddress(addr) => {
                write!(f, "Invalid address {addr}: only distinct IPv4 addresses are supported")
            }
            Self::PortsExhausted => f.write_str("No redirect ports available"),
            Self::Closed => f.write_str("NAT is closed"),
            Self::Ip(e) => write!(f, "IP error: {e}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
            Self::Join(e) => write!(f, "Tokio join error: {e}"),
        }
    }
}

impl error::Error for NatError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Internal(_msg) => None,
            Self::InvalidAddress(_) => None,
            Self::PortsExhausted => None,
            Self::Closed => None,
            Self::Ip(err) => Some(err),
            Self::Io(err) => Some(err),
            Self::Join(err) => Some(err),
        }
    }
}

impl From<&'static str> for NatError {
    fn from(msg: &'static str) -> NatError {
        Self::Internal(msg)
    }
}

impl From<IpError> for NatError {
    fn from(err: IpError) -> NatError {
        Self::Ip(err)
    }
}

impl From<io::Error> for NatError {
    fn from(err: io::Error) -> NatError {
        Self::Io(err)
    }
}

impl From<tokio::task::JoinError> for NatError {
    fn from(err: tokio::task::JoinError) -> NatError {
        Self::Join(err)
    }
}
