use std::{
    collections::HashMap,
    error, fmt, io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{Arc, Mutex},
    time::Duration,
};

use log::{debug, info, warn};
use tokio::{
    net::{TcpStream, UdpSocket},
    runtime, time,
};

use crate::{
    device::Device,
    nat::{self, NatError, RedirectedStream, Tuple},
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const UDP_CALL_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_DATAGRAM_SIZE: usize = 65535;

type UdpSockets = Arc<Mutex<HashMap<Tuple, Arc<UdpSocket>>>>;

/// Connects redirected flows directly to their original destinations from this host.
pub struct Forwarder<D: Device> {
    tcp: nat::TcpRedirector,
    udp: nat::UdpRelay<D>,
    udp_sockets: UdpSockets,
}

impl<D: Device> Forwarder<D> {
    pub fn new(engine: &nat::Engine<D>) -> Forwarder<D> {
        Forwarder {
            tcp: engine.tcp().clone(),
            udp: engine.udp().clone(),
            udp_sockets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Runs until the engine is closed.
    pub async fn run(&self) -> Result<(), ForwardError> {
        info!(
            "Forwarding redirected connections from {}",
            self.tcp.local_addr()
        );
        tokio::select! {
            res = self.run_tcp() => res?,
            res = self.run_udp() => res?,
        }
        debug!("Forwarder stopped");
        Ok(())
    }

    async fn run_tcp(&self) -> Result<(), ForwardError> {
        loop {
            let stream = match self.tcp.accept().await {
                Ok(stream) => stream,
                Err(NatError::Closed) => return Ok(()),
                Err(_) if self.tcp.is_closed() => return Ok(()),
                Err(err) => {
                    warn!("Failed to accept redirected connection: {}", err);
                    continue;
                }
            };
            let rt = runtime::Handle::current();
            rt.spawn(async move {
                let tuple = stream.tuple();
                if let Err(err) = forward_tcp(stream).await {
                    debug!("TCP forward for {} failed: {}", tuple, err);
                }
            });
        }
    }

    async fn run_udp(&self) -> Result<(), ForwardError> {
        while let Some(datagram) = self.udp.recv().await {
            let socket = match self.udp_socket(&datagram.tuple).await {
                Ok(socket) => socket,
                Err(err) => {
                    warn!(
                        "Failed to open UDP socket for call {} ({}): {}",
                        datagram.call_id, datagram.tuple, err
                    );
                    continue;
                }
            };
            if let Err(err) = socket.send(&datagram.payload).await {
                debug!("Failed to forward UDP datagram for {}: {}", datagram.tuple, err);
            }
        }
        self.lock_udp_sockets().clear();
        Ok(())
    }

    fn lock_udp_sockets(&self) -> std::sync::MutexGuard<'_, HashMap<Tuple, Arc<UdpSocket>>> {
        match self.udp_sockets.lock() {
            Ok(sockets) => sockets,
            Err(err) => err.into_inner(),
        }
    }

    async fn udp_socket(&self, tuple: &Tuple) -> Result<Arc<UdpSocket>, ForwardError> {
        let existing = self.lock_udp_sockets().get(tuple).cloned();
        if let Some(socket) = existing {
            return Ok(socket);
        }
        let bind_addr = match tuple.destination.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = UdpSocket::bind(SocketAddr::new(bind_addr, 0)).await?;
        socket.connect(tuple.destination).await?;
        let socket = Arc::new(socket);
        self.lock_udp_sockets().insert(*tuple, socket.clone());
        debug!("Opened UDP socket {} for {}", socket.local_addr()?, tuple);

        let rt = runtime::Handle::current();
        rt.spawn(forward_udp_replies(
            *tuple,
            socket.clone(),
            self.udp.clone(),
            self.udp_sockets.clone(),
        ));
        Ok(socket)
    }
}

async fn forward_tcp(stream: RedirectedStream) -> Result<(), ForwardError> {
    let tuple = stream.tuple();
    let (destination_addr, client_addr) = (stream.local_addr(), stream.peer_addr());
    let mut socket = stream.into_inner();
    let connect = TcpStream::connect(destination_addr);
    let mut destination = match time::timeout(CONNECT_TIMEOUT, connect).await {
        Ok(stream) => stream?,
        Err(_) => return Err("Timed out connecting to destination".into()),
    };
    debug!("Connected to {} for {}", destination_addr, client_addr);
    let (sent, received) = tokio::io::copy_bidirectional(&mut socket, &mut destination).await?;
    debug!(
        "TCP forward for {} finished, sent {} received {} bytes",
        tuple, sent, received
    );
    Ok(())
}

async fn forward_udp_replies<D: Device>(
    tuple: Tuple,
    socket: Arc<UdpSocket>,
    udp: nat::UdpRelay<D>,
    udp_sockets: UdpSockets,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let bytes = tokio::select! {
            res = time::timeout(UDP_CALL_TIMEOUT, socket.recv(&mut buf)) => match res {
                Ok(Ok(bytes)) => bytes,
                Ok(Err(err)) => {
                    debug!("Failed to receive UDP reply for {}: {}", tuple, err);
                    break;
                }
                Err(_) => {
                    debug!("UDP socket for {} is idle", tuple);
                    break;
                }
            },
            _ = udp.closed() => break,
        };
        if let Err(err) = udp.send(&tuple, &buf[..bytes]).await {
            debug!("Failed to relay UDP reply for {}: {}", tuple, err);
            if matches!(err, NatError::Closed) {
                break;
            }
        }
    }
    let mut sockets = match udp_sockets.lock() {
        Ok(sockets) => sockets,
        Err(err) => err.into_inner(),
    };
    // A new socket may have replaced this one.
    if sockets
        .get(&tuple)
        .is_some_and(|current| Arc::ptr_eq(current, &socket))
    {
        sockets.remove(&tuple);
    }
}

#[derive(Debug)]
pub enum ForwardError {
    Internal(&'static str),
    Nat(NatError),
    Io(io::Error),
}

impl fmt::Display for ForwardError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Internal(msg) => f.write_str(msg),
            Self::Nat(e) => write!(f, "NAT error: {e}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl error::Error for ForwardError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Internal(_msg) => None,
            Self::Nat(err) => Some(err),
            Self::Io(err) => Some(err),
        }
    }
}

impl From<&'static str> for ForwardError {
    fn from(msg: &'static str) -> ForwardError {
        Self::Internal(msg)
    }
}

impl From<NatError> for ForwardError {
    fn from(err: NatError) -> ForwardError {
        Self::Nat(err)
    }
}

impl From<io::Error> for ForwardError {
    fn from(err: io::Error) -> ForwardError {
        Self::Io(err)
    }
}
