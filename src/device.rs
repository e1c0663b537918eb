use std::{future::Future, io, path::Path};

use log::{info, warn};
use tokio::net::UnixDatagram;

/// Raw IP packet transport, such as a TUN device.
///
/// Every read returns exactly one packet; a zero-length read is treated as EOF.
/// Reads must be cancel-safe, as the dispatch loop abandons a pending read on shutdown.
/// Writes may be issued concurrently from multiple tasks and must send each packet atomically.
pub trait Device: Send + Sync + 'static {
    fn read_packet(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;
    fn write_packet(&self, packet: &[u8]) -> impl Future<Output = io::Result<usize>> + Send;
}

/// Exchanges packets with a user-mode network helper over a Unix datagram socket,
/// one IP packet per datagram.
pub struct UnixDatagramDevice {
    socket: UnixDatagram,
}

impl UnixDatagramDevice {
    pub fn bind(path: &Path, peer: Option<&Path>) -> io::Result<UnixDatagramDevice> {
        // A stale socket file from a previous run prevents binding.
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let socket = UnixDatagram::bind(path)?;
        if let Some(peer) = peer {
            socket.connect(peer)?;
            info!("Device socket {} connected to {}", path.display(), peer.display());
        } else {
            info!("Device socket listening on {}", path.display());
        }
        Ok(UnixDatagramDevice { socket })
    }
}

impl Device for UnixDatagramDevice {
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.socket.peer_addr().is_ok() {
            self.socket.recv(buf).await
        } else {
            // Without a configured peer, the first sender becomes the peer.
            let (bytes, addr) = self.socket.recv_from(buf).await?;
            if let Some(path) = addr.as_pathname() {
                self.socket.connect(path)?;
                info!("Device socket connected to {}", path.display());
            } else {
                warn!("Device packet came from an unnamed socket, waiting for a named sender");
            }
            Ok(bytes)
        }
    }

    async fn write_packet(&self, packet: &[u8]) -> io::Result<usize> {
        self.socket.send(packet).await
    }
}
