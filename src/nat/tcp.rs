use std::{
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex},
};

use log::{debug, warn};
use tokio::net::{TcpListener, TcpStream};

use super::{CloseSignal, NatError, NatTable, Tuple};

/// Accepts redirected TCP connections and restores their original addresses.
#[derive(Clone)]
pub struct TcpRedirector {
    inner: Arc<TcpInner>,
}

struct TcpInner {
    listener: Mutex<Option<Arc<TcpListener>>>,
    local_addr: SocketAddr,
    portal: IpAddr,
    table: NatTable,
    closed: CloseSignal,
}

impl TcpRedirector {
    pub(super) fn new(
        listener: TcpListener,
        portal: IpAddr,
        table: NatTable,
    ) -> Result<TcpRedirector, NatError> {
        let local_addr = listener.local_addr()?;
        Ok(TcpRedirector {
            inner: Arc::new(TcpInner {
                listener: Mutex::new(Some(Arc::new(listener))),
                local_addr,
                portal,
                table,
                closed: CloseSignal::new(),
            }),
        })
    }

    fn listener(&self) -> Option<Arc<TcpListener>> {
        match self.inner.listener.lock() {
            Ok(listener) => listener.clone(),
            Err(err) => err.into_inner().clone(),
        }
    }

    /// Waits for the next redirected connection.
    ///
    /// Connections that don't come from the portal or have no table entry are closed and skipped.
    pub async fn accept(&self) -> Result<RedirectedStream, NatError> {
        let listener = self.listener().ok_or(NatError::Closed)?;
        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = self.inner.closed.closed() => return Err(NatError::Closed),
            };
            if peer.ip().to_canonical() != self.inner.portal {
                warn!("Rejecting TCP connection from unexpected address {}", peer);
                continue;
            }
            match self.inner.table.tuple_of(peer.port()).await {
                Some(tuple) => {
                    debug!("Accepted redirected TCP {}", tuple);
                    return Ok(RedirectedStream { stream, tuple });
                }
                None => {
                    warn!("Rejecting TCP connection from unknown port {}", peer.port());
                    continue;
                }
            }
        }
    }

    /// Stops accepting connections; pending and future `accept` calls fail with `NatError::Closed`.
    pub fn close(&self) {
        if self.inner.closed.close() {
            debug!("Closing TCP redirector on {}", self.inner.local_addr);
        }
        let mut listener = match self.inner.listener.lock() {
            Ok(listener) => listener,
            Err(err) => err.into_inner(),
        };
        listener.take();
    }

    pub async fn closed(&self) {
        self.inner.closed.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_closed()
    }

    #[cfg(test)]
    pub fn table(&self) -> &NatTable {
        &self.inner.table
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }
}

/// Accepted connection; its addresses are the ones the client used, not the listener's.
pub struct RedirectedStream {
    stream: TcpStream,
    tuple: Tuple,
}

impl RedirectedStream {
    pub fn tuple(&self) -> Tuple {
        self.tuple
    }

    /// Destination the client originally connected to.
    pub fn local_addr(&self) -> SocketAddr {
        self.tuple.destination
    }

    /// Client address as seen on the device.
    pub fn peer_addr(&self) -> SocketAddr {
        self.tuple.source
    }

    pub fn into_inner(self) -> TcpStream {
        self.stream
    }
}
