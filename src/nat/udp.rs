use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use log::{debug, trace, warn};
use tokio::sync::mpsc;

use crate::{
    checksum::Checksummer,
    device::Device,
    ip::{IpError, IpPacket, Ipv4Packet, Ipv6Packet, TransportProtocolType, UdpDatagram},
};

use super::{CloseSignal, NatError, Table, Tuple};

const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
const QUEUE_CAPACITY: usize = 128;

/// Datagram received from the device, waiting for the proxy collaborator.
pub struct RelayedDatagram {
    pub call_id: u16,
    pub tuple: Tuple,
    pub payload: Vec<u8>,
}

struct Call {
    created: Instant,
    received: u64,
    sent: u64,
}

struct Calls {
    ids: Table,
    calls: HashMap<Tuple, Call>,
}

impl Calls {
    fn new() -> Calls {
        Calls {
            ids: Table::new(0, UDP_IDLE_TIMEOUT),
            calls: HashMap::new(),
        }
    }

    fn call_id(&mut self, tuple: Tuple) -> Result<u16, NatError> {
        if let Some(id) = self.ids.port_of(&tuple) {
            return Ok(id);
        }
        let id = match self.ids.new_conn(tuple) {
            Ok(id) => id,
            Err(NatError::PortsExhausted) => {
                self.cleanup(Instant::now());
                self.ids.new_conn(tuple)?
            }
            Err(err) => return Err(err),
        };
        self.calls.insert(
            tuple,
            Call {
                created: Instant::now(),
                received: 0,
                sent: 0,
            },
        );
        debug!("Started UDP call {} for {}", id, tuple);
        Ok(id)
    }

    fn cleanup(&mut self, now: Instant) -> usize {
        let removed = self.ids.cleanup(now);
        for (id, tuple) in removed.iter() {
            if let Some(call) = self.calls.remove(tuple) {
                debug!(
                    "UDP call {} for {} expired after {:?}, received {} sent {} datagrams",
                    id,
                    tuple,
                    now.saturating_duration_since(call.created),
                    call.received,
                    call.sent
                );
            }
        }
        removed.len()
    }

    fn clear(&mut self) {
        self.ids = Table::new(0, UDP_IDLE_TIMEOUT);
        self.calls.clear();
    }
}

/// Relays UDP flows between the device and the proxy collaborator.
pub struct UdpRelay<D: Device> {
    inner: Arc<UdpInner<D>>,
}

impl<D: Device> Clone for UdpRelay<D> {
    fn clone(&self) -> Self {
        UdpRelay {
            inner: self.inner.clone(),
        }
    }
}

struct UdpInner<D: Device> {
    device: Arc<D>,
    checksummer: Checksummer,
    calls: Mutex<Calls>,
    queue_tx: mpsc::Sender<RelayedDatagram>,
    queue_rx: tokio::sync::Mutex<mpsc::Receiver<RelayedDatagram>>,
    closed: CloseSignal,
}

impl<D: Device> UdpRelay<D> {
    pub(super) fn new(device: Arc<D>, checksummer: Checksummer) -> UdpRelay<D> {
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        UdpRelay {
            inner: Arc::new(UdpInner {
                device,
                checksummer,
                calls: Mutex::new(Calls::new()),
                queue_tx,
                queue_rx: tokio::sync::Mutex::new(queue_rx),
                closed: CloseSignal::new(),
            }),
        }
    }

    fn calls(&self) -> MutexGuard<'_, Calls> {
        match self.inner.calls.lock() {
            Ok(calls) => calls,
            Err(err) => err.into_inner(),
        }
    }

    /// Queues a datagram from the device, creating its call if needed.
    pub(super) fn handle_packet(&self, packet: &mut IpPacket) -> Result<(), IpError> {
        let src_addr = packet.src_addr();
        let dst_addr = packet.dst_addr();
        let udp = UdpDatagram::from_data(packet.payload_mut())?;
        let tuple = Tuple::new(
            SocketAddr::new(src_addr, udp.src_port()),
            SocketAddr::new(dst_addr, udp.dst_port()),
        );
        if self.is_closed() {
            trace!("UDP relay is closed, dropping datagram for {}", tuple);
            return Ok(());
        }

        let call_id = {
            let mut calls = self.calls();
            let call_id = match calls.call_id(tuple) {
                Ok(call_id) => call_id,
                Err(err) => {
                    warn!("Failed to start UDP call for {}: {}", tuple, err);
                    return Ok(());
                }
            };
            if let Some(call) = calls.calls.get_mut(&tuple) {
                call.received += 1;
            }
            call_id
        };

        let datagram = RelayedDatagram {
            call_id,
            tuple,
            payload: udp.payload().to_vec(),
        };
        match self.inner.queue_tx.try_send(datagram) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("UDP queue is full, dropping datagram for {}", tuple)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("UDP queue is closed, dropping datagram for {}", tuple)
            }
        }
        Ok(())
    }

    /// Returns the next datagram from the device, or None once the relay is closed.
    pub async fn recv(&self) -> Option<RelayedDatagram> {
        if self.is_closed() {
            return None;
        }
        let mut queue = tokio::select! {
            queue = self.inner.queue_rx.lock() => queue,
            _ = self.inner.closed.closed() => return None,
        };
        tokio::select! {
            datagram = queue.recv() => datagram,
            _ = self.inner.closed.closed() => None,
        }
    }

    /// Sends `payload` back to the device as if it came from the tuple's original destination.
    pub async fn send(&self, tuple: &Tuple, payload: &[u8]) -> Result<usize, NatError> {
        if self.is_closed() {
            return Err(NatError::Closed);
        }
        let packet = self.build_reply(tuple, payload)?;
        if log::log_enabled!(log::Level::Trace) {
            trace!(
                "Sending UDP reply {} {}",
                tuple,
                crate::logger::fmt_slice_hex(&packet)
            );
        }
        self.inner.device.write_packet(&packet).await?;

        let mut calls = self.calls();
        // Refreshes the call, if it still exists.
        if calls.ids.port_of(tuple).is_some() {
            if let Some(call) = calls.calls.get_mut(tuple) {
                call.sent += 1;
            }
        }
        Ok(payload.len())
    }

    fn build_reply(&self, tuple: &Tuple, payload: &[u8]) -> Result<Vec<u8>, NatError> {
        let checksummer = &self.inner.checksummer;
        let (src, dst) = (tuple.destination, tuple.source);
        let udp_length = UdpDatagram::HEADER_LENGTH + payload.len();
        match (src.ip(), dst.ip()) {
            (IpAddr::V4(src_addr), IpAddr::V4(dst_addr)) => {
                let header_length = Ipv4Packet::HEADER_LENGTH;
                let mut packet = vec![0u8; header_length + udp_length];
                packet[header_length + UdpDatagram::HEADER_LENGTH..].copy_from_slice(payload);
                Ipv4Packet::write_header(
                    &mut packet[..header_length],
                    src_addr,
                    dst_addr,
                    TransportProtocolType::UDP,
                    udp_length,
                    rand::random(),
                    checksummer,
                )?;
                let pseudo_sum = Ipv4Packet::from_data(&mut packet)?.pseudo_sum(checksummer);
                UdpDatagram::write_header(
                    &mut packet[header_length..],
                    src.port(),
                    dst.port(),
                    pseudo_sum,
                    checksummer,
                )?;
                Ok(packet)
            }
            (IpAddr::V6(src_addr), IpAddr::V6(dst_addr)) => {
                let header_length = Ipv6Packet::HEADER_LENGTH;
                let mut packet = vec![0u8; header_length + udp_length];
                packet[header_length + UdpDatagram::HEADER_LENGTH..].copy_from_slice(payload);
                Ipv6Packet::write_header(
                    &mut packet[..header_length],
                    src_addr,
                    dst_addr,
                    TransportProtocolType::UDP,
                    udp_length,
                )?;
                let pseudo_sum = Ipv6Packet::from_data(&mut packet)?.pseudo_sum(checksummer);
                UdpDatagram::write_header(
                    &mut packet[header_length..],
                    src.port(),
                    dst.port(),
                    pseudo_sum,
                    checksummer,
                )?;
                Ok(packet)
            }
            _ => Err("UDP tuple mixes IPv4 and IPv6 addresses".into()),
        }
    }

    /// Removes idle calls, returns how many were removed.
    pub fn cleanup(&self, now: Instant) -> usize {
        self.calls().cleanup(now)
    }

    /// Drops all calls and wakes pending `recv` callers.
    pub fn close(&self) {
        if self.inner.closed.close() {
            debug!("Closing UDP relay");
        }
        self.calls().clear();
    }

    pub async fn closed(&self) {
        self.inner.closed.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_closed()
    }

    pub fn len(&self) -> usize {
        self.calls().calls.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{device::testing::ChannelDevice, ip::testing};

    fn new_relay() -> (UdpRelay<ChannelDevice>, crate::device::testing::ChannelDeviceHandle) {
        let (device, handle) = ChannelDevice::new();
        (
            UdpRelay::new(Arc::new(device), Checksummer::default()),
            handle,
        )
    }

    fn ingest(relay: &UdpRelay<ChannelDevice>, src: &str, dst: &str, payload: &[u8]) {
        let mut packet = testing::ip_udp(src.parse().unwrap(), dst.parse().unwrap(), payload, 64);
        let mut packet = IpPacket::from_data(&mut packet).unwrap();
        relay.handle_packet(&mut packet).unwrap();
    }

    #[tokio::test]
    async fn datagrams_share_a_call() {
        let (relay, _handle) = new_relay();
        ingest(&relay, "10.0.0.1:5000", "1.1.1.1:53", b"first");
        ingest(&relay, "10.0.0.1:5000", "1.1.1.1:53", b"second");
        ingest(&relay, "10.0.0.1:5001", "1.1.1.1:53", b"third");
        assert_eq!(relay.len(), 2);

        let first = relay.recv().await.unwrap();
        let second = relay.recv().await.unwrap();
        let third = relay.recv().await.unwrap();
        assert_eq!(first.payload, b"first");
        assert_eq!(first.call_id, second.call_id);
        assert_ne!(first.call_id, third.call_id);
        assert_eq!(
            first.tuple,
            Tuple::new(
                "10.0.0.1:5000".parse().unwrap(),
                "1.1.1.1:53".parse().unwrap()
            )
        );
    }

    #[tokio::test]
    async fn full_queue_drops_datagrams() {
        let (relay, _handle) = new_relay();
        for _ in 0..QUEUE_CAPACITY + 10 {
            ingest(&relay, "10.0.0.1:5000", "1.1.1.1:53", b"flood");
        }
        for _ in 0..QUEUE_CAPACITY {
            assert!(relay.recv().await.is_some());
        }
        let pending = tokio::time::timeout(Duration::from_millis(50), relay.recv()).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn invalid_datagram_is_rejected() {
        let (relay, _handle) = new_relay();
        let mut packet = testing::ip_udp(
            "10.0.0.1:5000".parse().unwrap(),
            "1.1.1.1:53".parse().unwrap(),
            b"x",
            64,
        );
        // UDP length larger than the IP payload.
        packet[20 + 5] = 0xff;
        let mut packet = IpPacket::from_data(&mut packet).unwrap();
        assert!(relay.handle_packet(&mut packet).is_err());
        assert_eq!(relay.len(), 0);
    }

    #[tokio::test]
    async fn send_builds_ipv4_reply() {
        let (relay, mut handle) = new_relay();
        let tuple = Tuple::new(
            "10.0.0.1:5000".parse().unwrap(),
            "1.1.1.1:53".parse().unwrap(),
        );
        assert_eq!(relay.send(&tuple, b"answer").await.unwrap(), 6);
        let packet = handle.outgoing.recv().await.unwrap();
        assert_eq!(packet.len(), 20 + 8 + 6);
        assert!(testing::checksums_valid(&packet));
        assert_eq!(testing::src(&packet), tuple.destination);
        assert_eq!(testing::dst(&packet), tuple.source);
        assert_eq!(testing::ttl(&packet), crate::ip::DEFAULT_RESPONSE_TTL);
        assert_eq!(&packet[28..], b"answer");
    }

    #[tokio::test]
    async fn send_builds_ipv6_reply() {
        let (relay, mut handle) = new_relay();
        let tuple = Tuple::new(
            "[fd00::1]:5000".parse().unwrap(),
            "[2001:db8::53]:53".parse().unwrap(),
        );
        relay.send(&tuple, b"").await.unwrap();
        let packet = handle.outgoing.recv().await.unwrap();
        assert_eq!(packet.len(), 40 + 8);
        assert!(testing::checksums_valid(&packet));
        assert_eq!(testing::src(&packet), tuple.destination);
        assert_eq!(testing::dst(&packet), tuple.source);

        let mixed = Tuple::new(tuple.source, "1.1.1.1:53".parse().unwrap());
        assert!(relay.send(&mixed, b"x").await.is_err());
    }

    #[tokio::test]
    async fn idle_calls_are_removed() {
        let (relay, _handle) = new_relay();
        ingest(&relay, "10.0.0.1:5000", "1.1.1.1:53", b"query");
        let call_id = relay.recv().await.unwrap().call_id;
        assert_eq!(relay.cleanup(Instant::now()), 0);
        assert_eq!(
            relay.cleanup(Instant::now() + UDP_IDLE_TIMEOUT + Duration::from_secs(1)),
            1
        );
        assert_eq!(relay.len(), 0);

        // A datagram after teardown starts a new call.
        ingest(&relay, "10.0.0.1:5000", "1.1.1.1:53", b"query");
        assert_ne!(relay.recv().await.unwrap().call_id, call_id);
    }

    #[tokio::test]
    async fn close_wakes_receivers() {
        let (relay, _handle) = new_relay();
        ingest(&relay, "10.0.0.1:5000", "1.1.1.1:53", b"query");
        let waiting = {
            let relay = relay.clone();
            tokio::spawn(async move {
                // Drain, then wait for more.
                relay.recv().await;
                relay.recv().await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        relay.close();
        relay.close();
        assert!(waiting.await.unwrap().is_none());
        assert_eq!(relay.len(), 0);
        assert!(relay.recv().await.is_none());
        let tuple = Tuple::new(
            "10.0.0.1:5000".parse().unwrap(),
            "1.1.1.1:53".parse().unwrap(),
        );
        assert!(matches!(
            relay.send(&tuple, b"late").await,
            Err(NatError::Closed)
        ));
    }
}
