use std::{
    collections::{HashMap, VecDeque},
    fmt,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, trace};
use tokio::sync::{Mutex, MutexGuard};

use crate::ip::TcpFlags;

use super::NatError;

const PORT_BEGIN: u16 = 30000;
const PORT_LENGTH: u16 = 10240;

// Keeps a closed flow around long enough for the last ACK and retransmitted FINs.
const CLOSED_LINGER: Duration = Duration::from_secs(30);

/// Flow identity as observed on the device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Tuple {
    pub source: SocketAddr,
    pub destination: SocketAddr,
}

impl Tuple {
    pub fn new(source: SocketAddr, destination: SocketAddr) -> Tuple {
        Tuple {
            source,
            destination,
        }
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.destination)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From the client towards the original destination.
    Forward,
    /// From the local listener back to the client.
    Return,
}

struct Binding {
    tuple: Tuple,
    last_used: Instant,
    forward_fin: bool,
    return_fin: bool,
    reset: bool,
}

impl Binding {
    fn new(tuple: Tuple) -> Binding {
        Binding {
            tuple,
            last_used: Instant::now(),
            forward_fin: false,
            return_fin: false,
            reset: false,
        }
    }

    fn is_closed(&self) -> bool {
        self.reset || (self.forward_fin && self.return_fin)
    }

    fn is_expired(&self, now: Instant, idle_timeout: Duration) -> bool {
        let idle = now.saturating_duration_since(self.last_used);
        if self.is_closed() {
            idle >= CLOSED_LINGER
        } else {
            idle >= idle_timeout
        }
    }
}

/// Bidirectional mapping between flow tuples and locally assigned redirect ports.
///
/// Ports come from a fixed range; released ports go to the back of the queue,
/// so that a port is reused as late as possible.
pub struct Table {
    tuples: HashMap<Tuple, u16>,
    ports: Vec<Option<Binding>>,
    available: VecDeque<u16>,
    port_begin: u16,
    idle_timeout: Duration,
}

impl Table {
    pub fn new(reserved_port: u16, idle_timeout: Duration) -> Table {
        Table::with_range(PORT_BEGIN, PORT_LENGTH, reserved_port, idle_timeout)
    }

    pub fn with_range(
        port_begin: u16,
        port_length: u16,
        reserved_port: u16,
        idle_timeout: Duration,
    ) -> Table {
        // Port 0 means "not found" and is never handed out.
        let port_begin = port_begin.max(1);
        let port_end = port_begin.saturating_add(port_length);
        let available = (port_begin..port_end)
            .filter(|port| *port != reserved_port)
            .collect::<VecDeque<_>>();
        let ports = (port_begin..port_end).map(|_| None).collect::<Vec<_>>();
        Table {
            tuples: HashMap::new(),
            ports,
            available,
            port_begin,
            idle_timeout,
        }
    }

    fn binding_mut(&mut self, port: u16) -> Option<&mut Binding> {
        let offset = port.checked_sub(self.port_begin)? as usize;
        self.ports.get_mut(offset)?.as_mut()
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn tuple_of(&mut self, port: u16) -> Option<Tuple> {
        let binding = self.binding_mut(port)?;
        binding.last_used = Instant::now();
        Some(binding.tuple)
    }

    pub fn port_of(&mut self, tuple: &Tuple) -> Option<u16> {
        let port = *self.tuples.get(tuple)?;
        if let Some(binding) = self.binding_mut(port) {
            binding.last_used = Instant::now();
        }
        Some(port)
    }

    pub fn new_conn(&mut self, tuple: Tuple) -> Result<u16, NatError> {
        if self.tuples.contains_key(&tuple) {
            return Err("Tuple already has a redirect port".into());
        }
        let port = match self.available.pop_front() {
            Some(port) => port,
            None => self.reclaim_closed().ok_or(NatError::PortsExhausted)?,
        };
        let offset = (port - self.port_begin) as usize;
        self.ports[offset] = Some(Binding::new(tuple));
        self.tuples.insert(tuple, port);
        trace!("Assigned port {} to {}", port, tuple);
        Ok(port)
    }

    fn reclaim_closed(&mut self) -> Option<u16> {
        // Only a closed flow can give up its port early; active flows keep theirs until they expire.
        let port_begin = self.port_begin;
        let port = self
            .ports
            .iter()
            .enumerate()
            .filter_map(|(offset, binding)| {
                let binding = binding.as_ref()?;
                if binding.is_closed() {
                    Some((port_begin + offset as u16, binding.last_used))
                } else {
                    None
                }
            })
            .min_by_key(|(_, last_used)| *last_used)
            .map(|(port, _)| port)?;
        debug!("Port range exhausted, reclaiming closed port {}", port);
        self.release(port)?;
        self.available.pop_back()
    }

    /// Tracks connection teardown from the TCP flags seen in either direction.
    pub fn observe(&mut self, port: u16, flags: TcpFlags, direction: Direction) {
        let binding = if let Some(binding) = self.binding_mut(port) {
            binding
        } else {
            return;
        };
        if direction == Direction::Forward && flags == TcpFlags::SYN && binding.is_closed() {
            // The client reused the same tuple for a new connection.
            binding.forward_fin = false;
            binding.return_fin = false;
            binding.reset = false;
        }
        if flags.contains(TcpFlags::RST) {
            binding.reset = true;
        }
        if flags.contains(TcpFlags::FIN) {
            match direction {
                Direction::Forward => binding.forward_fin = true,
                Direction::Return => binding.return_fin = true,
            }
        }
        binding.last_used = Instant::now();
    }

    pub fn release(&mut self, port: u16) -> Option<Tuple> {
        let offset = port.checked_sub(self.port_begin)? as usize;
        let binding = self.ports.get_mut(offset)?.take()?;
        self.tuples.remove(&binding.tuple);
        self.available.push_back(port);
        trace!("Released port {} from {}", port, binding.tuple);
        Some(binding.tuple)
    }

    /// Removes closed and idle entries, returns the removed ports and their tuples.
    pub fn cleanup(&mut self, now: Instant) -> Vec<(u16, Tuple)> {
        let idle_timeout = self.idle_timeout;
        let port_begin = self.port_begin;
        let expired = self
            .ports
            .iter()
            .enumerate()
            .filter_map(|(offset, binding)| {
                let binding = binding.as_ref()?;
                if binding.is_expired(now, idle_timeout) {
                    Some(port_begin + offset as u16)
                } else {
                    None
                }
            })
            .collect::<Vec<_>>();
        expired
            .into_iter()
            .filter_map(|port| Some((port, self.release(port)?)))
            .collect()
    }
}

/// Table shared between the dispatch loop, the redirector and the proxy collaborator.
#[derive(Clone)]
pub struct NatTable {
    table: Arc<Mutex<Table>>,
}

impl NatTable {
    pub fn new(table: Table) -> NatTable {
        NatTable {
            table: Arc::new(Mutex::new(table)),
        }
    }

    /// Locks the table for a sequence of operations that must not interleave with others.
    pub async fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().await
    }

    pub async fn tuple_of(&self, port: u16) -> Option<Tuple> {
        self.table.lock().await.tuple_of(port)
    }

    pub async fn cleanup(&self, now: Instant) -> usize {
        self.table.lock().await.cleanup(now).len()
    }
}
