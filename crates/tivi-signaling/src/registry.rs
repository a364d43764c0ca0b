//! Live presence: which identities are reachable and through which connection.
//!
//! The registry is a cache of live presence, not a record of history. It is
//! plain data; [`crate::coordinator::Coordinator`] provides the lock that
//! serializes every mutation and lookup.

use std::collections::HashMap;
use std::fmt;

use chrono::Utc;
use tivi_proto::{Device, DeviceRegistration, ServerEvent};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

/// Events a connection may have queued before further ones are dropped.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Outbound side of one websocket connection.
///
/// Sending never blocks. A send to a closed connection, or to one whose
/// queue is full because the client stopped reading, is dropped and
/// reported as `false`.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<ServerEvent>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, tx: mpsc::Sender<ServerEvent>) -> Self {
        Self { id, tx }
    }

    /// A handle with a fresh outbound queue of the standard capacity.
    pub fn channel(id: ConnectionId) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        (Self::new(id, tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn send(&self, event: ServerEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(conn = %self.id, event = event.name(), "outbound queue full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionHandle").field(&self.id).finish()
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

/// An event addressed to a connection, computed under the lock and sent
/// after it is released.
#[derive(Debug)]
pub struct Delivery {
    pub to: ConnectionHandle,
    pub event: ServerEvent,
}

impl Delivery {
    pub fn new(to: ConnectionHandle, event: ServerEvent) -> Self {
        Self { to, event }
    }

    pub fn send(self) -> bool {
        self.to.send(self.event)
    }
}

#[derive(Debug, Clone)]
struct DeviceEntry {
    device: Device,
    conn: ConnectionHandle,
}

/// What a closing connection still owned when it was detached.
#[derive(Debug, Default)]
pub struct Detached {
    /// No other live connection remains for the identity.
    pub last_connection: bool,
    /// The device entry evicted along with the connection.
    pub unregistered: Option<Device>,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, DeviceEntry>,
    /// Live connections per authenticated identity, oldest first. The last
    /// one is where events for that identity go.
    peers: HashMap<String, Vec<ConnectionHandle>>,
    /// Every open connection; the presence broadcast goes to all of them.
    connections: HashMap<ConnectionId, ConnectionHandle>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an authenticated connection to its identity. A newer connection
    /// for the same identity becomes the one events are routed to; the
    /// binding it takes over from is returned. Older connections stay live
    /// and take over again if the newer one closes first.
    pub fn attach(&mut self, identity: &str, conn: ConnectionHandle) -> Option<ConnectionHandle> {
        let id = conn.id();
        self.connections.insert(id, conn.clone());
        let previous = self
            .peers
            .get(identity)
            .and_then(|conns| conns.last())
            .filter(|prev| prev.id() != id)
            .cloned();
        self.bind(identity, conn);
        previous
    }

    /// Make `conn` the most recent binding for `identity`.
    fn bind(&mut self, identity: &str, conn: ConnectionHandle) {
        let conns = self.peers.entry(identity.to_string()).or_default();
        conns.retain(|c| c.id() != conn.id());
        conns.push(conn);
    }

    /// Insert or overwrite the device's entry. A registration from a new
    /// connection is a reconnection; the previous binding is returned.
    pub fn register(
        &mut self,
        device_id: &str,
        registration: DeviceRegistration,
        conn: ConnectionHandle,
    ) -> (Device, Option<ConnectionHandle>) {
        let device = Device::from_registration(device_id, registration, Utc::now());
        self.connections.insert(conn.id(), conn.clone());
        self.bind(device_id, conn.clone());

        let previous = self
            .devices
            .insert(
                device_id.to_string(),
                DeviceEntry {
                    device: device.clone(),
                    conn: conn.clone(),
                },
            )
            .map(|entry| entry.conn)
            .filter(|prev| *prev != conn);

        (device, previous)
    }

    /// Remove the device's entry. Absent identities are a no-op.
    pub fn unregister(&mut self, device_id: &str) -> Option<Device> {
        self.devices.remove(device_id).map(|mut entry| {
            entry.device.online = false;
            entry.device.last_seen = Utc::now();
            entry.device
        })
    }

    pub fn lookup(&self, device_id: &str) -> Option<ConnectionHandle> {
        self.devices.get(device_id).map(|entry| entry.conn.clone())
    }

    pub fn device(&self, device_id: &str) -> Option<&Device> {
        self.devices.get(device_id).map(|entry| &entry.device)
    }

    /// Resolve any identity: registered devices first, then other live
    /// connections bound to that identity.
    pub fn resolve(&self, identity: &str) -> Option<ConnectionHandle> {
        self.lookup(identity)
            .or_else(|| self.peers.get(identity).and_then(|conns| conns.last()).cloned())
    }

    /// Point-in-time copy of online devices, ordered by id.
    pub fn list_online(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.values().map(|entry| entry.device.clone()).collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    /// Every open connection, for presence broadcasts.
    pub fn recipients(&self) -> Vec<ConnectionHandle> {
        self.connections.values().cloned().collect()
    }

    /// Forget a closing connection. Only its own bindings are removed; the
    /// identity's other live connections stay reachable.
    pub fn detach(&mut self, conn: ConnectionId, identity: &str) -> Detached {
        self.connections.remove(&conn);

        let last_connection = match self.peers.get_mut(identity) {
            Some(conns) => {
                conns.retain(|c| c.id() != conn);
                conns.is_empty()
            }
            None => true,
        };
        if last_connection {
            self.peers.remove(identity);
        }

        let owns_device = self.devices.get(identity).is_some_and(|entry| entry.conn.id() == conn);
        let unregistered = if owns_device { self.unregister(identity) } else { None };

        Detached {
            last_connection,
            unregistered,
        }
    }

    pub fn online_count(&self) -> usize {
        self.devices.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
