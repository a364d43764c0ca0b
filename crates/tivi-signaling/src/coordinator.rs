//! Connection lifecycle and event dispatch.
//!
//! Registry and handshake state share one mutex. Each handler takes the lock
//! once, computes the deliveries it implies, releases the lock, and only then
//! pushes events onto connection channels. Presence broadcasts are therefore
//! best-effort: a recipient may close right after the recipient set is taken.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tivi_proto::events::{ControlReply, ControlRequest, ErrorCode, Registered, Unreachable};
use tivi_proto::validation::validate_registration;
use tivi_proto::{ClientEvent, Device, DeviceRegistration, ServerEvent, SignalKind, SignalingMessage};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::Principal;
use crate::handshake::{ControlHandshake, ControlState, HandshakeError};
use crate::metrics::SignalingMetrics;
use crate::registry::{ConnectionHandle, ConnectionId, Delivery, DeviceRegistry};
use crate::router::{self, RelayDropped};

#[derive(Debug, Default)]
struct CoordinatorState {
    registry: DeviceRegistry,
    handshake: ControlHandshake,
}

pub struct Coordinator {
    state: Mutex<CoordinatorState>,
    next_conn: AtomicU64,
    metrics: Arc<SignalingMetrics>,
}

fn dispatch(deliveries: impl IntoIterator<Item = Delivery>) {
    for delivery in deliveries {
        let to = delivery.to.id();
        if !delivery.send() {
            debug!(conn = %to, "recipient closed before delivery");
        }
    }
}

fn broadcast(recipients: Vec<ConnectionHandle>, devices: Vec<Device>) {
    dispatch(
        recipients
            .into_iter()
            .map(|to| Delivery::new(to, ServerEvent::DevicesUpdated(devices.clone()))),
    );
}

impl Coordinator {
    pub fn new(metrics: Arc<SignalingMetrics>) -> Self {
        Self {
            state: Mutex::new(CoordinatorState::default()),
            next_conn: AtomicU64::new(1),
            metrics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind a freshly authenticated connection and hand back its outbound queue.
    pub fn connect(&self, principal: &Principal) -> (ConnectionHandle, mpsc::Receiver<ServerEvent>) {
        let (conn, rx) = ConnectionHandle::channel(ConnectionId(self.next_conn.fetch_add(1, Ordering::Relaxed)));

        let (superseded, connections) = {
            let mut state = self.lock();
            let superseded = state.registry.attach(principal.identity(), conn.clone());
            (superseded, state.registry.connection_count())
        };
        self.metrics.active_connections.set(connections as i64);

        if let Some(old) = superseded {
            info!(conn = %conn.id(), previous = %old.id(), identity = principal.identity(), "connection superseded earlier binding");
        } else {
            info!(conn = %conn.id(), identity = principal.identity(), device = principal.is_device(), "client connected");
        }
        (conn, rx)
    }

    /// Handle one inbound event. Callers invoke this sequentially per
    /// connection, which preserves per-connection ordering.
    pub fn handle(&self, conn: &ConnectionHandle, principal: &Principal, event: ClientEvent) {
        debug!(conn = %conn.id(), identity = principal.identity(), event = event.name(), "inbound event");
        match event {
            ClientEvent::DeviceRegister(registration) => self.register_device(conn, principal, registration),
            ClientEvent::DeviceList => {
                let devices = self.lock().registry.list_online();
                conn.send(ServerEvent::DevicesList(devices));
            }
            ClientEvent::ControlRequest(request) => self.request_control(conn, principal, request),
            ClientEvent::ControlApprove(reply) => self.answer_control(conn, principal, reply, true),
            ClientEvent::ControlDeny(reply) => self.answer_control(conn, principal, reply, false),
            ClientEvent::Offer(message) => self.relay(principal, SignalKind::Offer, message),
            ClientEvent::Answer(message) => self.relay(principal, SignalKind::Answer, message),
            ClientEvent::IceCandidate(message) => self.relay(principal, SignalKind::IceCandidate, message),
        }
    }

    fn register_device(&self, conn: &ConnectionHandle, principal: &Principal, registration: DeviceRegistration) {
        let Some(device_id) = principal.device_id.as_deref() else {
            warn!(conn = %conn.id(), identity = principal.identity(), "registration from non-device token");
            conn.send(ServerEvent::error(
                ErrorCode::NotADevice,
                "only device tokens may register a device",
            ));
            return;
        };
        if let Err(e) = validate_registration(&registration) {
            conn.send(ServerEvent::error(ErrorCode::InvalidRegistration, e.to_string()));
            return;
        }

        let (previous, devices, recipients) = {
            let mut state = self.lock();
            let (_, previous) = state.registry.register(device_id, registration, conn.clone());
            (previous, state.registry.list_online(), state.registry.recipients())
        };
        self.metrics.online_devices.set(devices.len() as i64);

        match previous {
            Some(old) => info!(device = device_id, conn = %conn.id(), previous = %old.id(), "device re-registered"),
            None => info!(device = device_id, conn = %conn.id(), "device registered"),
        }

        conn.send(ServerEvent::DeviceRegistered(Registered {
            device_id: device_id.to_string(),
        }));
        broadcast(recipients, devices);
    }

    fn request_control(&self, conn: &ConnectionHandle, principal: &Principal, request: ControlRequest) {
        let requester = principal.identity();
        let target = request.target_device_id;

        let result = {
            let mut state = self.lock();
            let CoordinatorState { registry, handshake } = &mut *state;
            let name = registry
                .device(requester)
                .map(|d| d.name.clone())
                .unwrap_or_else(|| principal.label().to_string());
            handshake.request(registry, requester, &name, &target)
        };

        match result {
            Ok(delivery) => {
                self.metrics.record_control("request", "delivered");
                info!(requester, target = %target, "control requested");
                dispatch([delivery]);
            }
            Err(HandshakeError::TargetUnreachable(target)) => {
                self.metrics.record_control("request", "unreachable");
                debug!(requester, target = %target, "control request for offline device");
                conn.send(ServerEvent::ControlUnreachable(Unreachable {
                    target_device_id: target,
                }));
            }
            Err(e) => {
                self.metrics.record_control("request", "rejected");
                conn.send(ServerEvent::error(ErrorCode::BadMessage, e.to_string()));
            }
        }
    }

    fn answer_control(&self, conn: &ConnectionHandle, principal: &Principal, reply: ControlReply, approve: bool) {
        let action = if approve { "approve" } else { "deny" };
        let requester = reply.requester_id;

        let result = {
            let mut state = self.lock();
            let CoordinatorState { registry, handshake } = &mut *state;
            if approve {
                handshake.approve(registry, principal, &requester)
            } else {
                handshake.deny(registry, principal, &requester)
            }
        };

        match result {
            Ok(delivery) => {
                self.metrics.record_control(action, "accepted");
                info!(device = principal.identity(), requester = %requester, action, "control request answered");
                dispatch(delivery);
            }
            Err(e) if e.is_benign() => {
                self.metrics.record_control(action, "stale");
                debug!(device = principal.identity(), requester = %requester, action, error = %e, "ignored stale answer");
            }
            Err(e) => {
                self.metrics.record_control(action, "rejected");
                warn!(conn = %conn.id(), identity = principal.identity(), action, error = %e, "control answer rejected");
                conn.send(ServerEvent::error(ErrorCode::NotADevice, e.to_string()));
            }
        }
    }

    fn relay(&self, principal: &Principal, kind: SignalKind, message: SignalingMessage) {
        let result = {
            let mut state = self.lock();
            let CoordinatorState { registry, handshake } = &mut *state;
            router::relay(registry, handshake, kind, principal.identity(), message)
        };

        match result {
            Ok(delivery) => {
                self.metrics.messages_relayed.inc();
                dispatch([delivery]);
            }
            Err(dropped) => {
                self.metrics.messages_dropped.with_label_values(&[dropped.reason()]).inc();
                match &dropped {
                    RelayDropped::NotAuthorized { .. } => {
                        warn!(sender = principal.identity(), kind = kind.event_name(), error = %dropped, "relay refused")
                    }
                    RelayDropped::DestinationOffline(_) => {
                        debug!(sender = principal.identity(), kind = kind.event_name(), error = %dropped, "relay dropped")
                    }
                }
            }
        }
    }

    /// Clean up after a closed connection. Runs once per connection; only
    /// bindings the connection still owns are touched. Sessions end when the
    /// identity loses its device entry or its last live connection.
    pub fn disconnect(&self, conn: &ConnectionHandle, principal: &Principal) {
        let identity = principal.identity();

        let (ended, presence, counts) = {
            let mut state = self.lock();
            let CoordinatorState { registry, handshake } = &mut *state;
            let detached = registry.detach(conn.id(), identity);
            let ended = if detached.last_connection || detached.unregistered.is_some() {
                handshake.teardown(registry, identity)
            } else {
                Vec::new()
            };
            let presence = detached
                .unregistered
                .map(|_| (registry.recipients(), registry.list_online()));
            (ended, presence, (registry.connection_count(), registry.online_count()))
        };

        self.metrics.active_connections.set(counts.0 as i64);
        self.metrics.online_devices.set(counts.1 as i64);
        info!(conn = %conn.id(), identity, sessions_ended = ended.len(), "client disconnected");

        dispatch(ended);
        if let Some((recipients, devices)) = presence {
            broadcast(recipients, devices);
        }
    }

    pub fn online_devices(&self) -> Vec<Device> {
        self.lock().registry.list_online()
    }

    pub fn control_state(&self, requester: &str, target: &str) -> Option<ControlState> {
        self.lock().handshake.state(requester, target)
    }

    pub fn connection_count(&self) -> usize {
        self.lock().registry.connection_count()
    }
}
