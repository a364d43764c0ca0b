//! End-to-end flows through the coordinator, observed on each client's
//! outbound queue.

use std::sync::Arc;

use serde_json::json;
use tivi_proto::events::{
    ControlReply, ControlRequest, ControlVerdict, ErrorCode, IncomingControlRequest, SessionEndReason, SessionEnded,
};
use tivi_proto::{
    ClientEvent, DeviceCapabilities, DeviceRegistration, Platform, Resolution, ServerEvent, SignalingMessage,
};
use tivi_signaling::auth::Principal;
use tivi_signaling::handshake::ControlState;
use tivi_signaling::metrics::SignalingMetrics;
use tivi_signaling::registry::ConnectionHandle;
use tivi_signaling::Coordinator;
use tokio::sync::mpsc::Receiver;

struct Client {
    principal: Principal,
    conn: ConnectionHandle,
    rx: Receiver<ServerEvent>,
}

impl Client {
    fn send(&self, coordinator: &Coordinator, event: ClientEvent) {
        coordinator.handle(&self.conn, &self.principal, event);
    }

    fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Drained events other than presence broadcasts.
    fn drain_direct(&mut self) -> Vec<ServerEvent> {
        self.drain()
            .into_iter()
            .filter(|e| !matches!(e, ServerEvent::DevicesUpdated(_)))
            .collect()
    }

    fn disconnect(self, coordinator: &Coordinator) -> Receiver<ServerEvent> {
        coordinator.disconnect(&self.conn, &self.principal);
        self.rx
    }
}

fn coordinator() -> Coordinator {
    Coordinator::new(Arc::new(SignalingMetrics::new().unwrap()))
}

fn connect(coordinator: &Coordinator, principal: Principal) -> Client {
    let (conn, rx) = coordinator.connect(&principal);
    Client { principal, conn, rx }
}

fn registration(name: &str) -> DeviceRegistration {
    DeviceRegistration {
        name: name.to_string(),
        platform: Platform::Linux,
        os_version: "Ubuntu 24.04".to_string(),
        mac_address: Some("00:1a:2b:3c:4d:5e".to_string()),
        ip_address: None,
        capabilities: DeviceCapabilities {
            screen_share: true,
            remote_control: true,
            resolution: Resolution {
                width: 2560,
                height: 1440,
            },
            ..DeviceCapabilities::default()
        },
    }
}

fn registered_device(coordinator: &Coordinator, device_id: &str, name: &str) -> Client {
    let mut client = connect(coordinator, Principal::device("user_owner", device_id));
    client.send(coordinator, ClientEvent::DeviceRegister(registration(name)));
    client.drain();
    client
}

fn request(target: &str) -> ClientEvent {
    ClientEvent::ControlRequest(ControlRequest {
        target_device_id: target.to_string(),
    })
}

fn approve(requester: &str) -> ClientEvent {
    ClientEvent::ControlApprove(ControlReply {
        requester_id: requester.to_string(),
    })
}

fn deny(requester: &str) -> ClientEvent {
    ClientEvent::ControlDeny(ControlReply {
        requester_id: requester.to_string(),
    })
}

fn offer(target: &str) -> ClientEvent {
    ClientEvent::Offer(SignalingMessage {
        target_device_id: target.to_string(),
        source_device_id: None,
        payload: json!({"type": "offer", "sdp": "v=0\r\n"}),
    })
}

#[test]
fn registration_is_acknowledged_and_broadcast() {
    let coordinator = coordinator();
    let mut watcher = connect(&coordinator, Principal::controller("ctl1"));
    let mut dev = connect(&coordinator, Principal::device("user_owner", "dev1"));

    dev.send(&coordinator, ClientEvent::DeviceRegister(registration("Studio")));

    let dev_events = dev.drain();
    assert!(matches!(&dev_events[0], ServerEvent::DeviceRegistered(r) if r.device_id == "dev1"));
    assert!(matches!(&dev_events[1], ServerEvent::DevicesUpdated(list) if list.len() == 1));

    let watcher_events = watcher.drain();
    let [ServerEvent::DevicesUpdated(list)] = watcher_events.as_slice() else {
        panic!("expected a single presence update, got {watcher_events:?}");
    };
    assert_eq!(list[0].id, "dev1");
    assert_eq!(list[0].name, "Studio");
    assert!(list[0].online);
    assert!(list[0].capabilities.remote_control);
}

#[test]
fn device_list_answers_only_the_caller() {
    let coordinator = coordinator();
    let _dev = registered_device(&coordinator, "dev1", "Studio");
    let mut asker = connect(&coordinator, Principal::controller("ctl1"));
    let mut bystander = connect(&coordinator, Principal::controller("ctl2"));

    asker.send(&coordinator, ClientEvent::DeviceList);

    let events = asker.drain();
    assert!(matches!(events.as_slice(), [ServerEvent::DevicesList(list)] if list.len() == 1));
    assert!(bystander.drain().is_empty());
}

#[test]
fn denied_request_never_unlocks_negotiation() {
    let coordinator = coordinator();
    let mut dev = registered_device(&coordinator, "dev1", "Studio");
    let mut ctl = connect(&coordinator, Principal::controller("ctl1"));

    ctl.send(&coordinator, request("dev1"));
    assert_eq!(
        dev.drain_direct(),
        vec![ServerEvent::ControlRequested(IncomingControlRequest {
            requester_id: "ctl1".into(),
            requester_name: "ctl1".into(),
        })]
    );
    assert!(ctl.drain_direct().is_empty());

    dev.send(&coordinator, deny("ctl1"));
    assert_eq!(
        ctl.drain_direct(),
        vec![ServerEvent::ControlDenied(ControlVerdict {
            device_id: "dev1".into()
        })]
    );
    assert_eq!(coordinator.control_state("ctl1", "dev1"), None);

    ctl.send(&coordinator, offer("dev1"));
    assert!(dev.drain_direct().is_empty());

    // A fresh, approved request is required.
    ctl.send(&coordinator, request("dev1"));
    dev.drain();
    dev.send(&coordinator, approve("ctl1"));
    assert!(matches!(ctl.drain_direct().as_slice(), [ServerEvent::ControlApproved(_)]));

    ctl.send(&coordinator, offer("dev1"));
    assert!(matches!(dev.drain_direct().as_slice(), [ServerEvent::Offer(s)] if s.source_device_id == "ctl1"));
}

#[test]
fn device_disconnect_ends_active_session() {
    let coordinator = coordinator();
    let dev = registered_device(&coordinator, "dev1", "Studio");
    let mut ctl = connect(&coordinator, Principal::controller("ctl1"));

    ctl.send(&coordinator, request("dev1"));
    dev.send(&coordinator, approve("ctl1"));
    ctl.send(&coordinator, offer("dev1"));
    assert_eq!(coordinator.control_state("ctl1", "dev1"), Some(ControlState::Active));
    ctl.drain();

    let mut dev_rx = dev.disconnect(&coordinator);
    let events = ctl.drain();
    assert!(events.contains(&ServerEvent::SessionEnded(SessionEnded {
        peer_id: "dev1".into(),
        reason: SessionEndReason::PeerDisconnected,
    })));
    assert!(events
        .iter()
        .any(|e| matches!(e, ServerEvent::DevicesUpdated(list) if list.is_empty())));

    assert_eq!(coordinator.control_state("ctl1", "dev1"), None);
    assert!(coordinator.online_devices().is_empty());

    while dev_rx.try_recv().is_ok() {}
    ctl.send(&coordinator, offer("dev1"));
    assert!(dev_rx.try_recv().is_err());
    assert!(ctl.drain().is_empty());
}

#[test]
fn controller_disconnect_notifies_device() {
    let coordinator = coordinator();
    let mut dev = registered_device(&coordinator, "dev1", "Studio");
    let ctl = connect(&coordinator, Principal::controller("ctl1"));

    ctl.send(&coordinator, request("dev1"));
    dev.drain();
    ctl.disconnect(&coordinator);

    assert_eq!(
        dev.drain_direct(),
        vec![ServerEvent::SessionEnded(SessionEnded {
            peer_id: "ctl1".into(),
            reason: SessionEndReason::PeerDisconnected,
        })]
    );
    // Controllers are not devices; presence is unchanged.
    assert_eq!(coordinator.online_devices().len(), 1);
}

#[test]
fn only_the_target_device_may_approve() {
    let coordinator = coordinator();
    let mut dev1 = registered_device(&coordinator, "dev1", "Studio");
    let mut dev2 = registered_device(&coordinator, "dev2", "Laptop");
    let mut ctl = connect(&coordinator, Principal::controller("ctl1"));

    ctl.send(&coordinator, request("dev1"));
    dev1.drain();

    // Another device answering is a stale action and is absorbed.
    dev2.send(&coordinator, approve("ctl1"));
    assert!(dev2.drain_direct().is_empty());
    assert_eq!(coordinator.control_state("ctl1", "dev1"), Some(ControlState::Requested));

    // A controller token cannot answer at all.
    let mut other = connect(&coordinator, Principal::controller("ctl2"));
    other.send(&coordinator, approve("ctl1"));
    assert!(matches!(
        other.drain_direct().as_slice(),
        [ServerEvent::Error(e)] if e.code == ErrorCode::NotADevice
    ));
    assert_eq!(coordinator.control_state("ctl1", "dev1"), Some(ControlState::Requested));
    assert!(ctl.drain_direct().is_empty());
}

#[test]
fn repeated_request_leaves_one_actionable_session() {
    let coordinator = coordinator();
    let mut dev = registered_device(&coordinator, "dev1", "Studio");
    let mut ctl = connect(&coordinator, Principal::controller("ctl1"));

    ctl.send(&coordinator, request("dev1"));
    ctl.send(&coordinator, request("dev1"));
    assert_eq!(dev.drain_direct().len(), 2);

    dev.send(&coordinator, approve("ctl1"));
    dev.send(&coordinator, approve("ctl1"));
    assert_eq!(ctl.drain_direct().len(), 1);
    assert_eq!(coordinator.control_state("ctl1", "dev1"), Some(ControlState::Approved));
}

#[test]
fn request_for_offline_device_is_reported() {
    let coordinator = coordinator();
    let mut ctl = connect(&coordinator, Principal::controller("ctl1"));

    ctl.send(&coordinator, request("dev-missing"));

    let events = ctl.drain();
    assert!(matches!(
        events.as_slice(),
        [ServerEvent::ControlUnreachable(u)] if u.target_device_id == "dev-missing"
    ));
    assert_eq!(coordinator.control_state("ctl1", "dev-missing"), None);
}

#[test]
fn requester_name_prefers_registered_device_name() {
    let coordinator = coordinator();
    let mut target = registered_device(&coordinator, "dev1", "Studio");
    let requester = registered_device(&coordinator, "dev2", "Ops Laptop");
    target.drain();

    requester.send(&coordinator, request("dev1"));

    assert!(matches!(
        target.drain_direct().as_slice(),
        [ServerEvent::ControlRequested(r)] if r.requester_id == "dev2" && r.requester_name == "Ops Laptop"
    ));
}

#[test]
fn relayed_source_is_the_authenticated_sender() {
    let coordinator = coordinator();
    let mut dev = registered_device(&coordinator, "dev1", "Studio");
    let mut ctl = connect(&coordinator, Principal::controller("ctl1"));
    ctl.send(&coordinator, request("dev1"));
    dev.send(&coordinator, approve("ctl1"));
    dev.drain();
    ctl.drain();

    let payload = json!({"candidate": "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host", "sdpMLineIndex": 0});
    ctl.send(
        &coordinator,
        ClientEvent::IceCandidate(SignalingMessage {
            target_device_id: "dev1".into(),
            source_device_id: Some("dev9".into()),
            payload: payload.clone(),
        }),
    );

    let events = dev.drain();
    let [ServerEvent::IceCandidate(signal)] = events.as_slice() else {
        panic!("expected one candidate, got {events:?}");
    };
    assert_eq!(signal.source_device_id, "ctl1");
    assert_eq!(signal.payload, payload);

    // And the device answers back to the controller.
    dev.send(
        &coordinator,
        ClientEvent::Answer(SignalingMessage {
            target_device_id: "ctl1".into(),
            source_device_id: None,
            payload: json!({"type": "answer", "sdp": "v=0\r\n"}),
        }),
    );
    assert!(matches!(ctl.drain().as_slice(), [ServerEvent::Answer(s)] if s.source_device_id == "dev1"));
}

#[test]
fn registration_requires_device_token_and_valid_payload() {
    let coordinator = coordinator();
    let mut ctl = connect(&coordinator, Principal::controller("ctl1"));
    ctl.send(&coordinator, ClientEvent::DeviceRegister(registration("Sneaky")));
    assert!(matches!(
        ctl.drain().as_slice(),
        [ServerEvent::Error(e)] if e.code == ErrorCode::NotADevice
    ));

    let mut dev = connect(&coordinator, Principal::device("user_owner", "dev1"));
    dev.send(&coordinator, ClientEvent::DeviceRegister(registration("   ")));
    assert!(matches!(
        dev.drain().as_slice(),
        [ServerEvent::Error(e)] if e.code == ErrorCode::InvalidRegistration
    ));
    assert!(coordinator.online_devices().is_empty());
}

#[test]
fn superseded_connection_close_keeps_new_binding() {
    let coordinator = coordinator();
    let old = registered_device(&coordinator, "dev1", "Studio");
    let fresh = registered_device(&coordinator, "dev1", "Studio");
    let mut ctl = connect(&coordinator, Principal::controller("ctl1"));

    old.disconnect(&coordinator);
    assert_eq!(coordinator.online_devices().len(), 1);
    assert!(ctl.drain().is_empty());

    ctl.send(&coordinator, request("dev1"));
    let mut fresh_rx = fresh.disconnect(&coordinator);
    assert!(fresh_rx.try_recv().is_ok());
    assert!(coordinator.online_devices().is_empty());
}

#[test]
fn closing_newer_tab_keeps_older_tab_reachable() {
    let coordinator = coordinator();
    let mut dev = registered_device(&coordinator, "dev1", "Studio");
    let mut tab_a = connect(&coordinator, Principal::controller("ctl1"));
    let tab_b = connect(&coordinator, Principal::controller("ctl1"));

    tab_b.disconnect(&coordinator);
    tab_a.send(&coordinator, request("dev1"));
    assert!(matches!(dev.drain_direct().as_slice(), [ServerEvent::ControlRequested(_)]));

    dev.send(&coordinator, approve("ctl1"));
    assert_eq!(
        tab_a.drain_direct(),
        vec![ServerEvent::ControlApproved(ControlVerdict {
            device_id: "dev1".into()
        })]
    );
    assert_eq!(coordinator.control_state("ctl1", "dev1"), Some(ControlState::Approved));
}

#[test]
fn closing_one_of_several_controller_tabs_keeps_sessions() {
    let coordinator = coordinator();
    let mut dev = registered_device(&coordinator, "dev1", "Studio");
    let mut ctl = connect(&coordinator, Principal::controller("ctl1"));
    ctl.send(&coordinator, request("dev1"));
    dev.send(&coordinator, approve("ctl1"));

    let second_tab = connect(&coordinator, Principal::controller("ctl1"));
    second_tab.disconnect(&coordinator);

    assert!(dev.drain_direct().iter().all(|e| !matches!(e, ServerEvent::SessionEnded(_))));
    assert_eq!(coordinator.control_state("ctl1", "dev1"), Some(ControlState::Approved));
}

#[test]
fn transient_device_connection_leaves_live_session_alone() {
    let coordinator = coordinator();
    let dev = registered_device(&coordinator, "dev1", "Studio");
    let mut ctl = connect(&coordinator, Principal::controller("ctl1"));
    ctl.send(&coordinator, request("dev1"));
    dev.send(&coordinator, approve("ctl1"));
    ctl.send(&coordinator, offer("dev1"));
    assert_eq!(coordinator.control_state("ctl1", "dev1"), Some(ControlState::Active));
    ctl.drain();

    let transient = connect(&coordinator, Principal::device("user_owner", "dev1"));
    transient.disconnect(&coordinator);

    assert!(ctl.drain().is_empty());
    assert_eq!(coordinator.control_state("ctl1", "dev1"), Some(ControlState::Active));
    assert_eq!(coordinator.online_devices().len(), 1);

    // The registered connection still closes the session when it goes.
    dev.disconnect(&coordinator);
    assert!(matches!(
        ctl.drain_direct().as_slice(),
        [ServerEvent::SessionEnded(SessionEnded { reason: SessionEndReason::PeerDisconnected, .. })]
    ));
}

#[test]
fn device_requesting_itself_is_rejected() {
    let coordinator = coordinator();
    let mut dev = registered_device(&coordinator, "dev1", "Studio");

    dev.send(&coordinator, request("dev1"));
    assert!(matches!(
        dev.drain_direct().as_slice(),
        [ServerEvent::Error(e)] if e.code == ErrorCode::BadMessage
    ));
    assert_eq!(coordinator.control_state("dev1", "dev1"), None);
}

#[test]
fn connection_count_tracks_lifecycle() {
    let coordinator = coordinator();
    let a = connect(&coordinator, Principal::controller("ctl1"));
    let b = registered_device(&coordinator, "dev1", "Studio");
    assert_eq!(coordinator.connection_count(), 2);

    a.disconnect(&coordinator);
    b.disconnect(&coordinator);
    assert_eq!(coordinator.connection_count(), 0);
}
