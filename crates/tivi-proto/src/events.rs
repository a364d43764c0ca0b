//! Websocket events.
//!
//! Both directions use an adjacently tagged layout:
//! `{"event": "control:request", "data": {"targetDeviceId": "..."}}`.
//! Events without a payload may omit `data`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::device::{Device, DeviceRegistration};

/// Negotiation message kinds carried by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub fn event_name(self) -> &'static str {
        match self {
            SignalKind::Offer => "webrtc:offer",
            SignalKind::Answer => "webrtc:answer",
            SignalKind::IceCandidate => "webrtc:ice-candidate",
        }
    }
}

/// Inbound negotiation message. `payload` is opaque to the server.
///
/// A client may fill in `sourceDeviceId`, but the server discards it and
/// stamps the authenticated identity of the sending connection instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    pub target_device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_device_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

/// Outbound negotiation message as delivered to the destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayedSignal {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub target_device_id: String,
    pub source_device_id: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlRequest {
    pub target_device_id: String,
}

/// Payload of `control:approve` / `control:deny`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlReply {
    pub requester_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "device:register")]
    DeviceRegister(DeviceRegistration),
    #[serde(rename = "device:list")]
    DeviceList,
    #[serde(rename = "control:request")]
    ControlRequest(ControlRequest),
    #[serde(rename = "control:approve")]
    ControlApprove(ControlReply),
    #[serde(rename = "control:deny")]
    ControlDeny(ControlReply),
    #[serde(rename = "webrtc:offer")]
    Offer(SignalingMessage),
    #[serde(rename = "webrtc:answer")]
    Answer(SignalingMessage),
    #[serde(rename = "webrtc:ice-candidate")]
    IceCandidate(SignalingMessage),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::DeviceRegister(_) => "device:register",
            ClientEvent::DeviceList => "device:list",
            ClientEvent::ControlRequest(_) => "control:request",
            ClientEvent::ControlApprove(_) => "control:approve",
            ClientEvent::ControlDeny(_) => "control:deny",
            ClientEvent::Offer(_) => SignalKind::Offer.event_name(),
            ClientEvent::Answer(_) => SignalKind::Answer.event_name(),
            ClientEvent::IceCandidate(_) => SignalKind::IceCandidate.event_name(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registered {
    pub device_id: String,
}

/// Sent to a device when someone asks to control it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingControlRequest {
    pub requester_id: String,
    pub requester_name: String,
}

/// Sent to a requester with the device's verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlVerdict {
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Unreachable {
    pub target_device_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEndReason {
    PeerDisconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEnded {
    pub peer_id: String,
    pub reason: SessionEndReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadMessage,
    NotADevice,
    InvalidRegistration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "device:registered")]
    DeviceRegistered(Registered),
    #[serde(rename = "devices:list")]
    DevicesList(Vec<Device>),
    #[serde(rename = "devices:updated")]
    DevicesUpdated(Vec<Device>),
    #[serde(rename = "control:request")]
    ControlRequested(IncomingControlRequest),
    #[serde(rename = "control:approved")]
    ControlApproved(ControlVerdict),
    #[serde(rename = "control:denied")]
    ControlDenied(ControlVerdict),
    #[serde(rename = "control:unreachable")]
    ControlUnreachable(Unreachable),
    #[serde(rename = "session:ended")]
    SessionEnded(SessionEnded),
    #[serde(rename = "webrtc:offer")]
    Offer(RelayedSignal),
    #[serde(rename = "webrtc:answer")]
    Answer(RelayedSignal),
    #[serde(rename = "webrtc:ice-candidate")]
    IceCandidate(RelayedSignal),
    #[serde(rename = "error")]
    Error(ErrorBody),
}

impl ServerEvent {
    /// Wrap a relayed signal in the event matching its kind.
    pub fn signal(signal: RelayedSignal) -> Self {
        match signal.kind {
            SignalKind::Offer => ServerEvent::Offer(signal),
            SignalKind::Answer => ServerEvent::Answer(signal),
            SignalKind::IceCandidate => ServerEvent::IceCandidate(signal),
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorBody {
            code,
            message: message.into(),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::DeviceRegistered(_) => "device:registered",
            ServerEvent::DevicesList(_) => "devices:list",
            ServerEvent::DevicesUpdated(_) => "devices:updated",
            ServerEvent::ControlRequested(_) => "control:request",
            ServerEvent::ControlApproved(_) => "control:approved",
            ServerEvent::ControlDenied(_) => "control:denied",
            ServerEvent::ControlUnreachable(_) => "control:unreachable",
            ServerEvent::SessionEnded(_) => "session:ended",
            ServerEvent::Offer(_) => SignalKind::Offer.event_name(),
            ServerEvent::Answer(_) => SignalKind::Answer.event_name(),
            ServerEvent::IceCandidate(_) => SignalKind::IceCandidate.event_name(),
            ServerEvent::Error(_) => "error",
        }
    }
}
