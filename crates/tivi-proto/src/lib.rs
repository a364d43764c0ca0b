//! Wire types shared by the Tivi signaling server and its clients.
//!
//! Websocket frames are JSON objects of the form
//! `{"event": "<name>", "data": <payload>}`; see [`events`].

pub mod api;
pub mod device;
pub mod events;
pub mod validation;

pub use device::{Device, DeviceCapabilities, DeviceRegistration, Platform, Resolution};
pub use events::{ClientEvent, ServerEvent, SignalKind, SignalingMessage};
