//! Addressed relay for offer/answer/candidate messages.
//!
//! The payload is never inspected or rewritten. The source is always the
//! authenticated identity of the sending connection.

use tivi_proto::events::RelayedSignal;
use tivi_proto::{ServerEvent, SignalKind, SignalingMessage};

use crate::handshake::ControlHandshake;
use crate::registry::{Delivery, DeviceRegistry};

/// A negotiation message that was not delivered. Never reported to the
/// sender; negotiation-layer timeouts take care of recovery.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayDropped {
    #[error("no approved control session between {sender} and {destination}")]
    NotAuthorized { sender: String, destination: String },
    #[error("destination {0} is not connected")]
    DestinationOffline(String),
}

impl RelayDropped {
    pub fn reason(&self) -> &'static str {
        match self {
            RelayDropped::NotAuthorized { .. } => "not_authorized",
            RelayDropped::DestinationOffline(_) => "destination_offline",
        }
    }
}

pub fn relay(
    registry: &DeviceRegistry,
    handshake: &mut ControlHandshake,
    kind: SignalKind,
    sender: &str,
    message: SignalingMessage,
) -> Result<Delivery, RelayDropped> {
    let destination = message.target_device_id;

    let key = handshake
        .granted_between(sender, &destination)
        .map(|session| session.key.clone())
        .ok_or_else(|| RelayDropped::NotAuthorized {
            sender: sender.to_string(),
            destination: destination.clone(),
        })?;

    // Toward the controlled device only its registered binding counts.
    let conn = if key.target == destination {
        registry.lookup(&destination)
    } else {
        registry.resolve(&destination)
    }
    .ok_or_else(|| RelayDropped::DestinationOffline(destination.clone()))?;

    handshake.activate(&key);

    Ok(Delivery::new(
        conn,
        ServerEvent::signal(RelayedSignal {
            kind,
            target_device_id: destination,
            source_device_id: sender.to_string(),
            payload: message.payload,
        }),
    ))
}
