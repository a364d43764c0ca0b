//! Control handshake: a device operator must approve each requester before
//! any negotiation message reaches the device.
//!
//! One [`ControlSession`] exists per (requester, target) pair:
//!
//! ```text
//! Requested ──approve──> Approved ──first relay──> Active
//!     │
//!     └──────deny──────> Denied (discarded)
//! ```
//!
//! A repeated request for the same pair replaces whatever session exists, so
//! only the latest request is actionable. There is no timeout; a pending
//! request lives until answered or until either party disconnects.

use std::collections::HashMap;

use tivi_proto::events::{ControlVerdict, IncomingControlRequest, SessionEndReason, SessionEnded};
use tivi_proto::ServerEvent;

use crate::auth::Principal;
use crate::registry::{Delivery, DeviceRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Requested,
    Approved,
    Active,
    Denied,
}

impl ControlState {
    /// Whether negotiation may flow between the two parties.
    pub fn is_granted(self) -> bool {
        matches!(self, ControlState::Approved | ControlState::Active)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub requester: String,
    pub target: String,
}

impl SessionKey {
    pub fn new(requester: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            requester: requester.into(),
            target: target.into(),
        }
    }

    /// The other party, if `identity` is one of the two.
    pub fn counterpart(&self, identity: &str) -> Option<&str> {
        if self.requester == identity {
            Some(&self.target)
        } else if self.target == identity {
            Some(&self.requester)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControlSession {
    pub key: SessionKey,
    pub requester_name: String,
    pub state: ControlState,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("target device {0} is not reachable")]
    TargetUnreachable(String),
    #[error("no pending control request from {requester} to {target}")]
    NoSuchRequest { requester: String, target: String },
    #[error("only device connections can answer control requests")]
    NotADevice,
    #[error("a device cannot request control of itself")]
    SelfControl,
}

impl HandshakeError {
    /// Stale or duplicate client actions that are absorbed without a reply.
    pub fn is_benign(&self) -> bool {
        matches!(self, HandshakeError::NoSuchRequest { .. })
    }
}

#[derive(Debug, Default)]
pub struct ControlHandshake {
    sessions: HashMap<SessionKey, ControlSession>,
}

impl ControlHandshake {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or replace) a pending request and notify the target device.
    pub fn request(
        &mut self,
        registry: &DeviceRegistry,
        requester: &str,
        requester_name: &str,
        target: &str,
    ) -> Result<Delivery, HandshakeError> {
        if requester == target {
            return Err(HandshakeError::SelfControl);
        }
        let target_conn = registry
            .lookup(target)
            .ok_or_else(|| HandshakeError::TargetUnreachable(target.to_string()))?;

        let key = SessionKey::new(requester, target);
        self.sessions.insert(
            key.clone(),
            ControlSession {
                key,
                requester_name: requester_name.to_string(),
                state: ControlState::Requested,
            },
        );

        Ok(Delivery::new(
            target_conn,
            ServerEvent::ControlRequested(IncomingControlRequest {
                requester_id: requester.to_string(),
                requester_name: requester_name.to_string(),
            }),
        ))
    }

    /// Grant a pending request. The target is always the caller's own
    /// verified device identity.
    pub fn approve(
        &mut self,
        registry: &DeviceRegistry,
        caller: &Principal,
        requester: &str,
    ) -> Result<Option<Delivery>, HandshakeError> {
        let target = caller.device_id.as_deref().ok_or(HandshakeError::NotADevice)?;
        let session = self.pending_mut(requester, target)?;
        session.state = ControlState::Approved;

        Ok(registry.resolve(requester).map(|conn| {
            Delivery::new(
                conn,
                ServerEvent::ControlApproved(ControlVerdict {
                    device_id: target.to_string(),
                }),
            )
        }))
    }

    /// Refuse a pending request and discard it.
    pub fn deny(
        &mut self,
        registry: &DeviceRegistry,
        caller: &Principal,
        requester: &str,
    ) -> Result<Option<Delivery>, HandshakeError> {
        let target = caller.device_id.as_deref().ok_or(HandshakeError::NotADevice)?;
        self.pending_mut(requester, target)?.state = ControlState::Denied;
        self.sessions.remove(&SessionKey::new(requester, target));

        Ok(registry.resolve(requester).map(|conn| {
            Delivery::new(
                conn,
                ServerEvent::ControlDenied(ControlVerdict {
                    device_id: target.to_string(),
                }),
            )
        }))
    }

    fn pending_mut(&mut self, requester: &str, target: &str) -> Result<&mut ControlSession, HandshakeError> {
        self.sessions
            .get_mut(&SessionKey::new(requester, target))
            .filter(|s| s.state == ControlState::Requested)
            .ok_or_else(|| HandshakeError::NoSuchRequest {
                requester: requester.to_string(),
                target: target.to_string(),
            })
    }

    /// The granted session pairing `a` and `b`, in either direction.
    pub fn granted_between(&self, a: &str, b: &str) -> Option<&ControlSession> {
        [SessionKey::new(a, b), SessionKey::new(b, a)]
            .into_iter()
            .filter_map(|key| self.sessions.get(&key))
            .find(|s| s.state.is_granted())
    }

    /// Mark an approved session as carrying negotiation traffic.
    pub fn activate(&mut self, key: &SessionKey) {
        if let Some(session) = self.sessions.get_mut(key) {
            if session.state == ControlState::Approved {
                session.state = ControlState::Active;
            }
        }
    }

    /// Drop every session `identity` takes part in and tell the other side.
    pub fn teardown(&mut self, registry: &DeviceRegistry, identity: &str) -> Vec<Delivery> {
        let ended: Vec<SessionKey> = self
            .sessions
            .keys()
            .filter(|key| key.counterpart(identity).is_some())
            .cloned()
            .collect();

        let mut deliveries = Vec::with_capacity(ended.len());
        for key in ended {
            self.sessions.remove(&key);
            let Some(other) = key.counterpart(identity) else {
                continue;
            };
            if let Some(conn) = registry.resolve(other) {
                deliveries.push(Delivery::new(
                    conn,
                    ServerEvent::SessionEnded(SessionEnded {
                        peer_id: identity.to_string(),
                        reason: SessionEndReason::PeerDisconnected,
                    }),
                ));
            }
        }
        deliveries
    }

    pub fn state(&self, requester: &str, target: &str) -> Option<ControlState> {
        self.sessions.get(&SessionKey::new(requester, target)).map(|s| s.state)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
