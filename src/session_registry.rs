use std::sync::{PoisonError, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, info};
use crate::error::{ProtocolError, ProtocolResult};
use crate::frame_header::ServiceType;

/// Per-session state that is shared between the receive path (which opens and closes services
///  based on control frames) and the send path (which checks the send gate).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionState {
    pub session_id: u8,
    /// the version negotiated by this session's most recent StartService ACK
    pub version: u8,
    /// started services with the correlation token captured from their StartService ACK (0
    ///  for version 1)
    pub services: FxHashMap<ServiceType, u32>,
}

/// The send gate: a message can only be sent on a session after it was acknowledged by the
///  peer.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<FxHashMap<u8, SessionState>>,
}

impl SessionRegistry {
    pub fn new() -> SessionRegistry {
        Default::default()
    }

    pub fn on_service_started(&self, session_id: u8, service_type: ServiceType, version: u8, correlation_token: u32) {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);

        let session = sessions.entry(session_id)
            .or_insert_with(|| {
                info!("session {} opened with protocol version {}", session_id, version);
                SessionState {
                    session_id,
                    version,
                    services: Default::default(),
                }
            });
        session.version = version;
        session.services.insert(service_type, correlation_token);
        debug!("service {:?} started on session {}, correlation token {}", service_type, session_id, correlation_token);
    }

    /// Returns the protocol version to send with if the session is open
    pub fn require_started(&self, session_id: u8) -> ProtocolResult<u8> {
        self.version(session_id)
            .ok_or(ProtocolError::SendBeforeServiceStarted(session_id))
    }

    pub fn is_started(&self, session_id: u8) -> bool {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
            .contains_key(&session_id)
    }

    pub fn version(&self, session_id: u8) -> Option<u8> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
            .get(&session_id)
            .map(|s| s.version)
    }

    pub fn correlation_token(&self, session_id: u8, service_type: ServiceType) -> Option<u32> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
            .get(&session_id)
            .and_then(|s| s.services.get(&service_type).copied())
    }

    pub fn session(&self, session_id: u8) -> Option<SessionState> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
            .get(&session_id)
            .cloned()
    }

    /// Removes a service from its session. The session itself is closed when its RPC service
    ///  ends or when it has no services left; the return value is `true` in that case.
    pub fn end_service(&self, session_id: u8, service_type: ServiceType) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);

        let Some(session) = sessions.get_mut(&session_id)
        else {
            return false;
        };

        session.services.remove(&service_type);
        if service_type == ServiceType::Rpc || session.services.is_empty() {
            sessions.remove(&session_id);
            info!("session {} closed", session_id);
            true
        }
        else {
            debug!("service {:?} ended on session {}", service_type, session_id);
            false
        }
    }
}
