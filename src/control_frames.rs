use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use bytes::Bytes;
use tracing::{debug, info, warn};
use crate::frame_header::{ControlFrameType, FrameHeader, ServiceType};
use crate::frame_segmenter::OutgoingFrame;
use crate::listener::ProtocolListener;
use crate::session_registry::SessionRegistry;
use crate::transport::FramePipeline;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ControlOutcome {
    Handled,
    /// The session was removed from the registry; its receive-side state should be discarded
    SessionClosed(u8),
}

/// Reacts to incoming control frames: session lifecycle, acknowledgements and heartbeats
pub struct ControlFrameHandler {
    sessions: Arc<SessionRegistry>,
    pipeline: Arc<FramePipeline>,
    listener: Arc<dyn ProtocolListener>,
    /// the engine-wide negotiated version, updated by RPC StartService ACKs
    protocol_version: Arc<AtomicU8>,
}

impl ControlFrameHandler {
    pub fn new(sessions: Arc<SessionRegistry>, pipeline: Arc<FramePipeline>, listener: Arc<dyn ProtocolListener>, protocol_version: Arc<AtomicU8>) -> ControlFrameHandler {
        ControlFrameHandler {
            sessions,
            pipeline,
            listener,
            protocol_version,
        }
    }

    pub async fn on_control_frame(&self, header: &FrameHeader, payload: &Bytes) -> ControlOutcome {
        let Some(control_frame_type) = header.control_frame_type()
        else {
            warn!("unknown control frame type {:#04x} in {:?} - ignoring", header.frame_data, header);
            return ControlOutcome::Handled;
        };

        debug!("received {:?} {:?}", control_frame_type, header);

        match control_frame_type {
            ControlFrameType::StartService => self.on_start_service(header).await,
            ControlFrameType::StartServiceAck => self.on_start_service_ack(header).await,
            ControlFrameType::StartServiceNack => {
                info!("peer rejected start of {:?} on session {}", header.service_type, header.session_id);
                self.listener.on_start_service_rejected(header.service_type, header.session_id, header.version).await;
            }
            ControlFrameType::EndService | ControlFrameType::EndServiceAck => {
                return self.on_end_service(header).await;
            }
            ControlFrameType::EndServiceNack => {
                debug!("peer rejected end of {:?} on session {} - ignoring", header.service_type, header.session_id);
            }
            ControlFrameType::Heartbeat => {
                debug!("heartbeat on session {} ({} payload bytes)", header.session_id, payload.len());
            }
            ControlFrameType::HeartbeatAck => {
                self.listener.on_heartbeat_ack(header.session_id).await;
            }
            ControlFrameType::NavAck => {
                if header.service_type == ServiceType::Nav {
                    self.listener.on_nav_ack(header.message_id).await;
                }
                else {
                    warn!("nav ACK on service {:?} - ignoring", header.service_type);
                }
            }
        }
        ControlOutcome::Handled
    }

    async fn on_start_service(&self, header: &FrameHeader) {
        let ack = FrameHeader::control(header.version, header.service_type, header.session_id, ControlFrameType::StartServiceAck, 0, 0);
        if let Err(e) = self.pipeline.send_frame(&OutgoingFrame::control(ack)).await {
            self.listener.on_protocol_error(format!("acknowledging start of {:?} on session {}", header.service_type, header.session_id), e).await;
        }
    }

    async fn on_start_service_ack(&self, header: &FrameHeader) {
        let version = header.version;
        let correlation_token = if version >= FrameHeader::PROTOCOL_VERSION_2 {
            header.message_id
        }
        else {
            0
        };

        self.sessions.on_service_started(header.session_id, header.service_type, version, correlation_token);

        if header.service_type == ServiceType::Rpc {
            let previous = self.protocol_version.swap(version, Ordering::AcqRel);
            if previous != version {
                info!("negotiated protocol version {} (was {})", version, previous);
            }
            self.listener.on_service_started(header.service_type, header.session_id, version).await;
            self.listener.on_session_started(header.session_id, version).await;
        }
        else {
            self.listener.on_service_started(header.service_type, header.session_id, version).await;
        }
    }

    async fn on_end_service(&self, header: &FrameHeader) -> ControlOutcome {
        let version = self.sessions.version(header.session_id)
            .unwrap_or(header.version);

        if version >= FrameHeader::PROTOCOL_VERSION_2 {
            let token = self.sessions.correlation_token(header.session_id, header.service_type);
            if token != Some(header.message_id) {
                debug!("end of {:?} on session {} with message id {}, expected token {:?} - ignoring", header.service_type, header.session_id, header.message_id, token);
                return ControlOutcome::Handled;
            }
        }

        let session_closed = self.sessions.end_service(header.session_id, header.service_type);
        self.listener.on_service_ended(header.service_type, header.session_id, version).await;

        if session_closed {
            ControlOutcome::SessionClosed(header.session_id)
        }
        else {
            ControlOutcome::Handled
        }
    }
}
