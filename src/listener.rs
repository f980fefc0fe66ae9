use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use crate::error::ProtocolError;
use crate::frame_header::ServiceType;
use crate::protocol_message::ProtocolMessage;

/// The outer layer's view of a connection: everything the engine reports goes through here.
///  Notifications are called from the receive loop or from send workers, so implementations
///  should return quickly.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProtocolListener: Send + Sync + 'static {
    /// A returned error is reported as [`ProtocolError::DeliveryFailed`]; it does not affect
    ///  other messages.
    async fn on_message_received(&self, message: ProtocolMessage) -> anyhow::Result<()>;

    /// The RPC service of a session was acknowledged by the peer
    async fn on_session_started(&self, session_id: u8, version: u8);

    async fn on_service_started(&self, service_type: ServiceType, session_id: u8, version: u8);
    async fn on_service_ended(&self, service_type: ServiceType, session_id: u8, version: u8);
    async fn on_start_service_rejected(&self, service_type: ServiceType, session_id: u8, version: u8);

    /// The peer answered an `UnregisterAppInterface` request
    async fn on_app_unregistered(&self);

    async fn on_heartbeat_ack(&self, session_id: u8);
    async fn on_nav_ack(&self, message_id: u32);

    async fn on_protocol_error(&self, context: String, cause: ProtocolError);
}
