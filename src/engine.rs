use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use anyhow::Context;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace};
use crate::binary_header::RpcType;
use crate::config::ProtocolConfig;
use crate::control_frames::{ControlFrameHandler, ControlOutcome};
use crate::error::{ProtocolError, ProtocolResult};
use crate::frame_header::{ControlFrameType, FrameHeader, FrameType, ServiceType};
use crate::frame_receiver::{FrameReceiver, ReceivedFrame};
use crate::frame_segmenter::OutgoingFrame;
use crate::listener::ProtocolListener;
use crate::message_assembler::MessageAssembler;
use crate::protocol_message::ProtocolMessage;
use crate::send_scheduler::{PendingSend, SendScheduler};
use crate::session_registry::SessionRegistry;
use crate::transport::{FramePipeline, FrameTransport};

/// receive-side state, only ever touched by one caller at a time
struct ReceiveState {
    receiver: FrameReceiver,
    assembler: MessageAssembler,
}

/// The protocol engine for a single connection. Incoming bytes are fed in through
///  [`ProtocolEngine::handle_received_bytes`] (or [`ProtocolEngine::run_receive_loop`]), outgoing
///  messages go through [`ProtocolEngine::send_message`], and everything the engine has to
///  report goes to the [`ProtocolListener`].
pub struct ProtocolEngine {
    config: Arc<ProtocolConfig>,
    receive_state: Mutex<ReceiveState>,
    control: ControlFrameHandler,
    sessions: Arc<SessionRegistry>,
    scheduler: Arc<SendScheduler>,
    pipeline: Arc<FramePipeline>,
    listener: Arc<dyn ProtocolListener>,
    protocol_version: Arc<AtomicU8>,
}

impl Drop for ProtocolEngine {
    fn drop(&mut self) {
        self.scheduler.shut_down();
    }
}

impl ProtocolEngine {
    pub fn new(config: ProtocolConfig, transport: Arc<dyn FrameTransport>, listener: Arc<dyn ProtocolListener>) -> anyhow::Result<ProtocolEngine> {
        config.validate()?;
        let config = Arc::new(config);

        let protocol_version = Arc::new(AtomicU8::new(config.initial_protocol_version));
        let sessions = Arc::new(SessionRegistry::new());
        let pipeline = Arc::new(FramePipeline::new(transport));

        let control = ControlFrameHandler::new(sessions.clone(), pipeline.clone(), listener.clone(), protocol_version.clone());
        let scheduler = Arc::new(SendScheduler::new(config.clone(), sessions.clone(), pipeline.clone(), listener.clone()));

        Ok(ProtocolEngine {
            receive_state: Mutex::new(ReceiveState {
                receiver: FrameReceiver::new(config.initial_protocol_version, config.max_frame_payload_size),
                assembler: MessageAssembler::new(config.max_message_size, config.max_open_messages),
            }),
            config,
            control,
            sessions,
            scheduler,
            pipeline,
            listener,
            protocol_version,
        })
    }

    /// The version negotiated by the most recent RPC StartService ACK, or the configured
    ///  initial version before that
    pub fn protocol_version(&self) -> u8 {
        self.protocol_version.load(Ordering::Acquire)
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Feeds a chunk of received bytes into the engine. Chunks can be of any size and need
    ///  not be aligned with frame boundaries, but they must be passed in the order they were
    ///  received.
    pub async fn handle_received_bytes(&self, chunk: &[u8]) {
        trace!("received {} bytes", chunk.len());

        let mut receive_state = self.receive_state.lock().await;
        for frame in receive_state.receiver.push(chunk) {
            match frame {
                Ok(frame) => self.on_frame(&mut receive_state, frame).await,
                Err(e) => self.listener.on_protocol_error("parsing frame header".to_string(), e).await,
            }
        }
    }

    /// Reads from a byte stream until EOF, feeding everything into
    ///  [`ProtocolEngine::handle_received_bytes`]
    pub async fn run_receive_loop(&self, mut reader: impl AsyncRead + Unpin) -> anyhow::Result<()> {
        info!("starting receive loop");

        let mut buf = vec![0u8; self.config.receive_buffer_size];
        loop {
            let num_read = match reader.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    error!("error reading from transport: {}", e);
                    return Err(e).context("receive loop");
                }
            };
            if num_read == 0 {
                info!("end of stream - terminating receive loop");
                return Ok(());
            }
            self.handle_received_bytes(&buf[..num_read]).await;
        }
    }

    async fn on_frame(&self, receive_state: &mut ReceiveState, frame: ReceivedFrame) {
        let ReceivedFrame { header, payload } = frame;

        if header.frame_type == FrameType::Control {
            if let ControlOutcome::SessionClosed(session_id) = self.control.on_control_frame(&header, &payload).await {
                receive_state.assembler.discard_session(session_id);
            }
            return;
        }

        match receive_state.assembler.on_data_frame(&header, payload) {
            Ok(Some(message)) => self.deliver(message).await,
            Ok(None) => {}
            Err(e) => self.listener.on_protocol_error(format!("reassembling {:?}", header), e).await,
        }
    }

    async fn deliver(&self, message: ProtocolMessage) {
        debug!("delivering message on {:?} for session {}: function {}, correlation id {}, {} bytes",
            message.service_type, message.session_id, message.function_id, message.correlation_id, message.data.len());

        let is_unregister_response = message.is_unregister_response();

        if let Err(e) = self.listener.on_message_received(message).await {
            self.listener.on_protocol_error("delivering message".to_string(), ProtocolError::DeliveryFailed(e)).await;
        }

        if is_unregister_response {
            info!("app interface unregistered");
            self.listener.on_app_unregistered().await;
        }
    }

    /// Asks the peer to start the RPC service for a session
    pub async fn start_session(&self, session_id: u8) -> ProtocolResult<()> {
        self.send_start_service(ServiceType::Rpc, session_id).await
    }

    /// Asks the peer to start a service on an existing session. Session 0 is reserved for
    ///  starting the RPC service, see [`ProtocolEngine::start_session`].
    pub async fn start_service(&self, service_type: ServiceType, session_id: u8) -> ProtocolResult<()> {
        if session_id == 0 {
            return Err(ProtocolError::InvalidArgument(format!("cannot start {:?} on session 0", service_type)));
        }
        self.send_start_service(service_type, session_id).await
    }

    async fn send_start_service(&self, service_type: ServiceType, session_id: u8) -> ProtocolResult<()> {
        debug!("requesting start of {:?} on session {}", service_type, session_id);
        let header = FrameHeader::control(self.protocol_version(), service_type, session_id, ControlFrameType::StartService, 0, 0);
        self.pipeline.send_frame(&OutgoingFrame::control(header)).await
    }

    /// Asks the peer to end a service, passing the correlation token captured from the
    ///  service's StartService ACK
    pub async fn end_service(&self, service_type: ServiceType, session_id: u8) -> ProtocolResult<()> {
        let version = self.sessions.version(session_id)
            .unwrap_or_else(|| self.protocol_version());
        let token = self.sessions.correlation_token(session_id, service_type)
            .unwrap_or(0);

        debug!("requesting end of {:?} on session {} with token {}", service_type, session_id, token);

        let mut payload = BytesMut::with_capacity(size_of::<u32>());
        payload.put_u32(token);

        let header = FrameHeader::control(version, service_type, session_id, ControlFrameType::EndService, token, payload.len() as u32);
        self.pipeline.send_frame(&OutgoingFrame {
            header,
            payload: payload.freeze(),
        }).await
    }

    /// Queues a message for sending on its session. The message is always sent as an RPC
    ///  request, encoded for the version negotiated for the session; a message with bulk data
    ///  on the RPC service goes to the bulk service.
    ///
    /// This fails immediately if the session's service was not acknowledged by the peer. It
    ///  does not wait for the message to be sent, transport errors are reported to the
    ///  listener.
    pub fn send_message(&self, mut message: ProtocolMessage) -> ProtocolResult<()> {
        let version = self.sessions.require_started(message.session_id)?;

        message.rpc_type = RpcType::Request;
        message.version = version;

        let payload = message.to_frame_payload(version)?;
        if payload.len() > self.config.max_message_size {
            return Err(ProtocolError::MessageTooLarge(payload.len()));
        }

        self.scheduler.submit(PendingSend {
            session_id: message.session_id,
            service_type: message.outbound_service_type(),
            version,
            correlation_id: message.correlation_id,
            payload,
        })
    }
}
