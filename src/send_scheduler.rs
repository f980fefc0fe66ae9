use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, trace, warn};
use crate::config::ProtocolConfig;
use crate::error::{ProtocolError, ProtocolResult};
use crate::frame_header::ServiceType;
use crate::frame_segmenter::segment_message;
use crate::listener::ProtocolListener;
use crate::session_registry::SessionRegistry;
use crate::transport::FramePipeline;

/// Dispatch order of queued messages: lower service type first, then lower correlation id.
///  The sequence number keeps messages with equal keys in submission order.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct SendPriority {
    pub service_type: ServiceType,
    pub correlation_id: u32,
    pub sequence: u64,
}

/// An encoded message waiting for a send worker
#[derive(Debug, Clone)]
pub struct PendingSend {
    pub session_id: u8,
    pub service_type: ServiceType,
    /// the version the payload was encoded for
    pub version: u8,
    pub correlation_id: u32,
    pub payload: Bytes,
}

#[derive(Default)]
struct QueueState {
    queue: BTreeMap<SendPriority, PendingSend>,
    next_sequence: u64,
    num_workers: usize,
    num_idle_workers: usize,
}

/// A priority queue of outbound messages, drained by a pool of tokio tasks. Workers are
///  spawned on demand up to `max_send_workers`; workers beyond `min_send_workers` terminate
///  after being idle for `send_worker_idle_timeout`.
///
/// Different messages may be written by different workers, but the frames of a single message
///  are always contiguous on the wire (see [`FramePipeline`]).
pub struct SendScheduler {
    config: Arc<ProtocolConfig>,
    state: Mutex<QueueState>,
    work_available: Notify,
    is_shut_down: AtomicBool,
    message_id_counter: AtomicU32,
    sessions: Arc<SessionRegistry>,
    pipeline: Arc<FramePipeline>,
    listener: Arc<dyn ProtocolListener>,
}

impl SendScheduler {
    pub fn new(config: Arc<ProtocolConfig>, sessions: Arc<SessionRegistry>, pipeline: Arc<FramePipeline>, listener: Arc<dyn ProtocolListener>) -> SendScheduler {
        SendScheduler {
            config,
            state: Default::default(),
            work_available: Notify::new(),
            is_shut_down: AtomicBool::new(false),
            message_id_counter: AtomicU32::new(0),
            sessions,
            pipeline,
            listener,
        }
    }

    /// Queues a message for sending. This fails immediately if the session was not started
    ///  by the peer, and the message is not queued in that case.
    ///
    /// This must be called from inside a tokio runtime since it may spawn a worker.
    pub fn submit(self: &Arc<Self>, pending: PendingSend) -> ProtocolResult<()> {
        self.sessions.require_started(pending.session_id)?;

        if self.is_shut_down.load(Ordering::Acquire) {
            return Err(ProtocolError::Transport(anyhow::anyhow!("send scheduler is shut down")));
        }

        let spawn_worker = {
            let mut state = self.lock_state();

            let priority = SendPriority {
                service_type: pending.service_type,
                correlation_id: pending.correlation_id,
                sequence: state.next_sequence,
            };
            state.next_sequence += 1;
            trace!("queueing {:?} for session {}", priority, pending.session_id);
            state.queue.insert(priority, pending);

            if state.num_idle_workers == 0 && state.num_workers < self.config.max_send_workers {
                state.num_workers += 1;
                true
            }
            else {
                false
            }
        };

        if spawn_worker {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    debug!("spawning send worker");
                    handle.spawn(self.clone().worker_loop());
                }
                Err(e) => {
                    self.lock_state().num_workers -= 1;
                    return Err(ProtocolError::Transport(anyhow::anyhow!("no runtime for send workers: {}", e)));
                }
            }
        }

        self.work_available.notify_one();
        Ok(())
    }

    /// Allocates the next message id. The first id is 1.
    pub fn next_message_id(&self) -> u32 {
        self.message_id_counter.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    pub fn num_workers(&self) -> usize {
        self.lock_state().num_workers
    }

    pub fn num_queued(&self) -> usize {
        self.lock_state().queue.len()
    }

    /// Stops all workers after their current message. Queued messages are dropped.
    pub fn shut_down(&self) {
        self.is_shut_down.store(true, Ordering::Release);
        let num_dropped = {
            let mut state = self.lock_state();
            let num_dropped = state.queue.len();
            state.queue.clear();
            num_dropped
        };
        if num_dropped > 0 {
            warn!("dropping {} queued messages on shutdown", num_dropped);
        }
        self.work_available.notify_waiters();
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pops the highest-priority message, registering the worker as idle if there is none
    fn take_next(&self) -> Option<PendingSend> {
        let mut state = self.lock_state();
        match state.queue.pop_first() {
            Some((_, pending)) => Some(pending),
            None => {
                state.num_idle_workers += 1;
                None
            }
        }
    }

    async fn worker_loop(self: Arc<Self>) {
        loop {
            // registered before checking for shutdown and work, so a notification sent after
            //  these checks is not lost
            let notified = self.work_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_shut_down.load(Ordering::Acquire) {
                self.lock_state().num_workers -= 1;
                debug!("send worker terminating on shutdown");
                return;
            }

            if let Some(pending) = self.take_next() {
                self.do_send(pending).await;
                continue;
            }

            let woken = timeout(self.config.send_worker_idle_timeout, notified).await
                .is_ok();

            let mut state = self.lock_state();
            state.num_idle_workers -= 1;
            if !woken && state.queue.is_empty() && state.num_workers > self.config.min_send_workers {
                state.num_workers -= 1;
                debug!("idle send worker terminating, {} workers remaining", state.num_workers);
                return;
            }
        }
    }

    async fn do_send(&self, pending: PendingSend) {
        let session_id = pending.session_id;
        let service_type = pending.service_type;

        if let Err(e) = self.try_send(pending).await {
            self.listener.on_protocol_error(format!("sending on {:?} for session {}", service_type, session_id), e).await;
        }
    }

    async fn try_send(&self, pending: PendingSend) -> ProtocolResult<()> {
        // the session may have ended while the message was queued
        self.sessions.require_started(pending.session_id)?;

        let message_id = self.next_message_id();
        let frames = segment_message(
            pending.version,
            pending.service_type,
            pending.session_id,
            message_id,
            pending.payload,
            self.config.max_data_size(pending.version),
        )?;

        trace!("sending message {} as {} frames", message_id, frames.len());
        self.pipeline.send_frames(&frames).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::runtime::Builder;
    use tokio::sync::mpsc;
    use crate::frame_header::{FrameHeader, FrameType};
    use crate::listener::MockProtocolListener;
    use crate::transport::MockFrameTransport;

    fn recording_transport() -> (MockFrameTransport, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut transport = MockFrameTransport::new();
        transport.expect_send_frame()
            .returning(move |frame| {
                tx.send(frame.to_vec()).unwrap();
                Ok(())
            });
        (transport, rx)
    }

    fn new_scheduler(config: ProtocolConfig, transport: MockFrameTransport, listener: MockProtocolListener, sessions: Arc<SessionRegistry>) -> Arc<SendScheduler> {
        Arc::new(SendScheduler::new(
            Arc::new(config),
            sessions,
            Arc::new(FramePipeline::new(Arc::new(transport))),
            Arc::new(listener),
        ))
    }

    fn pending(session_id: u8, service_type: ServiceType, correlation_id: u32, payload: &'static [u8]) -> PendingSend {
        PendingSend {
            session_id,
            service_type,
            version: 2,
            correlation_id,
            payload: Bytes::from_static(payload),
        }
    }

    fn started_sessions() -> Arc<SessionRegistry> {
        let sessions = Arc::new(SessionRegistry::new());
        sessions.on_service_started(1, ServiceType::Rpc, 2, 0);
        sessions
    }

    #[test]
    fn test_priority_key_ordering() {
        let mut queue = BTreeMap::new();
        for (sequence, (service_type, correlation_id)) in [(ServiceType::Bulk, 1), (ServiceType::Rpc, 9), (ServiceType::Nav, 0), (ServiceType::Rpc, 2), (ServiceType::Rpc, 2)].into_iter().enumerate() {
            queue.insert(SendPriority { service_type, correlation_id, sequence: sequence as u64 }, sequence);
        }
        assert_eq!(queue.into_values().collect::<Vec<_>>(), vec![3, 4, 1, 2, 0]);
    }

    #[test]
    fn test_dispatch_in_priority_order() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (transport, mut rx) = recording_transport();
            let config = ProtocolConfig { max_send_workers: 1, ..Default::default() };
            let scheduler = new_scheduler(config, transport, MockProtocolListener::new(), started_sessions());

            // no worker runs before the first await, so all three are queued when dispatch starts
            scheduler.submit(pending(1, ServiceType::Bulk, 5, b"5")).unwrap();
            scheduler.submit(pending(1, ServiceType::Bulk, 1, b"1")).unwrap();
            scheduler.submit(pending(1, ServiceType::Bulk, 3, b"3")).unwrap();
            assert_eq!(scheduler.num_workers(), 1);

            let mut dispatched = Vec::new();
            for _ in 0..3 {
                let frame = rx.recv().await.unwrap();
                dispatched.push(*frame.last().unwrap());
            }
            assert_eq!(dispatched, b"135".to_vec());
        });
    }

    #[test]
    fn test_service_type_preempts_bulk() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (transport, mut rx) = recording_transport();
            let config = ProtocolConfig { max_send_workers: 1, ..Default::default() };
            let scheduler = new_scheduler(config, transport, MockProtocolListener::new(), started_sessions());

            scheduler.submit(pending(1, ServiceType::Bulk, 0, b"b")).unwrap();
            scheduler.submit(pending(1, ServiceType::Nav, 0, b"n")).unwrap();
            scheduler.submit(pending(1, ServiceType::Rpc, 100, b"r")).unwrap();

            let mut service_types = Vec::new();
            for _ in 0..3 {
                let frame = rx.recv().await.unwrap();
                service_types.push(frame[1]);
            }
            assert_eq!(service_types, vec![0x07, 0x0b, 0x0f]);
        });
    }

    #[test]
    fn test_message_ids() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (transport, mut rx) = recording_transport();
            let config = ProtocolConfig { mtu: 20, max_send_workers: 1, ..Default::default() };
            let scheduler = new_scheduler(config, transport, MockProtocolListener::new(), started_sessions());

            scheduler.submit(pending(1, ServiceType::Rpc, 0, b"a")).unwrap();
            scheduler.submit(pending(1, ServiceType::Rpc, 1, b"0123456789")).unwrap();

            // 8 payload bytes per frame: "a" fits, the second message is First + 2 x Consecutive
            let mut headers = Vec::new();
            for _ in 0..4 {
                let frame = rx.recv().await.unwrap();
                headers.push(FrameHeader::deser(&mut frame.as_slice()).unwrap());
            }

            assert_eq!(headers[0].message_id, 1);
            assert_eq!(headers[0].frame_type, FrameType::Single);
            assert_eq!(headers[1].frame_type, FrameType::First);
            assert_eq!(headers[2].frame_type, FrameType::Consecutive);
            assert!(!headers[2].is_last_consecutive());
            assert!(headers[3].is_last_consecutive());
            assert!(headers[1..].iter().all(|h| h.message_id == 2));
        });
    }

    #[test]
    fn test_submit_before_service_started() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let scheduler = new_scheduler(ProtocolConfig::default(), MockFrameTransport::new(), MockProtocolListener::new(), Arc::new(SessionRegistry::new()));

            let result = scheduler.submit(pending(1, ServiceType::Rpc, 0, b"x"));
            assert!(matches!(result, Err(ProtocolError::SendBeforeServiceStarted(1))));
            assert_eq!(scheduler.num_queued(), 0);
            assert_eq!(scheduler.num_workers(), 0);
        });
    }

    #[test]
    fn test_session_ended_while_queued() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let mut listener = MockProtocolListener::new();
            listener.expect_on_protocol_error()
                .withf(|_, cause| matches!(cause, ProtocolError::SendBeforeServiceStarted(1)))
                .once()
                .return_const(());

            let sessions = started_sessions();
            let scheduler = new_scheduler(ProtocolConfig::default(), MockFrameTransport::new(), listener, sessions.clone());

            scheduler.submit(pending(1, ServiceType::Rpc, 0, b"x")).unwrap();
            sessions.end_service(1, ServiceType::Rpc);

            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(scheduler.num_queued(), 0);
        });
    }

    #[test]
    fn test_transport_error_is_reported() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let mut transport = MockFrameTransport::new();
            transport.expect_send_frame()
                .returning(|_| Err(anyhow::anyhow!("connection reset")));

            let mut listener = MockProtocolListener::new();
            listener.expect_on_protocol_error()
                .withf(|_, cause| matches!(cause, ProtocolError::Transport(_)))
                .once()
                .return_const(());

            let scheduler = new_scheduler(ProtocolConfig::default(), transport, listener, started_sessions());
            scheduler.submit(pending(1, ServiceType::Rpc, 0, b"x")).unwrap();

            tokio::time::sleep(Duration::from_millis(10)).await;
        });
    }

    #[test]
    fn test_idle_workers_shrink_to_minimum() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (transport, mut rx) = recording_transport();
            let config = ProtocolConfig {
                min_send_workers: 1,
                max_send_workers: 3,
                send_worker_idle_timeout: Duration::from_secs(10),
                ..Default::default()
            };
            let scheduler = new_scheduler(config, transport, MockProtocolListener::new(), started_sessions());

            for correlation_id in 0..5 {
                scheduler.submit(pending(1, ServiceType::Rpc, correlation_id, b"x")).unwrap();
            }
            assert_eq!(scheduler.num_workers(), 3);

            for _ in 0..5 {
                rx.recv().await.unwrap();
            }

            tokio::time::sleep(Duration::from_secs(5)).await;
            assert_eq!(scheduler.num_workers(), 3);

            tokio::time::sleep(Duration::from_secs(10)).await;
            assert_eq!(scheduler.num_workers(), 1);
        });
    }

    #[test]
    fn test_shut_down() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (transport, mut rx) = recording_transport();
            let scheduler = new_scheduler(ProtocolConfig::default(), transport, MockProtocolListener::new(), started_sessions());

            scheduler.submit(pending(1, ServiceType::Rpc, 0, b"x")).unwrap();
            rx.recv().await.unwrap();

            scheduler.shut_down();
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(scheduler.num_workers(), 0);

            assert!(scheduler.submit(pending(1, ServiceType::Rpc, 0, b"x")).is_err());
        });
    }

    #[test]
    fn test_shut_down_reaches_workers_going_idle() {
        let rt = Builder::new_multi_thread().worker_threads(4).enable_all().build().unwrap();
        rt.block_on(async {
            for _ in 0..50 {
                let (transport, mut rx) = recording_transport();
                let config = ProtocolConfig {
                    min_send_workers: 4,
                    max_send_workers: 4,
                    send_worker_idle_timeout: Duration::from_secs(3600),
                    ..Default::default()
                };
                let scheduler = new_scheduler(config, transport, MockProtocolListener::new(), started_sessions());

                for correlation_id in 0..4 {
                    scheduler.submit(pending(1, ServiceType::Rpc, correlation_id, b"x")).unwrap();
                }
                rx.recv().await.unwrap();

                // workers are still sending or just going idle at this point
                scheduler.shut_down();

                tokio::time::timeout(Duration::from_secs(5), async {
                    while scheduler.num_workers() > 0 {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                }).await
                    .expect("all workers terminate after shutdown");
            }
        });
    }
}
