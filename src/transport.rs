use std::sync::Arc;
use anyhow::Context;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{error, trace};
use crate::error::{ProtocolError, ProtocolResult};
use crate::frame_segmenter::OutgoingFrame;

/// This is an abstraction for writing a single encoded frame to the underlying connection,
///  introduced to decouple the engine from the concrete stream and to facilitate mocking the
///  I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FrameTransport: Send + Sync + 'static {
    async fn send_frame(&self, frame: &[u8]) -> anyhow::Result<()>;
}

#[async_trait]
impl <W: AsyncWrite + Unpin + Send + 'static> FrameTransport for Mutex<W> {
    async fn send_frame(&self, frame: &[u8]) -> anyhow::Result<()> {
        trace!("writing {} bytes", frame.len());

        let mut writer = self.lock().await;
        writer.write_all(frame).await
            .context("writing frame")?;
        writer.flush().await
            .context("flushing frame")?;
        Ok(())
    }
}

/// Serializes frame writes: all frames of one message are written while holding the write
///  lock, so frames of different messages are never interleaved on the wire.
pub struct FramePipeline {
    transport: Arc<dyn FrameTransport>,
    write_lock: Mutex<()>,
}

impl FramePipeline {
    pub fn new(transport: Arc<dyn FrameTransport>) -> FramePipeline {
        FramePipeline {
            transport,
            write_lock: Mutex::new(()),
        }
    }

    /// Writes frames in the given order, stopping at the first failure
    pub async fn send_frames(&self, frames: &[OutgoingFrame]) -> ProtocolResult<()> {
        let _guard = self.write_lock.lock().await;

        for frame in frames {
            trace!("sending {:?}", frame.header);
            if let Err(e) = self.transport.send_frame(&frame.encode()).await {
                error!("error sending frame {:?}: {:#}", frame.header, e);
                return Err(ProtocolError::Transport(e));
            }
        }
        Ok(())
    }

    pub async fn send_frame(&self, frame: &OutgoingFrame) -> ProtocolResult<()> {
        self.send_frames(std::slice::from_ref(frame)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mockall::predicate::eq;
    use mockall::Sequence;
    use tokio::io::AsyncReadExt;
    use tokio::runtime::Builder;
    use crate::frame_header::{ControlFrameType, FrameHeader, ServiceType};

    fn control_frame(session_id: u8) -> OutgoingFrame {
        OutgoingFrame {
            header: FrameHeader::control(2, ServiceType::Rpc, session_id, ControlFrameType::StartService, 0, 0),
            payload: Bytes::new(),
        }
    }

    #[test]
    fn test_mutex_writer_transport() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (client, mut server) = tokio::io::duplex(64);
            let transport = Mutex::new(client);

            transport.send_frame(&[1, 2, 3]).await.unwrap();
            transport.send_frame(&[4]).await.unwrap();

            let mut buf = [0u8; 4];
            server.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, [1, 2, 3, 4]);
        });
    }

    #[test]
    fn test_send_frames_in_order() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let frames = vec![control_frame(1), control_frame(2), control_frame(3)];

            let mut transport = MockFrameTransport::new();
            let mut seq = Sequence::new();
            for frame in &frames {
                transport.expect_send_frame()
                    .with(eq(frame.encode().to_vec()))
                    .once()
                    .in_sequence(&mut seq)
                    .returning(|_| Ok(()));
            }

            let pipeline = FramePipeline::new(Arc::new(transport));
            pipeline.send_frames(&frames).await.unwrap();
        });
    }

    #[test]
    fn test_send_frames_stops_at_failure() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut transport = MockFrameTransport::new();
            transport.expect_send_frame()
                .once()
                .returning(|_| Err(anyhow::anyhow!("connection reset")));

            let pipeline = FramePipeline::new(Arc::new(transport));
            let result = pipeline.send_frames(&[control_frame(1), control_frame(2)]).await;
            assert!(matches!(result, Err(ProtocolError::Transport(_))));
        });
    }
}
