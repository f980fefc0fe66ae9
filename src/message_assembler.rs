use bytes::{Buf, BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};
use crate::error::{ProtocolError, ProtocolResult};
use crate::frame_header::{FrameHeader, FrameType, ServiceType};
use crate::protocol_message::ProtocolMessage;

/// Payload of a First frame (all numbers BE):
///
/// ```ascii
/// 0: total size, i.e. message length plus the frame header length (u32)
/// 4: number of frames (u32) - a hint, completion is signalled by the terminal Consecutive frame
/// ```
pub const FIRST_FRAME_PAYLOAD_LEN: usize = 8;

/// Buffer capacity reserved up front for a message, no matter how large its First frame
///  declares it to be. The buffer grows as Consecutive frames arrive.
const MAX_INITIAL_CAPACITY: usize = 64*1024;

/// Reassembly key. Message ids are unique only within a session, and version 1 headers carry
///  no message id at all, so the session and service are part of the key.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
struct MessageKey {
    session_id: u8,
    service_type: ServiceType,
    message_id: u32,
}
impl MessageKey {
    fn of(header: &FrameHeader) -> MessageKey {
        MessageKey {
            session_id: header.session_id,
            service_type: header.service_type,
            message_id: header.message_id,
        }
    }
}

struct PartialMessage {
    /// the First frame's header - version, service and session of the completed message are
    ///  taken from here
    header: FrameHeader,
    declared_size: usize,
    frame_count_hint: u32,
    num_consecutive_frames: u32,
    buf: BytesMut,
}

/// Turns data frames (Single / First / Consecutive) into application messages. Any number of
///  messages can be in flight at the same time, with their Consecutive frames interleaved on
///  the wire.
pub struct MessageAssembler {
    max_message_size: usize,
    max_open_messages: usize,
    open_messages: FxHashMap<MessageKey, PartialMessage>,
}

impl MessageAssembler {
    pub fn new(max_message_size: usize, max_open_messages: usize) -> MessageAssembler {
        MessageAssembler {
            max_message_size,
            max_open_messages,
            open_messages: Default::default(),
        }
    }

    pub fn num_open_messages(&self) -> usize {
        self.open_messages.len()
    }

    /// Returns the completed message if this frame completes one. Errors affect only the
    ///  message the frame belongs to.
    pub fn on_data_frame(&mut self, header: &FrameHeader, payload: Bytes) -> ProtocolResult<Option<ProtocolMessage>> {
        match header.frame_type {
            FrameType::Single => {
                ProtocolMessage::from_frame_payload(header, payload)
                    .map(Some)
            }
            FrameType::First => {
                self.on_first_frame(header, payload)?;
                Ok(None)
            }
            FrameType::Consecutive => {
                self.on_consecutive_frame(header, payload)
            }
            FrameType::Control => {
                Err(ProtocolError::MalformedFrame(format!("control frame {:?} passed to message reassembly", header)))
            }
        }
    }

    fn on_first_frame(&mut self, header: &FrameHeader, mut payload: Bytes) -> ProtocolResult<()> {
        if payload.len() < FIRST_FRAME_PAYLOAD_LEN {
            return Err(ProtocolError::MalformedFrame(format!("first frame payload has {} bytes, expected {}", payload.len(), FIRST_FRAME_PAYLOAD_LEN)));
        }
        let total_size = payload.get_u32() as usize;
        let frame_count_hint = payload.get_u32();
        let declared_size = total_size.saturating_sub(header.header_len());

        if declared_size > self.max_message_size {
            return Err(ProtocolError::MalformedFrame(format!("declared message size {} exceeds the maximum of {}", declared_size, self.max_message_size)));
        }

        let key = MessageKey::of(header);
        if self.open_messages.len() >= self.max_open_messages && !self.open_messages.contains_key(&key) {
            return Err(ProtocolError::MalformedFrame(format!("first frame {:?} exceeds the maximum of {} messages in reassembly", header, self.max_open_messages)));
        }

        debug!("opening message {:?}: {} bytes in {} frames", header, declared_size, frame_count_hint);

        let previous = self.open_messages.insert(key, PartialMessage {
            header: header.clone(),
            declared_size,
            frame_count_hint,
            num_consecutive_frames: 0,
            buf: BytesMut::with_capacity(declared_size.min(MAX_INITIAL_CAPACITY)),
        });
        if let Some(previous) = previous {
            warn!("first frame for {:?} while a message with the same id was open - discarding {} buffered bytes", key, previous.buf.len());
        }
        Ok(())
    }

    fn on_consecutive_frame(&mut self, header: &FrameHeader, payload: Bytes) -> ProtocolResult<Option<ProtocolMessage>> {
        let key = MessageKey::of(header);

        let partial = match self.open_messages.get_mut(&key) {
            Some(partial) => partial,
            None => {
                return Err(ProtocolError::MalformedFrame(format!("consecutive frame {:?} without a preceding first frame", header)));
            }
        };

        if partial.buf.len() + payload.len() > self.max_message_size {
            let buffered = partial.buf.len();
            self.open_messages.remove(&key);
            return Err(ProtocolError::MalformedFrame(format!("message {:?} exceeds the maximum size of {} bytes ({} buffered, {} more received)", key, self.max_message_size, buffered, payload.len())));
        }

        partial.buf.put_slice(&payload);
        partial.num_consecutive_frames += 1;
        trace!("message {:?}: {} of {} bytes", key, partial.buf.len(), partial.declared_size);

        if !header.is_last_consecutive() {
            return Ok(None);
        }

        let Some(partial) = self.open_messages.remove(&key)
        else {
            return Ok(None);
        };

        if partial.buf.len() != partial.declared_size {
            warn!("message {:?} completed with {} bytes, first frame declared {}", key, partial.buf.len(), partial.declared_size);
        }
        if partial.num_consecutive_frames + 1 != partial.frame_count_hint {
            debug!("message {:?} completed after {} consecutive frames, first frame announced {} frames", key, partial.num_consecutive_frames, partial.frame_count_hint);
        }

        ProtocolMessage::from_frame_payload(&partial.header, partial.buf.freeze())
            .map(Some)
    }

    /// Discards all partially received messages of a session
    pub fn discard_session(&mut self, session_id: u8) {
        let before = self.open_messages.len();
        self.open_messages.retain(|key, _| key.session_id != session_id);
        let num_discarded = before - self.open_messages.len();
        if num_discarded > 0 {
            debug!("discarded {} partial messages of session {}", num_discarded, session_id);
        }
    }
}
