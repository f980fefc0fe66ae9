use std::cmp::min;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace, warn};
use crate::error::ProtocolResult;
use crate::frame_header::FrameHeader;

/// A complete frame as cut from the incoming byte stream
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReceivedFrame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

#[derive(Debug, Eq, PartialEq)]
enum ReceiveState {
    /// collecting header bytes in `header_buf`
    Header,
    Payload { header: FrameHeader, payload: BytesMut },
    /// skipping the payload of a frame whose header was rejected
    Discard { remaining: usize },
}

/// Cuts a byte stream that arrives in arbitrarily sized chunks into frames. State (partial
///  header, partial payload) survives between calls to [`FrameReceiver::push`], so a frame may
///  be spread across any number of chunks and a chunk may contain any number of frames.
///
/// Header size follows the version nibble of each frame's first byte. The receiver adopts
///  that version as its current version, i.e. a version change takes effect at a frame
///  boundary and never in the middle of a header.
pub struct FrameReceiver {
    version: u8,
    max_frame_payload_size: u32,
    header_buf: BytesMut,
    state: ReceiveState,
}

impl FrameReceiver {
    pub fn new(initial_version: u8, max_frame_payload_size: u32) -> FrameReceiver {
        FrameReceiver {
            version: initial_version,
            max_frame_payload_size,
            header_buf: BytesMut::with_capacity(FrameHeader::SERIALIZED_LEN_V2),
            state: ReceiveState::Header,
        }
    }

    pub fn protocol_version(&self) -> u8 {
        self.version
    }

    /// true iff no partial frame is buffered, i.e. the next byte is expected to start a header
    pub fn is_idle(&self) -> bool {
        self.header_buf.is_empty() && self.state == ReceiveState::Header
    }

    /// Consumes a chunk of bytes, returning all frames completed by it in stream order. A
    ///  malformed header shows up as an `Err` entry in place of its frame; it does not affect
    ///  frames before or after it.
    pub fn push(&mut self, mut chunk: &[u8]) -> Vec<ProtocolResult<ReceivedFrame>> {
        let mut result = Vec::new();

        while !chunk.is_empty() {
            match std::mem::replace(&mut self.state, ReceiveState::Header) {
                ReceiveState::Header => {
                    if let Some(frame) = self.consume_header_bytes(&mut chunk) {
                        result.push(frame);
                    }
                }
                ReceiveState::Payload { header, mut payload } => {
                    let declared_len = header.data_size as usize;
                    let slice_len = min(declared_len - payload.len(), chunk.len());
                    payload.put_slice(&chunk[..slice_len]);
                    chunk = &chunk[slice_len..];

                    if payload.len() == declared_len {
                        trace!("received frame {:?}", header);
                        result.push(Ok(ReceivedFrame {
                            header,
                            payload: payload.freeze(),
                        }));
                    }
                    else {
                        self.state = ReceiveState::Payload { header, payload };
                    }
                }
                ReceiveState::Discard { remaining } => {
                    let slice_len = min(remaining, chunk.len());
                    chunk = &chunk[slice_len..];
                    if remaining > slice_len {
                        self.state = ReceiveState::Discard { remaining: remaining - slice_len };
                    }
                    else {
                        debug!("finished skipping payload of rejected frame");
                    }
                }
            }
        }

        result
    }

    /// called in header state with a non-empty chunk
    fn consume_header_bytes(&mut self, chunk: &mut &[u8]) -> Option<ProtocolResult<ReceivedFrame>> {
        if self.header_buf.is_empty() {
            let announced_version = FrameHeader::version_from_first_byte(chunk[0]);
            if announced_version != 0 && announced_version != self.version {
                debug!("protocol version changed from {} to {}", self.version, announced_version);
                self.version = announced_version;
            }
        }

        let header_len = FrameHeader::serialized_len(self.version);
        let slice_len = min(header_len - self.header_buf.len(), chunk.len());
        self.header_buf.put_slice(&chunk[..slice_len]);
        *chunk = &chunk[slice_len..];

        if self.header_buf.len() < header_len {
            trace!("incomplete header: {} of {} bytes", self.header_buf.len(), header_len);
            return None;
        }

        let parsed = FrameHeader::deser(&mut &self.header_buf[..]);

        let header = match parsed {
            Ok(header) => header,
            Err(e) => {
                // the payload length is readable even if the rest is not, so the frame's payload
                //  can be skipped along with its header
                match FrameHeader::peek_data_size(&self.header_buf) {
                    Some(data_size) if data_size > 0 => {
                        warn!("unparseable frame header, skipping it and its {} byte payload: {}", data_size, e);
                        self.state = ReceiveState::Discard { remaining: data_size as usize };
                    }
                    _ => warn!("unparseable frame header - dropping: {}", e),
                }
                self.header_buf.clear();
                return Some(Err(e));
            }
        };
        self.header_buf.clear();

        if let Err(e) = header.validate(self.max_frame_payload_size) {
            warn!("rejecting frame {:?}, skipping its payload: {}", header, e);
            if header.data_size > 0 {
                self.state = ReceiveState::Discard { remaining: header.data_size as usize };
            }
            return Some(Err(e));
        }

        if header.data_size == 0 {
            trace!("received frame {:?}", header);
            return Some(Ok(ReceivedFrame {
                header,
                payload: Bytes::new(),
            }));
        }

        self.state = ReceiveState::Payload {
            payload: BytesMut::with_capacity(header.data_size as usize),
            header,
        };
        None
    }
}
