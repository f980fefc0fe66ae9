use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;
use crate::error::{ProtocolError, ProtocolResult};
use crate::frame_header::{FrameHeader, FrameType, ServiceType};
use crate::message_assembler::FIRST_FRAME_PAYLOAD_LEN;

/// A frame ready to be written to the transport
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OutgoingFrame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl OutgoingFrame {
    pub fn control(header: FrameHeader) -> OutgoingFrame {
        OutgoingFrame {
            header,
            payload: Bytes::new(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.header.header_len() + self.payload.len());
        self.header.ser(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Splits a message's payload into frames of at most `max_data_size` payload bytes each.
///
/// A payload that fits goes into a single frame. Otherwise there is a First frame announcing
///  the total size, followed by Consecutive frames with the data; the last of these has frame
///  data [`FrameHeader::LAST_CONSECUTIVE_FRAME`], which is what the receiving side relies on
///  for completion.
pub fn segment_message(
    version: u8,
    service_type: ServiceType,
    session_id: u8,
    message_id: u32,
    payload: Bytes,
    max_data_size: usize,
) -> ProtocolResult<Vec<OutgoingFrame>> {
    if max_data_size < FIRST_FRAME_PAYLOAD_LEN {
        return Err(ProtocolError::InvalidArgument(format!("frame payload size {} is too small for segmentation", max_data_size)));
    }

    let header_len = FrameHeader::serialized_len(version);
    let total_size = u32::try_from(payload.len() + header_len)
        .map_err(|_| ProtocolError::MessageTooLarge(payload.len()))?;

    if payload.len() <= max_data_size {
        trace!("message {} fits into a single frame", message_id);
        let header = FrameHeader::data(version, FrameType::Single, service_type, 0, session_id, message_id, payload.len() as u32);
        return Ok(vec![OutgoingFrame { header, payload }]);
    }

    let frame_count = payload.len().div_ceil(max_data_size);
    trace!("splitting message {} of {} bytes into {} consecutive frames", message_id, payload.len(), frame_count);

    let mut frames = Vec::with_capacity(frame_count + 1);

    let mut first_payload = BytesMut::with_capacity(FIRST_FRAME_PAYLOAD_LEN);
    first_payload.put_u32(total_size);
    first_payload.put_u32(frame_count as u32);
    frames.push(OutgoingFrame {
        header: FrameHeader::data(version, FrameType::First, service_type, 0, session_id, message_id, FIRST_FRAME_PAYLOAD_LEN as u32),
        payload: first_payload.freeze(),
    });

    let mut remaining = payload;
    while !remaining.is_empty() {
        let chunk = remaining.split_to(remaining.len().min(max_data_size));
        let frame_data = if remaining.is_empty() {
            FrameHeader::LAST_CONSECUTIVE_FRAME
        }
        else {
            FrameHeader::MORE_CONSECUTIVE_FRAMES
        };

        frames.push(OutgoingFrame {
            header: FrameHeader::data(version, FrameType::Consecutive, service_type, frame_data, session_id, message_id, chunk.len() as u32),
            payload: chunk,
        });
    }

    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use crate::frame_receiver::FrameReceiver;
    use crate::message_assembler::MessageAssembler;
    use crate::protocol_message::ProtocolMessage;

    fn payload_of_len(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
    }

    #[test]
    fn test_single_frame() {
        let frames = segment_message(1, ServiceType::Rpc, 3, 0, Bytes::from_static(b"abc"), 100).unwrap();
        assert_eq!(frames, vec![OutgoingFrame {
            header: FrameHeader::data(1, FrameType::Single, ServiceType::Rpc, 0, 3, 0, 3),
            payload: Bytes::from_static(b"abc"),
        }]);
    }

    #[test]
    fn test_2000_bytes_with_default_mtu() {
        let max_data_size = 1500 - FrameHeader::SERIALIZED_LEN_V2;
        let frames = segment_message(2, ServiceType::Rpc, 1, 42, payload_of_len(2000), max_data_size).unwrap();

        assert_eq!(frames.len(), 3);

        assert_eq!(frames[0].header.frame_type, FrameType::First);
        assert_eq!(frames[0].payload.to_vec(), vec![0, 0, 0x07, 0xdc, 0, 0, 0, 2]);

        assert_eq!(frames[1].header.frame_type, FrameType::Consecutive);
        assert_eq!(frames[1].header.frame_data, FrameHeader::MORE_CONSECUTIVE_FRAMES);
        assert_eq!(frames[1].payload.len(), 1488);

        assert_eq!(frames[2].header.frame_type, FrameType::Consecutive);
        assert_eq!(frames[2].header.frame_data, FrameHeader::LAST_CONSECUTIVE_FRAME);
        assert_eq!(frames[2].payload.len(), 512);

        assert!(frames.iter().all(|f| f.header.message_id == 42 && f.header.session_id == 1));
    }

    #[test]
    fn test_encode() {
        let frame = OutgoingFrame {
            header: FrameHeader::data(1, FrameType::Single, ServiceType::Nav, 0, 2, 0, 2),
            payload: Bytes::from_static(&[9, 8]),
        };
        assert_eq!(frame.encode().to_vec(), vec![0x11, 0x0b, 0, 2, 0, 0, 0, 2, 9, 8]);
    }

    #[test]
    fn test_max_data_size_too_small() {
        assert!(matches!(
            segment_message(2, ServiceType::Rpc, 1, 1, payload_of_len(100), 4),
            Err(ProtocolError::InvalidArgument(_))
        ));
    }

    fn reassemble(version: u8, frames: &[OutgoingFrame]) -> Vec<ProtocolMessage> {
        let mut receiver = FrameReceiver::new(version, 1024*1024);
        let mut assembler = MessageAssembler::new(1024*1024, 4);
        let mut messages = Vec::new();
        for frame in frames {
            for received in receiver.push(&frame.encode()) {
                let received = received.unwrap();
                if let Some(message) = assembler.on_data_frame(&received.header, received.payload).unwrap() {
                    messages.push(message);
                }
            }
        }
        assert_eq!(assembler.num_open_messages(), 0);
        messages
    }

    #[rstest]
    #[case::empty(0, 10)]
    #[case::below_budget(9, 10)]
    #[case::exactly_budget(10, 10)]
    #[case::one_above_budget(11, 10)]
    #[case::two_frames_exactly(20, 10)]
    #[case::many_frames(1000, 64)]
    fn test_segment_then_reassemble(#[case] len: usize, #[case] max_data_size: usize) {
        let payload = payload_of_len(len);
        let frames = segment_message(1, ServiceType::Bulk, 5, 0, payload.clone(), max_data_size).unwrap();

        if len <= max_data_size {
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].header.frame_type, FrameType::Single);
        }
        else {
            assert_eq!(frames.len(), 1 + len.div_ceil(max_data_size));
            assert!(frames.iter().all(|f| f.payload.len() <= max_data_size));
        }

        let messages = reassemble(1, &frames);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].data, payload);
    }

    #[rstest]
    #[case::single(100)]
    #[case::exactly_budget(1488 - 12 - 4)]
    #[case::one_above_budget(1488 - 12 - 3)]
    #[case::several_frames(5000)]
    fn test_segment_then_reassemble_v2(#[case] json_len: usize) {
        let mut message = ProtocolMessage::rpc(5, 12, 99, payload_of_len(json_len));
        message.bulk_data = Some(Bytes::from_static(b"bulk"));
        let payload = message.to_frame_payload(2).unwrap();

        let frames = segment_message(2, ServiceType::Bulk, 5, 7, payload, 1488).unwrap();
        let messages = reassemble(2, &frames);

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].data, message.data);
        assert_eq!(messages[0].bulk_data, message.bulk_data);
        assert_eq!(messages[0].correlation_id, 99);
        assert_eq!(messages[0].function_id, 12);
    }
}
