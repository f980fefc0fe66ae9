use bitflags::bitflags;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::Debug;
use crate::error::{ProtocolError, ProtocolResult};

bitflags! {
    #[derive(PartialEq, Eq, Copy, Clone)]
    struct Flags: u8 {
        const MASK_VERSION    = 0b1111_0000;
        const COMPRESSED      = 0b0000_1000;
        const MASK_FRAME_TYPE = 0b0000_0111;
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum FrameType {
    Control = 0x00,
    Single = 0x01,
    First = 0x02,
    Consecutive = 0x03,
}

/// The channel a frame belongs to. The numeric value doubles as send priority: lower values
///  are dispatched first.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, TryFromPrimitive, IntoPrimitive)]
pub enum ServiceType {
    Control = 0x00,
    Rpc = 0x07,
    Audio = 0x0A,
    Nav = 0x0B,
    Bulk = 0x0F,
}

/// Sub-type of a control frame, transmitted in the frame data byte
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum ControlFrameType {
    Heartbeat = 0x00,
    StartService = 0x01,
    StartServiceAck = 0x02,
    StartServiceNack = 0x03,
    EndService = 0x04,
    EndServiceAck = 0x05,
    EndServiceNack = 0x06,
    NavAck = 0xFE,
    HeartbeatAck = 0xFF,
}

/// Fixed-size frame header. The layout depends on the protocol version (all numbers BE):
///
/// ```ascii
/// 0: version (high nibble) | compression flag (bit 3) | frame type (bits 0-2)
/// 1: service type
/// 2: frame data - control sub-type for control frames, 0 for the last consecutive frame
/// 3: session id
/// 4: payload length (u32)
/// 8: message id (u32) - version 2 and above only
/// ```
#[derive(Clone, Eq, PartialEq)]
pub struct FrameHeader {
    pub version: u8,
    pub compressed: bool,
    pub frame_type: FrameType,
    pub service_type: ServiceType,
    pub frame_data: u8,
    pub session_id: u8,
    pub data_size: u32,
    /// always 0 for version 1 where it is not on the wire
    pub message_id: u32,
}
impl Debug for FrameHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FRAME{{V{}:{:?}/{:?}#{}@{}:{}[{}]}}",
               self.version,
               self.frame_type,
               self.service_type,
               self.frame_data,
               self.session_id,
               self.message_id,
               self.data_size,
        )
    }
}

impl FrameHeader {
    pub const PROTOCOL_VERSION_1: u8 = 1;
    pub const PROTOCOL_VERSION_2: u8 = 2;

    pub const SERIALIZED_LEN_V1: usize = 8;
    pub const SERIALIZED_LEN_V2: usize = 12;

    /// frame data of the consecutive frame that terminates a message
    pub const LAST_CONSECUTIVE_FRAME: u8 = 0;
    /// frame data of all other consecutive frames
    pub const MORE_CONSECUTIVE_FRAMES: u8 = 1;

    pub fn serialized_len(version: u8) -> usize {
        if version >= Self::PROTOCOL_VERSION_2 {
            Self::SERIALIZED_LEN_V2
        }
        else {
            Self::SERIALIZED_LEN_V1
        }
    }

    /// The version announced by a header's first byte - this is available before the rest of
    ///  the header, which is what allows sizing the header
    pub fn version_from_first_byte(first_byte: u8) -> u8 {
        (Flags::from_bits_truncate(first_byte) & Flags::MASK_VERSION).bits() >> 4
    }

    /// Reads the declared payload length from raw header bytes without parsing the rest. The
    ///  length is at the same offset for all frame and service types, so this works for headers
    ///  that [`FrameHeader::deser`] rejects. A version 0 header has no known layout, so there is
    ///  no length for it.
    pub fn peek_data_size(raw: &[u8]) -> Option<u32> {
        if Self::version_from_first_byte(*raw.first()?) == 0 {
            return None;
        }
        raw.get(4..8).map(|mut b| b.get_u32())
    }

    pub fn control(version: u8, service_type: ServiceType, session_id: u8, control_frame_type: ControlFrameType, message_id: u32, data_size: u32) -> FrameHeader {
        FrameHeader {
            version,
            compressed: false,
            frame_type: FrameType::Control,
            service_type,
            frame_data: control_frame_type.into(),
            session_id,
            data_size,
            message_id: Self::message_id_for_version(version, message_id),
        }
    }

    pub fn data(version: u8, frame_type: FrameType, service_type: ServiceType, frame_data: u8, session_id: u8, message_id: u32, data_size: u32) -> FrameHeader {
        FrameHeader {
            version,
            compressed: false,
            frame_type,
            service_type,
            frame_data,
            session_id,
            data_size,
            message_id: Self::message_id_for_version(version, message_id),
        }
    }

    fn message_id_for_version(version: u8, message_id: u32) -> u32 {
        if version >= Self::PROTOCOL_VERSION_2 { message_id } else { 0 }
    }

    pub fn header_len(&self) -> usize {
        Self::serialized_len(self.version)
    }

    pub fn control_frame_type(&self) -> Option<ControlFrameType> {
        if self.frame_type != FrameType::Control {
            return None;
        }
        ControlFrameType::try_from_primitive(self.frame_data).ok()
    }

    pub fn is_last_consecutive(&self) -> bool {
        self.frame_type == FrameType::Consecutive && self.frame_data == Self::LAST_CONSECUTIVE_FRAME
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        let mut flags = Flags::from_bits_truncate(self.version << 4) & Flags::MASK_VERSION;
        flags.set(Flags::COMPRESSED, self.compressed);
        flags |= Flags::from_bits_truncate(self.frame_type.into()) & Flags::MASK_FRAME_TYPE;

        buf.put_u8(flags.bits());
        buf.put_u8(self.service_type.into());
        buf.put_u8(self.frame_data);
        buf.put_u8(self.session_id);
        buf.put_u32(self.data_size);

        if self.version >= Self::PROTOCOL_VERSION_2 {
            buf.put_u32(self.message_id);
        }
    }

    /// Parses a header, taking the layout from the version nibble of its first byte. This does
    ///  *not* check the declared payload length, see [`FrameHeader::validate`].
    pub fn deser(buf: &mut impl Buf) -> ProtocolResult<FrameHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN_V1 {
            return Err(ProtocolError::MalformedHeader(format!("header requires at least {} bytes, got {}", Self::SERIALIZED_LEN_V1, buf.remaining())));
        }

        let flags = Flags::from_bits_truncate(buf.get_u8());
        let version = (flags & Flags::MASK_VERSION).bits() >> 4;
        if version == 0 {
            return Err(ProtocolError::MalformedHeader("protocol version 0".to_string()));
        }
        let compressed = flags.contains(Flags::COMPRESSED);
        let frame_type = FrameType::try_from_primitive((flags & Flags::MASK_FRAME_TYPE).bits())
            .map_err(|e| ProtocolError::MalformedHeader(format!("unsupported frame type {}", e.number)))?;

        let raw_service_type = buf.get_u8();
        let service_type = ServiceType::try_from_primitive(raw_service_type)
            .map_err(|_| ProtocolError::MalformedHeader(format!("unsupported service type {:#04x}", raw_service_type)))?;

        let frame_data = buf.get_u8();
        let session_id = buf.get_u8();
        let data_size = buf.get_u32();

        let message_id = if version >= Self::PROTOCOL_VERSION_2 {
            if buf.remaining() < size_of::<u32>() {
                return Err(ProtocolError::MalformedHeader(format!("version {} header requires {} bytes", version, Self::SERIALIZED_LEN_V2)));
            }
            buf.get_u32()
        }
        else {
            0
        };

        Ok(FrameHeader {
            version,
            compressed,
            frame_type,
            service_type,
            frame_data,
            session_id,
            data_size,
            message_id,
        })
    }

    /// Checks the declared payload length against the configured ceiling. This must pass
    ///  before any buffer is allocated for the payload.
    pub fn validate(&self, max_frame_payload_size: u32) -> ProtocolResult<()> {
        if self.data_size > max_frame_payload_size {
            return Err(ProtocolError::MalformedHeader(format!(
                "declared payload of {} bytes exceeds the maximum of {}",
                self.data_size, max_frame_payload_size
            )));
        }
        Ok(())
    }
}
