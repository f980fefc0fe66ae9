use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::error::{ProtocolError, ProtocolResult};

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, TryFromPrimitive, IntoPrimitive)]
pub enum RpcType {
    #[default]
    Request = 0,
    Response = 1,
    Notification = 2,
}

/// Binary header at the start of every version 2+ message payload (all numbers BE):
///
/// ```ascii
///  0: RPC type (4 bits) | function id (28 bits)
///  4: correlation id (u32)
///  8: JSON length (u32)
/// 12: JSON bytes, followed by bulk data bytes (the rest of the payload)
/// ```
///
/// JSON data and bulk data are views into the payload buffer, i.e. parsing does not copy.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BinaryFrameHeader {
    pub rpc_type: RpcType,
    pub function_id: u32,
    pub correlation_id: u32,
    pub json_data: Bytes,
    /// everything after the JSON data. An empty bulk segment is indistinguishable from none on
    ///  the wire, so `deser` returns `None` for it.
    pub bulk_data: Option<Bytes>,
}

impl BinaryFrameHeader {
    pub const SERIALIZED_LEN: usize = 12;

    const MASK_FUNCTION_ID: u32 = 0x0fff_ffff;

    pub fn ser(&self, buf: &mut impl BufMut) -> ProtocolResult<()> {
        if self.function_id > Self::MASK_FUNCTION_ID {
            return Err(ProtocolError::InvalidArgument(format!("function id {:#x} does not fit into 28 bits", self.function_id)));
        }
        let json_len = u32::try_from(self.json_data.len())
            .map_err(|_| ProtocolError::MessageTooLarge(self.json_data.len()))?;

        buf.put_u32(((u8::from(self.rpc_type) as u32) << 28) | self.function_id);
        buf.put_u32(self.correlation_id);
        buf.put_u32(json_len);
        buf.put_slice(&self.json_data);
        if let Some(bulk_data) = &self.bulk_data {
            buf.put_slice(bulk_data);
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> ProtocolResult<Bytes> {
        let bulk_len = self.bulk_data.as_ref().map(|b| b.len()).unwrap_or(0);
        let mut buf = BytesMut::with_capacity(Self::SERIALIZED_LEN + self.json_data.len() + bulk_len);
        self.ser(&mut buf)?;
        Ok(buf.freeze())
    }

    pub fn deser(mut payload: Bytes) -> ProtocolResult<BinaryFrameHeader> {
        if payload.len() < Self::SERIALIZED_LEN {
            return Err(ProtocolError::MalformedSubHeader(format!("binary header requires {} bytes, got {}", Self::SERIALIZED_LEN, payload.len())));
        }

        let first = payload.get_u32();
        let raw_rpc_type = (first >> 28) as u8;
        let rpc_type = RpcType::try_from_primitive(raw_rpc_type)
            .map_err(|_| ProtocolError::MalformedSubHeader(format!("unsupported RPC type {}", raw_rpc_type)))?;
        let function_id = first & Self::MASK_FUNCTION_ID;
        let correlation_id = payload.get_u32();
        let json_len = payload.get_u32() as usize;

        if json_len > payload.len() {
            return Err(ProtocolError::MalformedSubHeader(format!("JSON length {} exceeds the remaining payload of {} bytes", json_len, payload.len())));
        }

        let json_data = payload.split_to(json_len);
        let bulk_data = if payload.is_empty() { None } else { Some(payload) };

        Ok(BinaryFrameHeader {
            rpc_type,
            function_id,
            correlation_id,
            json_data,
            bulk_data,
        })
    }
}
