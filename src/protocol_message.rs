use bytes::Bytes;
use crate::binary_header::{BinaryFrameHeader, RpcType};
use crate::error::ProtocolResult;
use crate::frame_header::{FrameHeader, ServiceType};

/// Application-level message, i.e. the unit delivered to and accepted from the outer layer. It
///  may span any number of frames on the wire.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProtocolMessage {
    pub version: u8,
    pub service_type: ServiceType,
    pub session_id: u8,
    pub rpc_type: RpcType,
    pub function_id: u32,
    pub correlation_id: u32,
    /// JSON for version 2+, the raw payload for version 1
    pub data: Bytes,
    /// `Some` only for non-empty bulk data, see [`ProtocolMessage::with_bulk_data`]
    pub bulk_data: Option<Bytes>,
}

impl ProtocolMessage {
    /// well-known function id of `UnregisterAppInterface`
    pub const FUNCTION_ID_UNREGISTER_APP_INTERFACE: u32 = 2;

    pub fn rpc(session_id: u8, function_id: u32, correlation_id: u32, json: impl Into<Bytes>) -> ProtocolMessage {
        ProtocolMessage {
            version: FrameHeader::PROTOCOL_VERSION_2,
            service_type: ServiceType::Rpc,
            session_id,
            rpc_type: RpcType::Request,
            function_id,
            correlation_id,
            data: json.into(),
            bulk_data: None,
        }
    }

    /// Attaches bulk data. Empty bulk data is the same as none, both on the wire and for
    ///  routing.
    pub fn with_bulk_data(mut self, bulk_data: impl Into<Bytes>) -> ProtocolMessage {
        let bulk_data = bulk_data.into();
        self.bulk_data = if bulk_data.is_empty() { None } else { Some(bulk_data) };
        self
    }

    fn has_bulk_data(&self) -> bool {
        self.bulk_data.as_ref().is_some_and(|b| !b.is_empty())
    }

    /// Builds a message from the (reassembled) payload of a data frame, decoding the binary
    ///  header for version 2+
    pub fn from_frame_payload(header: &FrameHeader, payload: Bytes) -> ProtocolResult<ProtocolMessage> {
        if header.version >= FrameHeader::PROTOCOL_VERSION_2 {
            let binary_header = BinaryFrameHeader::deser(payload)?;
            Ok(ProtocolMessage {
                version: header.version,
                service_type: header.service_type,
                session_id: header.session_id,
                rpc_type: binary_header.rpc_type,
                function_id: binary_header.function_id,
                correlation_id: binary_header.correlation_id,
                data: binary_header.json_data,
                bulk_data: binary_header.bulk_data,
            })
        }
        else {
            Ok(ProtocolMessage {
                version: header.version,
                service_type: header.service_type,
                session_id: header.session_id,
                rpc_type: RpcType::Request,
                function_id: 0,
                correlation_id: 0,
                data: payload,
                bulk_data: None,
            })
        }
    }

    /// The service the message travels on: RPC messages carrying bulk data go to the bulk
    ///  service
    pub fn outbound_service_type(&self) -> ServiceType {
        match self.service_type {
            ServiceType::Rpc if self.has_bulk_data() => ServiceType::Bulk,
            service_type => service_type,
        }
    }

    /// The bytes to segment into frames for the given protocol version
    pub fn to_frame_payload(&self, version: u8) -> ProtocolResult<Bytes> {
        if version >= FrameHeader::PROTOCOL_VERSION_2 {
            BinaryFrameHeader {
                rpc_type: self.rpc_type,
                function_id: self.function_id,
                correlation_id: self.correlation_id,
                json_data: self.data.clone(),
                bulk_data: self.bulk_data.clone(),
            }.to_bytes()
        }
        else {
            Ok(self.data.clone())
        }
    }

    pub fn is_unregister_response(&self) -> bool {
        self.rpc_type == RpcType::Response && self.function_id == Self::FUNCTION_ID_UNREGISTER_APP_INTERFACE
    }
}
