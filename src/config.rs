use std::time::Duration;
use anyhow::bail;
use crate::frame_header::FrameHeader;

pub struct ProtocolConfig {
    /// The size budget for a complete frame (header and payload) on outbound traffic. Messages
    ///  that do not fit into a single frame are split into First / Consecutive frames of at
    ///  most `mtu` bytes each.
    pub mtu: usize,

    /// Upper bound for the payload length declared by an incoming frame header. A header
    ///  declaring more than this is rejected before any buffer is allocated for it.
    pub max_frame_payload_size: u32,

    /// Upper bound for a message reassembled from First / Consecutive frames
    pub max_message_size: usize,
    /// Upper bound for the number of messages being reassembled at the same time, across all
    ///  sessions. A First frame beyond that is rejected.
    pub max_open_messages: usize,

    /// The protocol version assumed for the header size of incoming frames and for outbound
    ///  control frames until a StartService ACK establishes the negotiated version
    pub initial_protocol_version: u8,

    pub min_send_workers: usize,
    pub max_send_workers: usize,
    /// Workers in excess of `min_send_workers` terminate after being idle for this long
    pub send_worker_idle_timeout: Duration,

    /// number of bytes requested per read in the receive loop
    pub receive_buffer_size: usize,

    //TODO heartbeats are not sent or monitored yet, these are placeholders for the interval config
    pub heartbeat_send_interval: Option<Duration>,
    pub heartbeat_receive_interval: Option<Duration>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            mtu: 1500,
            max_frame_payload_size: 1024*1024,
            max_message_size: 16*1024*1024,
            max_open_messages: 64,
            initial_protocol_version: FrameHeader::PROTOCOL_VERSION_1,
            min_send_workers: 1,
            max_send_workers: 10,
            send_worker_idle_timeout: Duration::from_secs(10),
            receive_buffer_size: 4096,
            heartbeat_send_interval: None,
            heartbeat_receive_interval: None,
        }
    }
}

impl ProtocolConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu <= FrameHeader::SERIALIZED_LEN_V2 {
            bail!("MTU of {} leaves no room for frame payload", self.mtu);
        }
        if (self.max_frame_payload_size as usize) < self.mtu {
            bail!("maximum frame payload size must be at least the MTU");
        }
        if self.max_open_messages == 0 {
            bail!("at least one open message is required for reassembly");
        }
        if self.max_send_workers == 0 {
            bail!("at least one send worker is required");
        }
        if self.min_send_workers > self.max_send_workers {
            bail!("min_send_workers ({}) exceeds max_send_workers ({})", self.min_send_workers, self.max_send_workers);
        }
        if !(1..=15).contains(&self.initial_protocol_version) {
            bail!("protocol version {} does not fit into the version nibble", self.initial_protocol_version);
        }
        if self.receive_buffer_size == 0 {
            bail!("receive buffer size must not be 0");
        }

        Ok(())
    }

    /// The maximum number of payload bytes per outbound frame for a given protocol version
    pub fn max_data_size(&self, version: u8) -> usize {
        self.mtu - FrameHeader::serialized_len(version)
    }
}
