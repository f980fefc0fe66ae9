//! Wire protocol engine for a head-unit connection: it frames, multiplexes and reassembles
//!  application messages exchanged with a vehicle head unit over a single byte stream, and
//!  tracks the sessions and services opened on that stream.
//!
//! ## Design
//!
//! * The engine does not own the connection. Received bytes are pushed in by the caller (or by
//!   a receive loop over any `AsyncRead`), and encoded frames are written through a
//!   [`transport::FrameTransport`]. Everything the engine has to report goes to a
//!   [`listener::ProtocolListener`].
//! * Bytes arrive in arbitrary chunks. Frame and message boundaries are recovered from the
//!   headers, independent of how the stream happens to be chunked
//! * A message can be sent only after the peer acknowledged the session's service
//!   (StartService ACK), and sending before that fails immediately
//! * Outbound messages are queued by priority (service type, then correlation id) and written
//!   by a pool of workers. Frames of one message are always contiguous on the wire, but
//!   messages may overtake each other
//! * Malformed input is reported and skipped, it never terminates the engine
//!
//! ## Frame header
//!
//! All numbers in network byte order (BE):
//!
//! ```ascii
//! 0: flags (8 bits):
//!    * bit 4-7: protocol version
//!    * bit 3:   compression flag
//!    * bit 0-2: frame type:
//!      * 000 control
//!      * 001 single - a message that fits into one frame
//!      * 010 first - announces a message split across several frames
//!      * 011 consecutive - a part of a split message
//! 1: service type (u8): 0x00 control, 0x07 RPC, 0x0A audio, 0x0B navigation, 0x0F bulk
//! 2: frame data (u8): control frame sub-type, or for consecutive frames 0 if this is the
//!     last frame of the message and 1 otherwise
//! 3: session id (u8)
//! 4: payload length (u32)
//! 8: message id (u32) - protocol version 2 and above only
//! ```
//!
//! The header is 8 bytes for version 1 and 12 bytes for all later versions. The version nibble
//!  is part of the first byte, so the header size is known after a single byte.
//!
//! ## Split messages
//!
//! A message that does not fit into a single frame (MTU minus header) is sent as a *first*
//!  frame followed by any number of *consecutive* frames, all with the same message id:
//!
//! ```ascii
//! 0: total size (u32) - message length plus header length
//! 4: frame count (u32) - the number of consecutive frames; informational only
//! ```
//!
//! The receiver treats the consecutive frame with frame data 0 as the end of the message, the
//!  frame count is not used for that.
//!
//! ## Message payload
//!
//! For version 2 and above, a message's payload starts with a binary header:
//!
//! ```ascii
//!  0: RPC type (4 bits - 0 request, 1 response, 2 notification) | function id (28 bits)
//!  4: correlation id (u32)
//!  8: JSON length (u32)
//! 12: JSON data, followed by bulk data (the rest of the payload)
//! ```
//!
//! Version 1 payloads are the raw JSON.
//!
//! ## Control frames
//!
//! Control frames carry their sub-type in the frame data byte:
//!
//! ```ascii
//! 0x00 heartbeat
//! 0x01 start service           0x02 ACK     0x03 NACK
//! 0x04 end service             0x05 ACK     0x06 NACK
//! 0xFE navigation frame ACK
//! 0xFF heartbeat ACK
//! ```
//!
//! For version 2 and above, a start service ACK's message id is the service's correlation
//!  token. End service requests carry it as their message id (and as a 4-byte payload), and
//!  an end service (ACK) from the peer is accepted only if its message id matches.

pub mod binary_header;
pub mod config;
mod control_frames;
pub mod engine;
pub mod error;
pub mod frame_header;
pub mod frame_receiver;
pub mod frame_segmenter;
pub mod listener;
pub mod message_assembler;
pub mod protocol_message;
pub mod send_scheduler;
pub mod session_registry;
pub mod transport;
