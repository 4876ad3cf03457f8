//! Wire protocol framing and encoding/decoding for the push client.
//!
//! This crate implements the MQTT-derived frame format spoken with the push
//! broker: fixed header processing, packet encoding and decoding, and zlib
//! handling for compressed payloads.
//!
//! ## Features
//!
//! - **Incremental Decoding**: `PacketDecoder` tolerates arbitrarily short reads
//! - **Zero-Copy I/O**: Uses `Bytes`/`BytesMut` for minimal allocations
//! - **Transparent Inflation**: Deflated publish payloads are inflated on decode
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u8 type | flags      | upper nibble type tag      |
//! +----------------------+----------------------------+
//! | remaining length     | base-128, 1..4 bytes       |
//! +----------------------+----------------------------+
//! | variable header      | per packet type            |
//! +----------------------+----------------------------+
//! | payload              | variable (0..N)            |
//! +----------------------+----------------------------+
//! ```
//!
//! Publish frames carry a one-byte topic id, then a u16 packet id when the
//! QoS requires acknowledgment, then the payload.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod compression;
pub mod error;
pub mod header;
pub mod packet;

// Re-export main types
pub use codec::{decode, encode, PacketDecoder, DEFAULT_MAX_PACKET_SIZE};
pub use compression::{compress, is_zlib, maybe_decompress};
pub use error::WireError;
pub use header::{
    ConnectFlags, FixedHeader, PacketType, PublishFlags, MAX_REMAINING_LENGTH,
    PACKET_HEADER_LENGTH,
};
pub use packet::{
    ConnAckPacket, ConnectPacket, ConnectReturnCode, Packet, PubAckPacket, PublishPacket,
    PushTopic, QualityOfService, PROTOCOL_LEVEL, PROTOCOL_NAME,
};
