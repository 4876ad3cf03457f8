//! Encoding and decoding of push protocol frames.
//!
//! All multi-byte integers are big-endian. Strings are u16-length-prefixed
//! UTF-8. The decoder is incremental: it is fed whatever the socket returned
//! and yields a packet only once the frame's declared length is buffered.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::compression::maybe_decompress;
use crate::header::{
    encode_remaining_length, remaining_length_size, ConnectFlags, FixedHeader, PacketType,
    PublishFlags,
};
use crate::packet::{
    ConnAckPacket, ConnectPacket, ConnectReturnCode, Packet, PubAckPacket, PublishPacket,
    PushTopic, QualityOfService,
};
use crate::WireError;

/// Default maximum frame size accepted by the decoder (16 MiB)
pub const DEFAULT_MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Encode a packet to a contiguous buffer
pub fn encode(packet: &Packet) -> Result<Bytes, WireError> {
    let mut body = BytesMut::new();
    let flags = match packet {
        Packet::Connect(connect) => {
            put_string(&mut body, &connect.protocol_name)?;
            body.put_u8(connect.protocol_level);
            body.put_u8(connect.flags.bits());
            body.put_u16(connect.keep_alive_secs);
            body.put_slice(&connect.payload);
            0
        }
        Packet::ConnAck(connack) => {
            body.put_u8(connack.ack_flags);
            body.put_u8(connack.return_code.code());
            if let Some(ref auth) = connack.authentication {
                put_string(&mut body, auth)?;
            }
            0
        }
        Packet::Publish(publish) => {
            let mut flags = PublishFlags::empty();
            if publish.retain {
                flags |= PublishFlags::RETAIN;
            }
            if publish.dup {
                flags |= PublishFlags::DUP;
            }
            body.put_u8(publish.topic.id());
            if publish.qos == QualityOfService::AtLeastOnce {
                flags |= PublishFlags::QOS_LOW;
                let packet_id = publish.packet_id.ok_or(WireError::MissingPacketId)?;
                body.put_u16(packet_id);
            }
            body.put_slice(&publish.payload);
            flags.bits()
        }
        Packet::PubAck(puback) => {
            body.put_u16(puback.packet_id);
            0
        }
        Packet::PingReq | Packet::PingResp => 0,
    };

    let remaining = body.len();
    let mut buf = BytesMut::with_capacity(1 + remaining_length_size(remaining) + remaining);
    buf.put_u8(((packet.packet_type() as u8) << 4) | flags);
    encode_remaining_length(remaining, &mut buf)?;
    buf.put_slice(&body);

    Ok(buf.freeze())
}

/// Decode exactly one complete frame
pub fn decode(frame: &[u8]) -> Result<Packet, WireError> {
    let header = FixedHeader::parse(frame)?.ok_or(WireError::Truncated)?;
    if frame.len() < header.frame_len() {
        return Err(WireError::Truncated);
    }
    if frame.len() > header.frame_len() {
        return Err(WireError::LengthMismatch {
            declared: header.remaining_length,
            consumed: frame.len() - header.header_len,
        });
    }
    let body = Bytes::copy_from_slice(&frame[header.header_len..]);
    decode_body(&header, body, DEFAULT_MAX_PACKET_SIZE)
}

/// Incremental frame decoder for parsing incoming bytes
#[derive(Debug)]
pub struct PacketDecoder {
    max_packet_size: usize,
}

impl PacketDecoder {
    /// Create a new packet decoder
    pub fn new() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    /// Create a decoder with a custom frame size limit
    pub fn with_max_packet_size(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer holds only part of a frame; the
    /// caller reads more and retries. Consumed bytes are removed from `buf`.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, WireError> {
        let Some(header) = FixedHeader::parse(buf)? else {
            return Ok(None);
        };

        if header.remaining_length > self.max_packet_size {
            return Err(WireError::Size(header.remaining_length));
        }

        let frame_len = header.frame_len();
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        let mut frame = buf.split_to(frame_len).freeze();
        frame.advance(header.header_len);
        trace!(
            "Decoding {:?} frame ({} bytes, {} buffered)",
            header.typ,
            frame_len,
            buf.len()
        );
        decode_body(&header, frame, self.max_packet_size).map(Some)
    }
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Payloads may inflate up to `max_payload` bytes
fn decode_body(
    header: &FixedHeader,
    mut body: Bytes,
    max_payload: usize,
) -> Result<Packet, WireError> {
    let declared = header.remaining_length;

    match header.typ {
        PacketType::Connect => {
            let protocol_name = take_string(&mut body)?;
            let protocol_level = take_u8(&mut body)?;
            let flags = ConnectFlags::from_bits_retain(take_u8(&mut body)?);
            let keep_alive_secs = take_u16(&mut body)?;
            Ok(Packet::Connect(ConnectPacket {
                protocol_name,
                protocol_level,
                flags,
                keep_alive_secs,
                payload: body,
            }))
        }

        PacketType::ConnAck => {
            let ack_flags = take_u8(&mut body)?;
            let return_code = ConnectReturnCode::from(take_u8(&mut body)?);
            let authentication = if body.has_remaining() {
                Some(take_string(&mut body)?)
            } else {
                None
            };
            expect_consumed(declared, &body)?;
            Ok(Packet::ConnAck(ConnAckPacket {
                ack_flags,
                return_code,
                authentication,
            }))
        }

        PacketType::Publish => {
            let flags = PublishFlags::from_bits_truncate(header.flags);
            let qos_bits = (header.flags >> 1) & 0x03;
            let qos = QualityOfService::try_from(qos_bits)?;
            let topic = PushTopic::from(take_u8(&mut body)?);
            let packet_id = match qos {
                QualityOfService::AtMostOnce => None,
                QualityOfService::AtLeastOnce => Some(take_u16(&mut body)?),
            };
            Ok(Packet::Publish(PublishPacket {
                topic,
                qos,
                dup: flags.contains(PublishFlags::DUP),
                retain: flags.contains(PublishFlags::RETAIN),
                packet_id,
                payload: maybe_decompress(body, max_payload)?,
            }))
        }

        PacketType::PubAck => {
            let packet_id = take_u16(&mut body)?;
            expect_consumed(declared, &body)?;
            Ok(Packet::PubAck(PubAckPacket { packet_id }))
        }

        PacketType::PingReq => {
            expect_consumed(declared, &body)?;
            Ok(Packet::PingReq)
        }

        PacketType::PingResp => {
            expect_consumed(declared, &body)?;
            Ok(Packet::PingResp)
        }
    }
}

/// Fails when a fixed-size variant left part of its declared body unread
fn expect_consumed(declared: usize, rest: &Bytes) -> Result<(), WireError> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(WireError::LengthMismatch {
            declared,
            consumed: declared - rest.len(),
        })
    }
}

fn take_u8(buf: &mut Bytes) -> Result<u8, WireError> {
    if buf.remaining() < 1 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u8())
}

fn take_u16(buf: &mut Bytes) -> Result<u16, WireError> {
    if buf.remaining() < 2 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u16())
}

fn take_string(buf: &mut Bytes) -> Result<String, WireError> {
    let len = take_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated);
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8)
}

fn put_string(buf: &mut BytesMut, value: &str) -> Result<(), WireError> {
    let len = u16::try_from(value.len()).map_err(|_| WireError::Size(value.len()))?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}
