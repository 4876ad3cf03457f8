//! Fixed header processing for the push wire protocol.
//!
//! Every frame starts with a one-byte type/flags header followed by the
//! remaining length in base-128 continuation encoding (at most four bytes).

use bitflags::bitflags;
use bytes::{BufMut, BytesMut};

/// Bytes the reader requests before it can start decoding a frame
pub const PACKET_HEADER_LENGTH: usize = 2;

/// Maximum number of bytes in the remaining-length field
pub const MAX_REMAINING_LENGTH_BYTES: usize = 4;

/// Largest remaining length expressible in four continuation bytes
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Packet types as tagged in the upper nibble of the header byte
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Client connect request
    Connect = 1,
    /// Connect acknowledgment
    ConnAck = 2,
    /// Publish message
    Publish = 3,
    /// Publish acknowledgment
    PubAck = 4,
    /// Ping request
    PingReq = 12,
    /// Ping response
    PingResp = 13,
}

impl TryFrom<u8> for PacketType {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::ConnAck),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::PubAck),
            12 => Ok(PacketType::PingReq),
            13 => Ok(PacketType::PingResp),
            _ => Err(crate::WireError::UnsupportedPacketType(value)),
        }
    }
}

bitflags! {
    /// Publish flags carried in the lower nibble of the header byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PublishFlags: u8 {
        /// Broker should retain the message
        const RETAIN = 1 << 0;
        /// QoS low bit
        const QOS_LOW = 1 << 1;
        /// QoS high bit
        const QOS_HIGH = 1 << 2;
        /// Redelivery of an earlier publish
        const DUP = 1 << 3;
    }
}

bitflags! {
    /// Connect flags byte of the variable header
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConnectFlags: u8 {
        /// Start with a clean broker-side session
        const CLEAN_SESSION = 1 << 1;
        /// Will message present
        const WILL = 1 << 2;
        /// Will message is retained
        const WILL_RETAIN = 1 << 5;
        /// Password present
        const PASSWORD = 1 << 6;
        /// Username present
        const USERNAME = 1 << 7;
    }
}

/// Decoded fixed header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    /// Packet type
    pub typ: PacketType,
    /// Lower nibble flags
    pub flags: u8,
    /// Bytes following the fixed header
    pub remaining_length: usize,
    /// Size of the fixed header itself (type byte + length bytes)
    pub header_len: usize,
}

impl FixedHeader {
    /// Total frame size when encoded
    pub fn frame_len(&self) -> usize {
        self.header_len + self.remaining_length
    }

    /// Parse a fixed header from the start of `buf`.
    ///
    /// Returns `Ok(None)` while more bytes are needed. A fourth length byte
    /// that still has the continuation bit set is rejected immediately.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>, crate::WireError> {
        let Some(&first) = buf.first() else {
            return Ok(None);
        };
        let typ = PacketType::try_from(first >> 4)?;

        let Some((remaining_length, len_bytes)) = decode_remaining_length(&buf[1..])? else {
            return Ok(None);
        };

        Ok(Some(Self {
            typ,
            flags: first & 0x0F,
            remaining_length,
            header_len: 1 + len_bytes,
        }))
    }
}

/// Encode a remaining length in base-128 continuation form
pub fn encode_remaining_length(mut len: usize, buf: &mut BytesMut) -> Result<(), crate::WireError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(crate::WireError::Size(len));
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

/// Number of bytes `encode_remaining_length` emits for `len`
pub fn remaining_length_size(len: usize) -> usize {
    match len {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

/// Decode a remaining length; returns the value and the bytes it occupied,
/// or `None` if `buf` ends before the final length byte.
pub fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, crate::WireError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;

    for index in 0..MAX_REMAINING_LENGTH_BYTES {
        let Some(&byte) = buf.get(index) else {
            return Ok(None);
        };
        value += (byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 1)));
        }
        multiplier *= 128;
    }

    Err(crate::WireError::MalformedLength)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_type_conversion() {
        assert_eq!(PacketType::try_from(3).unwrap(), PacketType::Publish);
        assert_eq!(PacketType::try_from(13).unwrap(), PacketType::PingResp);
        assert!(matches!(
            PacketType::try_from(8),
            Err(crate::WireError::UnsupportedPacketType(8))
        ));
    }

    #[test]
    fn test_remaining_length_boundaries() {
        for (len, expected) in [
            (0usize, vec![0x00u8]),
            (127, vec![0x7F]),
            (128, vec![0x80, 0x01]),
            (16_383, vec![0xFF, 0x7F]),
            (16_384, vec![0x80, 0x80, 0x01]),
            (MAX_REMAINING_LENGTH, vec![0xFF, 0xFF, 0xFF, 0x7F]),
        ] {
            let mut buf = BytesMut::new();
            encode_remaining_length(len, &mut buf).unwrap();
            assert_eq!(buf.as_ref(), expected.as_slice(), "encoding {len}");
            assert_eq!(remaining_length_size(len), expected.len());
            assert_eq!(
                decode_remaining_length(&buf).unwrap(),
                Some((len, expected.len()))
            );
        }
    }

    #[test]
    fn test_remaining_length_too_large() {
        let mut buf = BytesMut::new();
        assert!(matches!(
            encode_remaining_length(MAX_REMAINING_LENGTH + 1, &mut buf),
            Err(crate::WireError::Size(_))
        ));
    }

    #[test]
    fn test_fifth_length_byte_is_malformed() {
        let buf = [0xFF, 0xFF, 0xFF, 0xFF, 0x01];
        assert!(matches!(
            decode_remaining_length(&buf),
            Err(crate::WireError::MalformedLength)
        ));

        // Rejected as soon as the fourth byte shows a continuation
        let partial = [0x80, 0x80, 0x80, 0x80];
        assert!(matches!(
            decode_remaining_length(&partial),
            Err(crate::WireError::MalformedLength)
        ));
    }

    #[test]
    fn test_partial_header_needs_more() {
        assert!(FixedHeader::parse(&[]).unwrap().is_none());
        assert!(FixedHeader::parse(&[0x30]).unwrap().is_none());
        assert!(FixedHeader::parse(&[0x30, 0x80]).unwrap().is_none());

        let header = FixedHeader::parse(&[0x32, 0x80, 0x01]).unwrap().unwrap();
        assert_eq!(header.typ, PacketType::Publish);
        assert_eq!(header.flags, 0x02);
        assert_eq!(header.remaining_length, 128);
        assert_eq!(header.header_len, 3);
        assert_eq!(header.frame_len(), 131);
    }
}
