//! Frame I/O helpers for the broker connection.
//!
//! This module implements the CONNECT that opens a fresh session and the
//! read-more-then-parse loop used by the connection's read task.

use bytes::BytesMut;
use push_wire::{ConnectPacket, Packet, PacketDecoder, PACKET_HEADER_LENGTH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use crate::data::PushConnectionData;
use crate::error::{Result, TransportError};

/// Encode and write one packet
pub async fn send_packet<W: AsyncWriteExt + Unpin>(mut writer: W, packet: &Packet) -> Result<()> {
    let frame_bytes = push_wire::encode(packet)?;
    writer.write_all(&frame_bytes).await?;
    writer.flush().await?;
    trace!("Sent {:?} ({} bytes)", packet.packet_type(), frame_bytes.len());
    Ok(())
}

/// Send the CONNECT frame carrying the deflated connection payload
pub async fn send_connect<W: AsyncWriteExt + Unpin>(
    writer: W,
    data: &PushConnectionData,
    keep_alive_secs: u16,
) -> Result<()> {
    let payload = data.build_connect_payload()?;
    let connect = ConnectPacket::new(keep_alive_secs, payload);
    send_packet(writer, &Packet::Connect(connect)).await?;
    debug!("Sent CONNECT with keep-alive {}s", keep_alive_secs);
    Ok(())
}

/// Read one packet from the socket.
///
/// Short reads are buffered until the frame's declared length is satisfied;
/// bytes belonging to the next frame stay in `buffer`.
pub async fn recv_packet<R: AsyncReadExt + Unpin>(
    mut reader: R,
    decoder: &mut PacketDecoder,
    buffer: &mut BytesMut,
) -> Result<Packet> {
    loop {
        if let Some(packet) = decoder.decode(buffer)? {
            return Ok(packet);
        }

        buffer.reserve(PACKET_HEADER_LENGTH);
        let bytes_read = reader.read_buf(buffer).await?;
        if bytes_read == 0 {
            return Err(TransportError::Eof.into());
        }

        trace!(
            "Read {} bytes, buffer now has {} bytes",
            bytes_read,
            buffer.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PushError;
    use push_wire::{PacketType, PushTopic, PublishPacket, QualityOfService};
    use std::io::Cursor;

    #[tokio::test]
    async fn test_connect_roundtrip() {
        let data = PushConnectionData::new("Mozilla/5.0 test", "567067343352427");

        let mut buffer = Vec::new();
        send_connect(&mut buffer, &data, 900).await.unwrap();

        let mut decoder = PacketDecoder::new();
        let mut read_buf = BytesMut::new();
        let packet = recv_packet(Cursor::new(buffer), &mut decoder, &mut read_buf)
            .await
            .unwrap();

        match packet {
            Packet::Connect(connect) => {
                assert_eq!(connect.protocol_name, "MQTToT");
                assert_eq!(connect.keep_alive_secs, 900);
                assert!(push_wire::is_zlib(&connect.payload));
            }
            other => panic!("expected CONNECT, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_back_to_back_frames() {
        let mut buffer = Vec::new();
        let publish = Packet::Publish(PublishPacket::new(
            PushTopic::Message,
            QualityOfService::AtLeastOnce,
            9,
            bytes::Bytes::from_static(b"{}"),
        ));
        send_packet(&mut buffer, &publish).await.unwrap();
        send_packet(&mut buffer, &Packet::PingResp).await.unwrap();

        let mut decoder = PacketDecoder::new();
        let mut read_buf = BytesMut::new();
        let mut cursor = Cursor::new(buffer);

        let first = recv_packet(&mut cursor, &mut decoder, &mut read_buf).await.unwrap();
        assert_eq!(first, publish);
        let second = recv_packet(&mut cursor, &mut decoder, &mut read_buf).await.unwrap();
        assert_eq!(second.packet_type(), PacketType::PingResp);

        let eof = recv_packet(&mut cursor, &mut decoder, &mut read_buf).await;
        assert!(matches!(
            eof,
            Err(PushError::Transport(TransportError::Eof))
        ));
    }
}
