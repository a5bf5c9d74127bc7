//! The packet channel the protocol engines run over.
//!
//! Encryption, MAC and compression of the transport are external to the
//! core; engines only see a reliable, ordered stream of already-decoded
//! `(message type, payload)` pairs.

// Refs:
// * https://tools.ietf.org/html/rfc4253#section-6

use crate::error::Error;
use bytes::BufMut;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _, BufReader};

/// Hard bound on an accepted packet length; anything above this is
/// treated as corruption or attack.
const MAX_PACKET_LEN: usize = 256 * 1024;

/// A reliable, ordered, already-decrypted packet stream.
///
/// `read_packet` suspends until a full packet is available; both
/// operations fail fatally on transport errors.
#[allow(async_fn_in_trait)]
pub trait PacketChannel {
    async fn read_packet(&mut self) -> Result<(u8, Vec<u8>), Error>;

    async fn send_packet(&mut self, msg_type: u8, payload: &[u8]) -> Result<(), Error>;
}

/// Guards against miscounted payloads: the length a message declares
/// for its fields must match what the handler consumed.
pub fn integrity_check(declared: usize, computed: usize, msg_type: u8) -> Result<(), Error> {
    if declared != computed {
        return Err(Error::Protocol(format!(
            "packet integrity check failed: declared {} computed {} type {}",
            declared, computed, msg_type
        )));
    }
    Ok(())
}

/// Binary packet framing over a byte stream, without encryption.
///
/// Useful for driving the engines over `tokio::io::duplex` pairs and as
/// the pre-NEWKEYS cleartext channel.
pub struct StreamPacketChannel<T> {
    stream: BufReader<T>,
}

impl<T> StreamPacketChannel<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: T) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    pub fn into_inner(self) -> T {
        self.stream.into_inner()
    }
}

impl<T> PacketChannel for StreamPacketChannel<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    async fn read_packet(&mut self) -> Result<(u8, Vec<u8>), Error> {
        let packet_length = self.stream.read_u32().await? as usize;
        if packet_length == 0 || packet_length > MAX_PACKET_LEN {
            return Err(Error::Protocol(format!(
                "bad packet length {}",
                packet_length
            )));
        }

        let mut packet = vec![0u8; packet_length];
        self.stream.read_exact(&mut packet[..]).await?;

        let padding_length = packet[0] as usize;
        if padding_length + 2 > packet_length {
            return Err(Error::protocol("padding length exceeds packet"));
        }
        let msg_type = packet[1];
        let payload = packet[2..packet_length - padding_length].to_vec();

        tracing::trace!("<-- type {} ({} bytes)", msg_type, payload.len());
        Ok((msg_type, payload))
    }

    async fn send_packet(&mut self, msg_type: u8, payload: &[u8]) -> Result<(), Error> {
        const BLOCK_SIZE: usize = 8;

        // padding brings 4 (length) + 1 (padding length) + 1 (type) +
        // payload up to a block multiple, with at least 4 bytes of it
        let mut padding_length = BLOCK_SIZE - ((6 + payload.len()) % BLOCK_SIZE);
        if padding_length < 4 {
            padding_length += BLOCK_SIZE;
        }
        let packet_length = 2 + payload.len() + padding_length;

        let mut buf = Vec::with_capacity(4 + packet_length);
        buf.put_u32(packet_length as u32);
        buf.put_u8(padding_length as u8);
        buf.put_u8(msg_type);
        buf.put_slice(payload);
        buf.put_bytes(0, padding_length);

        tracing::trace!("--> type {} ({} bytes)", msg_type, payload.len());
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;

    /// A channel fed from a fixed script, recording everything sent.
    pub(crate) struct ScriptedChannel {
        pub(crate) inbound: VecDeque<(u8, Vec<u8>)>,
        pub(crate) outbound: Vec<(u8, Vec<u8>)>,
    }

    impl ScriptedChannel {
        pub(crate) fn new(inbound: impl IntoIterator<Item = (u8, Vec<u8>)>) -> Self {
            Self {
                inbound: inbound.into_iter().collect(),
                outbound: vec![],
            }
        }

        pub(crate) fn sent_types(&self) -> Vec<u8> {
            self.outbound.iter().map(|(t, _)| *t).collect()
        }
    }

    impl PacketChannel for ScriptedChannel {
        async fn read_packet(&mut self) -> Result<(u8, Vec<u8>), Error> {
            self.inbound
                .pop_front()
                .ok_or_else(|| Error::protocol("scripted peer hung up"))
        }

        async fn send_packet(&mut self, msg_type: u8, payload: &[u8]) -> Result<(), Error> {
            self.outbound.push((msg_type, payload.to_vec()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn stream_channel_roundtrip() {
        let (a, b) = tokio::io::duplex(4096);
        let mut tx = StreamPacketChannel::new(a);
        let mut rx = StreamPacketChannel::new(b);

        tx.send_packet(50, b"hello").await.unwrap();
        tx.send_packet(21, b"").await.unwrap();

        let (t, p) = rx.read_packet().await.unwrap();
        assert_eq!((t, &p[..]), (50, &b"hello"[..]));
        let (t, p) = rx.read_packet().await.unwrap();
        assert_eq!((t, &p[..]), (21, &b""[..]));
    }

    #[tokio::test]
    async fn integrity_mismatch_is_fatal() {
        assert!(integrity_check(12, 12, 9).is_ok());
        assert!(matches!(
            integrity_check(12, 11, 9),
            Err(Error::Protocol(_))
        ));
    }
}
