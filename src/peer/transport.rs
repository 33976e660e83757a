use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::error::PeerError;
use super::message::{Handshake, Message, HANDSHAKE_LEN};
use crate::constants::{HANDSHAKE_TIMEOUT, PEER_IDLE_TIMEOUT, PEER_WRITE_TIMEOUT};

/// One message may not exceed the largest legal request plus its header.
const MAX_MESSAGE_SIZE: usize = (1 << 17) + 9;

/// Length-prefixed framing over a peer TCP stream.
///
/// EOF surfaces as [`PeerError::ConnectionClosed`], distinct from transport
/// errors; reads time out after the idle window and writes after the write
/// window.
pub struct PeerTransport {
    stream: TcpStream,
    read_buf: BytesMut,
}

impl PeerTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(32 * 1024),
        }
    }

    pub async fn send_handshake(&mut self, handshake: &Handshake) -> Result<(), PeerError> {
        let data = handshake.encode();
        timeout(HANDSHAKE_TIMEOUT, self.stream.write_all(&data))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Ok(())
    }

    pub async fn receive_handshake(&mut self) -> Result<Handshake, PeerError> {
        while self.read_buf.len() < HANDSHAKE_LEN {
            let n = timeout(HANDSHAKE_TIMEOUT, self.stream.read_buf(&mut self.read_buf))
                .await
                .map_err(|_| PeerError::Timeout)??;
            if n == 0 {
                return Err(PeerError::ConnectionClosed);
            }
        }

        let data = self.read_buf.split_to(HANDSHAKE_LEN);
        Handshake::decode(&data)
    }

    pub async fn send_message(&mut self, message: &Message) -> Result<(), PeerError> {
        let data = message.encode();
        timeout(PEER_WRITE_TIMEOUT, self.stream.write_all(&data))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Ok(())
    }

    /// Reads one complete message. The await doubles as the peer idle
    /// timeout: no bytes for the idle window fails the read.
    pub async fn receive_message(&mut self) -> Result<Message, PeerError> {
        while self.read_buf.len() < 4 {
            self.fill().await?;
        }

        let length = u32::from_be_bytes([
            self.read_buf[0],
            self.read_buf[1],
            self.read_buf[2],
            self.read_buf[3],
        ]) as usize;

        if length > MAX_MESSAGE_SIZE {
            return Err(PeerError::InvalidMessage(format!(
                "message too large: {length}"
            )));
        }

        let total = 4 + length;
        while self.read_buf.len() < total {
            self.fill().await?;
        }

        let data = self.read_buf.split_to(total);
        Message::decode(data.freeze())
    }

    async fn fill(&mut self) -> Result<(), PeerError> {
        let n = timeout(PEER_IDLE_TIMEOUT, self.stream.read_buf(&mut self.read_buf))
            .await
            .map_err(|_| PeerError::Timeout)??;
        if n == 0 {
            return Err(PeerError::ConnectionClosed);
        }
        Ok(())
    }

    pub fn peer_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.stream.peer_addr()
    }
}
