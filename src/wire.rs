//! Length-prefixed, message-typed wire codec.
//!
//! Every message is framed as `len:u16-be` followed by `len` bytes of
//! payload. The first 2 bytes of the payload are a big-endian message type;
//! the remainder is type-specific. See the message table for the six wire
//! types.

use crate::addr::{PeerAddr, PEER_ADDR_LEN};
use crate::digest::{Digest, DIGEST_LEN};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum payload bytes carried by a single Data frame (type 4/5).
pub const CHUNK_SIZE: usize = 1024;

/// Maximum frame body size accepted by the decoder. A Data frame body is at
/// most 2 (type tag) + CHUNK_SIZE bytes; this is a generous ceiling above
/// that so a corrupt length prefix can't make us allocate unbounded memory.
const MAX_FRAME_BODY: usize = 2 + CHUNK_SIZE + 64;

const TYPE_ADVERTISE: u16 = 1;
const TYPE_PEER: u16 = 2;
const TYPE_REQUEST: u16 = 3;
const TYPE_DATA: u16 = 4;
const TYPE_DATA_FINAL: u16 = 5;
const TYPE_FAIL: u16 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    /// Holder has no such digest committed.
    NotFound,
    /// Holder failed to read the committed file.
    ReadError,
}

impl FailReason {
    fn code(self) -> u16 {
        match self {
            FailReason::NotFound => 1,
            FailReason::ReadError => 2,
        }
    }

    fn from_code(code: u16) -> Result<Self, WireError> {
        match code {
            1 => Ok(FailReason::NotFound),
            2 => Ok(FailReason::ReadError),
            other => Err(WireError::UnknownFailReason(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Advertise(Digest),
    /// Reserved: accepted, never acted on by this crate.
    Peer(PeerAddr),
    Request(Digest),
    /// Non-final chunk of object bytes (up to CHUNK_SIZE).
    DataChunk(Vec<u8>),
    /// Final chunk of object bytes, terminates a successful response.
    DataFinal(Vec<u8>),
    Fail(FailReason),
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("unknown message type: {0}")]
    UnknownType(u16),
    #[error("unknown fail reason code: {0}")]
    UnknownFailReason(u16),
    #[error("malformed payload for message type {0}: expected {1} bytes, got {2}")]
    BadLength(u16, usize, usize),
    #[error("data chunk exceeds {CHUNK_SIZE} bytes")]
    ChunkTooLarge,
    #[error("frame body exceeds {MAX_FRAME_BODY} bytes")]
    FrameTooLarge,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Message {
    /// Encode the type tag + type-specific payload (without the outer
    /// length prefix).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Message::Advertise(d) => {
                out.extend_from_slice(&TYPE_ADVERTISE.to_be_bytes());
                out.extend_from_slice(d.as_bytes());
            }
            Message::Peer(a) => {
                out.extend_from_slice(&TYPE_PEER.to_be_bytes());
                out.extend_from_slice(&a.to_bytes());
            }
            Message::Request(d) => {
                out.extend_from_slice(&TYPE_REQUEST.to_be_bytes());
                out.extend_from_slice(d.as_bytes());
            }
            Message::DataChunk(bytes) => {
                out.extend_from_slice(&TYPE_DATA.to_be_bytes());
                out.extend_from_slice(bytes);
            }
            Message::DataFinal(bytes) => {
                out.extend_from_slice(&TYPE_DATA_FINAL.to_be_bytes());
                out.extend_from_slice(bytes);
            }
            Message::Fail(reason) => {
                out.extend_from_slice(&TYPE_FAIL.to_be_bytes());
                out.extend_from_slice(&reason.code().to_be_bytes());
            }
        }
        out
    }

    /// Decode a complete frame body (type tag + payload, no length prefix).
    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        if body.len() < 2 {
            return Err(WireError::BadLength(0, 2, body.len()));
        }
        let ty = u16::from_be_bytes([body[0], body[1]]);
        let payload = &body[2..];
        match ty {
            TYPE_ADVERTISE => Ok(Message::Advertise(decode_digest(ty, payload)?)),
            TYPE_PEER => Ok(Message::Peer(decode_peer_addr(ty, payload)?)),
            TYPE_REQUEST => Ok(Message::Request(decode_digest(ty, payload)?)),
            TYPE_DATA => {
                if payload.len() > CHUNK_SIZE {
                    return Err(WireError::ChunkTooLarge);
                }
                Ok(Message::DataChunk(payload.to_vec()))
            }
            TYPE_DATA_FINAL => {
                if payload.len() > CHUNK_SIZE {
                    return Err(WireError::ChunkTooLarge);
                }
                Ok(Message::DataFinal(payload.to_vec()))
            }
            TYPE_FAIL => {
                if payload.len() != 2 {
                    return Err(WireError::BadLength(ty, 2, payload.len()));
                }
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                Ok(Message::Fail(FailReason::from_code(code)?))
            }
            other => Err(WireError::UnknownType(other)),
        }
    }
}

fn decode_digest(ty: u16, payload: &[u8]) -> Result<Digest, WireError> {
    if payload.len() != DIGEST_LEN {
        return Err(WireError::BadLength(ty, DIGEST_LEN, payload.len()));
    }
    let mut bytes = [0u8; DIGEST_LEN];
    bytes.copy_from_slice(payload);
    Ok(Digest::from_bytes(bytes))
}

fn decode_peer_addr(ty: u16, payload: &[u8]) -> Result<PeerAddr, WireError> {
    if payload.len() != PEER_ADDR_LEN {
        return Err(WireError::BadLength(ty, PEER_ADDR_LEN, payload.len()));
    }
    let mut bytes = [0u8; PEER_ADDR_LEN];
    bytes.copy_from_slice(payload);
    Ok(PeerAddr::from_bytes(bytes))
}

/// Read one complete frame from an async byte stream: 2-byte length prefix
/// followed by that many payload bytes. `read_exact` already suspends across
/// arbitrary TCP fragmentation, so no separate state machine is needed on
/// the read side.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, WireError> {
    let mut len_bytes = [0u8; 2];
    reader.read_exact(&mut len_bytes).await?;
    let len = u16::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_BODY {
        return Err(WireError::FrameTooLarge);
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Message::decode(&body)
}

pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> Result<(), WireError> {
    let body = msg.encode();
    let len: u16 = body
        .len()
        .try_into()
        .map_err(|_| WireError::FrameTooLarge)?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    Ok(())
}

/// Sans-IO frame accumulator, used directly by tests that want to exercise
/// arbitrary fragmentation without a real socket.
#[derive(Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the next complete frame body (type tag + payload), if the
    /// buffered bytes contain one, consuming it from the internal buffer.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, WireError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if len > MAX_FRAME_BODY {
            return Err(WireError::FrameTooLarge);
        }
        if self.buf.len() < 2 + len {
            return Ok(None);
        }
        let body = self.buf[2..2 + len].to_vec();
        self.buf.drain(..2 + len);
        Ok(Some(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn frame(msg: &Message) -> Vec<u8> {
        let body = msg.encode();
        let len = body.len() as u16;
        let mut out = len.to_be_bytes().to_vec();
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn advertise_round_trips() {
        let d = Digest::of(b"object");
        let msg = Message::Advertise(d);
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn peer_round_trips() {
        let a = PeerAddr::new(Ipv4Addr::new(192, 168, 1, 1), 9000);
        let msg = Message::Peer(a);
        assert_eq!(msg, Message::decode(&msg.encode()).unwrap());
    }

    #[test]
    fn fail_round_trips() {
        let msg = Message::Fail(FailReason::ReadError);
        assert_eq!(msg, Message::decode(&msg.encode()).unwrap());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut body = vec![0u8, 99];
        body.extend_from_slice(&[0u8; DIGEST_LEN]);
        assert!(matches!(
            Message::decode(&body),
            Err(WireError::UnknownType(99))
        ));
    }

    #[test]
    fn decoder_tolerates_arbitrary_fragmentation() {
        let msg = Message::DataFinal(vec![7u8; 500]);
        let bytes = frame(&msg);

        // Feed the frame one byte at a time; only the last push should
        // complete it.
        let mut dec = FrameDecoder::new();
        let mut got = None;
        for (i, b) in bytes.iter().enumerate() {
            dec.push(&[*b]);
            let frame = dec.next_frame().unwrap();
            if i + 1 == bytes.len() {
                got = frame;
            } else {
                assert!(frame.is_none(), "completed early at byte {i}");
            }
        }
        let body = got.expect("frame should be complete after last byte");
        assert_eq!(Message::decode(&body).unwrap(), msg);
    }

    #[test]
    fn decoder_handles_multiple_frames_in_one_push() {
        let m1 = Message::Advertise(Digest::of(b"a"));
        let m2 = Message::Request(Digest::of(b"b"));
        let mut combined = frame(&m1);
        combined.extend_from_slice(&frame(&m2));

        let mut dec = FrameDecoder::new();
        dec.push(&combined);
        let f1 = dec.next_frame().unwrap().unwrap();
        let f2 = dec.next_frame().unwrap().unwrap();
        assert!(dec.next_frame().unwrap().is_none());
        assert_eq!(Message::decode(&f1).unwrap(), m1);
        assert_eq!(Message::decode(&f2).unwrap(), m2);
    }

    #[tokio::test]
    async fn async_read_write_round_trip() {
        let (client, server) = tokio::io::duplex(4096);
        let (mut client_r, mut client_w) = tokio::io::split(client);
        let (mut server_r, mut server_w) = tokio::io::split(server);

        let msg = Message::Request(Digest::of(b"xyz"));
        write_message(&mut client_w, &msg).await.unwrap();
        let got = read_message(&mut server_r).await.unwrap();
        assert_eq!(got, msg);

        let reply = Message::DataFinal(vec![]);
        write_message(&mut server_w, &reply).await.unwrap();
        let got = read_message(&mut client_r).await.unwrap();
        assert_eq!(got, reply);
    }
}
