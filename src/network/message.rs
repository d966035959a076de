//! Wire protocol
//!
//! Every message travels as one frame: a 4-byte big-endian payload length followed by the
//! bincode encoding of [`Message`]. The codec is schema-driven, so a hostile peer can at
//! worst produce a decode error.

use crate::core::Block;
use crate::error::{BlockchainError, Result};
use crate::utils::{deserialize, serialize};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Write};

pub const FRAME_HEADER_LEN: usize = 4;

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum Message {
    /// Sent once by the dialer, advertising the port it listens on
    Connect { port: u16 },
    /// Ask the peer for its full chain
    SyncRequest,
    ChainResponse { blocks: Vec<Block> },
    Block { block: Block },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Connect { .. } => "CONNECT",
            Message::SyncRequest => "SYNC_REQUEST",
            Message::ChainResponse { .. } => "CHAIN_RESPONSE",
            Message::Block { .. } => "BLOCK",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Message> {
        deserialize(bytes)
    }
}

/// Header plus payload, ready for a single write
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        BlockchainError::Serialization(format!("Frame of {} bytes is too large", payload.len()))
    })?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend(len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let frame = encode_frame(payload)?;
    writer
        .write_all(&frame)
        .and_then(|_| writer.flush())
        .map_err(|e| BlockchainError::Transport(format!("Failed to send frame: {e}")))
}

/// Next frame payload, or `None` when the peer closed the stream between frames.
///
/// A length of zero or above `max_frame_bytes` leaves the stream position unknowable,
/// so it is reported as a transport failure rather than a recoverable protocol error.
pub fn read_frame<R: Read>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    let mut filled = 0;
    while filled < FRAME_HEADER_LEN {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(BlockchainError::Transport(
                    "Connection closed inside a frame header".to_string(),
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(BlockchainError::Transport(e.to_string())),
        }
    }

    let len = u32::from_be_bytes(header) as usize;
    if len == 0 || len > max_frame_bytes {
        return Err(BlockchainError::Transport(format!(
            "Frame length {len} outside 1..={max_frame_bytes}; abandoning stream"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).map_err(|e| {
        BlockchainError::Transport(format!("Connection lost inside a {len}-byte frame: {e}"))
    })?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_message_kinds() {
        assert_eq!(Message::Connect { port: 1 }.kind(), "CONNECT");
        assert_eq!(Message::SyncRequest.kind(), "SYNC_REQUEST");
        assert_eq!(
            Message::ChainResponse { blocks: vec![] }.kind(),
            "CHAIN_RESPONSE"
        );
    }

    #[test]
    fn test_block_message_survives_codec() {
        let block = Block::with_timestamp(3, 99, 1, "prev", b"payload".to_vec());
        let message = Message::Block { block };
        assert_eq!(Message::decode(&message.encode().unwrap()).unwrap(), message);
    }

    #[test]
    fn test_garbage_is_protocol_error() {
        let result = Message::decode(&[0xFF, 0x13, 0x37]);
        assert!(matches!(result, Err(BlockchainError::Protocol(_))));
    }

    #[test]
    fn test_frames_preserve_boundaries() {
        let mut stream = Vec::new();
        write_frame(&mut stream, b"first").unwrap();
        write_frame(&mut stream, b"second frame").unwrap();

        let mut cursor = Cursor::new(stream);
        assert_eq!(read_frame(&mut cursor, 64).unwrap().unwrap(), b"first");
        assert_eq!(
            read_frame(&mut cursor, 64).unwrap().unwrap(),
            b"second frame"
        );
        assert_eq!(read_frame(&mut cursor, 64).unwrap(), None);
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut stream = Vec::new();
        write_frame(&mut stream, &[7u8; 100]).unwrap();
        let result = read_frame(&mut Cursor::new(stream), 10);
        assert!(matches!(result, Err(BlockchainError::Transport(_))));
    }

    #[test]
    fn test_zero_length_frame_is_rejected() {
        let result = read_frame(&mut Cursor::new(vec![0, 0, 0, 0]), 10);
        assert!(result.is_err());
    }

    #[test]
    fn test_truncated_frame_is_transport_error() {
        let mut stream = encode_frame(b"complete payload").unwrap();
        stream.truncate(8);
        let result = read_frame(&mut Cursor::new(stream), 64);
        assert!(matches!(result, Err(BlockchainError::Transport(_))));

        let result = read_frame(&mut Cursor::new(vec![0, 0]), 64);
        assert!(matches!(result, Err(BlockchainError::Transport(_))));
    }
}
