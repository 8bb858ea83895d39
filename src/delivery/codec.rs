// src/delivery/codec.rs
//! Message framing on transports
//!
//! Each frame is a big-endian u32 length followed by a bincode encoded
//! [`WireMessage`]. The sender and receive time are left out; the receiver
//! stamps both itself.

use thiserror::Error;

use crate::models::{ContactId, ConversationId, Message, MessageId, MessageType, Timestamp};

/// Largest frame body accepted from a peer
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Frame of {0} bytes exceeds the size limit")]
    FrameTooLarge(usize),

    #[error("Malformed frame: {0}")]
    Malformed(#[from] bincode::Error),
}

/// A message as it travels between peers
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WireMessage {
    pub id: MessageId,
    pub conversation: ConversationId,
    pub kind: MessageType,
    pub sent: Timestamp,
    pub acked: Timestamp,
    pub body: Vec<u8>,
}

impl From<&Message> for WireMessage {
    fn from(msg: &Message) -> Self {
        Self {
            id: msg.id,
            conversation: msg.conversation,
            kind: msg.kind,
            sent: msg.sent,
            acked: msg.acked,
            body: msg.body.clone(),
        }
    }
}

impl WireMessage {
    /// Local message record for a frame read from `sender`'s transport
    pub fn into_message(self, sender: ContactId) -> Message {
        Message {
            id: self.id,
            conversation: self.conversation,
            sender,
            kind: self.kind,
            sent: self.sent,
            received: 0,
            acked: self.acked,
            body: self.body,
        }
    }
}

/// Encode `msg` as one length-prefixed frame
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, CodecError> {
    let body = bincode::serialize(&WireMessage::from(msg))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(body.len()));
    }
    let mut frame = Vec::with_capacity(LENGTH_PREFIX + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Reassembles frames from arbitrarily split stream chunks
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes received but not yet part of a complete frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next complete frame, if one has been buffered
    pub fn next_frame(&mut self) -> Result<Option<WireMessage>, CodecError> {
        if self.buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let mut prefix = [0u8; LENGTH_PREFIX];
        prefix.copy_from_slice(&self.buf[..LENGTH_PREFIX]);
        let len = u32::from_be_bytes(prefix) as usize;
        if len > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(len));
        }
        if self.buf.len() < LENGTH_PREFIX + len {
            return Ok(None);
        }
        let frame: Vec<u8> = self.buf.drain(..LENGTH_PREFIX + len).skip(LENGTH_PREFIX).collect();
        Ok(Some(bincode::deserialize(&frame)?))
    }
}
