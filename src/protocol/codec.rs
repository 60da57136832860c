//! Frame codec: fixed-size header plus a serialized body, and the
//! [`StreamBuffer`] the session reads frames out of.

use crate::protocol::MsgType;
use crate::session::error::Error;
use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serialized frame header size: msg type, body size, transaction id.
pub const HEADER_SIZE: usize = 12;

/// Safety ceiling for a declared body size. A header that claims more is
/// treated as stream corruption and kills the connection.
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Transaction id reserved for agent-initiated notifications.
pub const NOTIFICATION_TRANSACTION_ID: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub msg_type: u32,
    pub size: u32,
    pub transaction_id: u32,
}

impl Header {
    pub fn parse(buf: &[u8]) -> Option<Header> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        let word = |i: usize| u32::from_le_bytes(buf[i..i + 4].try_into().expect("4 bytes"));
        Some(Header {
            msg_type: word(0),
            size: word(4),
            transaction_id: word(8),
        })
    }

    pub fn write_to(&self, out: &mut BytesMut) {
        out.put_u32_le(self.msg_type);
        out.put_u32_le(self.size);
        out.put_u32_le(self.transaction_id);
    }
}

/// Serialize one frame: header plus json body.
pub fn encode<T: Serialize>(
    msg_type: MsgType,
    transaction_id: u32,
    body: &T,
) -> Result<Vec<u8>, Error> {
    let body = serde_json::to_vec(body).map_err(Error::Serialize)?;
    let mut out = BytesMut::with_capacity(HEADER_SIZE + body.len());
    Header {
        msg_type: msg_type as u32,
        size: body.len() as u32,
        transaction_id,
    }
    .write_to(&mut out);
    out.extend_from_slice(&body);
    Ok(out.to_vec())
}

pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(body).map_err(Error::Deserialize)
}

/// One complete frame consumed from a [`StreamBuffer`].
#[derive(Debug)]
pub struct Frame {
    pub header: Header,
    pub body: Vec<u8>,
}

/// Result of asking the stream buffer for the next frame.
#[derive(Debug)]
pub enum ReadFrame {
    /// A whole frame was buffered and has been consumed.
    Complete(Frame),
    /// Not enough bytes yet, try again after more data arrives.
    Pending,
    /// The declared body size exceeds [`MAX_MESSAGE_SIZE`]; the stream is
    /// corrupt and must be torn down.
    Corrupt(Header),
}

/// Reassembly buffer between the raw byte stream and frame dispatch.
/// Bytes are appended as they arrive; frames are consumed only when the
/// full declared body is available.
#[derive(Default)]
pub struct StreamBuffer {
    data: BytesMut,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.data.len()
    }

    /// Peek the header and consume exactly one frame if fully buffered.
    pub fn next_frame(&mut self) -> ReadFrame {
        let Some(header) = Header::parse(&self.data) else {
            return ReadFrame::Pending;
        };
        if header.size > MAX_MESSAGE_SIZE {
            return ReadFrame::Corrupt(header);
        }
        let total = HEADER_SIZE + header.size as usize;
        if self.data.len() < total {
            return ReadFrame::Pending;
        }
        self.data.advance(HEADER_SIZE);
        let body = self.data.split_to(header.size as usize).to_vec();
        ReadFrame::Complete(Frame { header, body })
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}
