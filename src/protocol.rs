// Copyright 2020 Joyent, Inc.

//! This module contains the types and functions used to encode and decode
//! sio-rpc frames. A frame is a fixed-size header followed by an opaque body.
//! The header fields are written in big-endian byte order.

use std::convert::TryFrom;
use std::fmt;
use std::io::{Error, ErrorKind};

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const RP_OFF_ID: usize = 0x0;
const RP_OFF_TYPE: usize = 0x8;
const RP_OFF_RESERVED: usize = 0xc;
const RP_OFF_BODYLEN: usize = 0x10;
const RP_OFF_BODY: usize = 0x18;

/// The size in bytes of an encoded frame header
pub const RP_HEADER_SZ: usize = RP_OFF_BODY;

/// The default upper bound on the body length a peer may announce
pub const RP_DEFAULT_MAX_BODY_LEN: u64 = 64 * 1024 * 1024;
/// The largest `max_body_len` a client configuration may ask for
pub const RP_MAX_BODY_LEN_LIMIT: u64 = u32::MAX as u64;

/// An error type representing a failure to parse a buffer as a frame
/// header.
#[derive(Debug)]
pub enum FrameParseError {
    /// Fewer bytes than a full header are available. The value is the number
    /// of bytes that are available.
    NotEnoughBytes(usize),
    /// The header is malformed.
    IOError(Error),
}

impl From<Error> for FrameParseError {
    fn from(error: Error) -> Self {
        FrameParseError::IOError(error)
    }
}

impl From<FrameParseError> for Error {
    fn from(pfr: FrameParseError) -> Self {
        match pfr {
            FrameParseError::NotEnoughBytes(_) => {
                let msg = "Unable to parse frame: not enough bytes";
                Error::new(ErrorKind::Other, msg)
            }
            FrameParseError::IOError(e) => e,
        }
    }
}

impl fmt::Display for FrameParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameParseError::NotEnoughBytes(n) => {
                write!(f, "not enough bytes for a frame header: {}", n)
            }
            FrameParseError::IOError(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for FrameParseError {}

/// The fixed-size header preceding every frame body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    /// The call id, unique within one connection
    pub id: u64,
    /// The caller-defined message type
    pub msg_type: u32,
    /// Always zero on the wire
    pub reserved: u32,
    /// The number of body bytes following the header
    pub body_len: u64,
}

impl FrameHeader {
    pub fn new(id: u64, msg_type: u32, body_len: u64) -> FrameHeader {
        FrameHeader {
            id,
            msg_type,
            reserved: 0,
            body_len,
        }
    }

    /// Parse a header from the front of `buf`. Only the header bytes are
    /// examined; whether the body has fully arrived is left to the caller.
    pub fn parse(
        buf: &[u8],
        max_body_len: u64,
    ) -> Result<FrameHeader, FrameParseError> {
        if buf.len() < RP_HEADER_SZ {
            return Err(FrameParseError::NotEnoughBytes(buf.len()));
        }

        let id = BigEndian::read_u64(&buf[RP_OFF_ID..RP_OFF_TYPE]);
        let msg_type = BigEndian::read_u32(&buf[RP_OFF_TYPE..RP_OFF_RESERVED]);
        let reserved =
            BigEndian::read_u32(&buf[RP_OFF_RESERVED..RP_OFF_BODYLEN]);
        let body_len = BigEndian::read_u64(&buf[RP_OFF_BODYLEN..RP_OFF_BODY]);

        if reserved != 0 {
            let msg = format!("Invalid reserved field in header: {}", reserved);
            return Err(Error::new(ErrorKind::InvalidData, msg).into());
        }

        if body_len > max_body_len {
            let msg = format!(
                "Body length {} exceeds the maximum of {}",
                body_len, max_body_len
            );
            return Err(Error::new(ErrorKind::InvalidData, msg).into());
        }

        // frame_len() must fit in a usize on this target.
        let fits = usize::try_from(body_len)
            .ok()
            .and_then(|len| RP_HEADER_SZ.checked_add(len))
            .is_some();
        if !fits {
            let msg = format!("Body length {} is not addressable", body_len);
            return Err(Error::new(ErrorKind::InvalidData, msg).into());
        }

        Ok(FrameHeader {
            id,
            msg_type,
            reserved,
            body_len,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(RP_HEADER_SZ);
        buf.put_u64(self.id);
        buf.put_u32(self.msg_type);
        buf.put_u32(self.reserved);
        buf.put_u64(self.body_len);
    }

    /// The total size of the frame this header announces. Saturates for
    /// headers that `parse` would have rejected.
    pub fn frame_len(&self) -> usize {
        usize::try_from(self.body_len)
            .ok()
            .and_then(|len| RP_HEADER_SZ.checked_add(len))
            .unwrap_or(usize::MAX)
    }
}

/// A complete frame: header plus body.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub id: u64,
    pub msg_type: u32,
    pub body: Bytes,
}

impl Frame {
    pub fn new(id: u64, msg_type: u32, body: Bytes) -> Frame {
        Frame { id, msg_type, body }
    }

    /// Build a reply to `request`, reusing its call id and message type.
    pub fn response(request: &Frame, body: Bytes) -> Frame {
        Frame::new(request.id, request.msg_type, body)
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader::new(self.id, self.msg_type, self.body.len() as u64)
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(RP_HEADER_SZ + self.body.len());
        self.header().encode(buf);
        buf.put_slice(&self.body);
    }
}

/// A tokio-util codec that splits a byte stream into `Frame`s.
#[derive(Clone, Debug)]
pub struct RpcCodec {
    max_body_len: u64,
}

impl RpcCodec {
    pub fn new(max_body_len: u64) -> RpcCodec {
        RpcCodec { max_body_len }
    }
}

impl Default for RpcCodec {
    fn default() -> Self {
        RpcCodec::new(RP_DEFAULT_MAX_BODY_LEN)
    }
}

impl Decoder for RpcCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, Error> {
        let header = match FrameHeader::parse(&buf[..], self.max_body_len) {
            Ok(header) => header,
            Err(FrameParseError::NotEnoughBytes(_)) => return Ok(None),
            Err(FrameParseError::IOError(e)) => return Err(e),
        };

        let frame_len = header.frame_len();
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        buf.advance(RP_HEADER_SZ);
        let body = buf.split_to(header.body_len as usize).freeze();
        Ok(Some(Frame::new(header.id, header.msg_type, body)))
    }
}

impl Encoder<Frame> for RpcCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, buf: &mut BytesMut) -> Result<(), Error> {
        if item.body.len() as u64 > self.max_body_len {
            let msg = format!(
                "Body length {} exceeds the maximum of {}",
                item.body.len(),
                self.max_body_len
            );
            return Err(Error::new(ErrorKind::InvalidInput, msg));
        }
        item.encode(buf);
        Ok(())
    }
}
