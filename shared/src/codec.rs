//! Wire codec for tunnel frames.
//!
//! Each WebSocket binary message carries exactly one frame: a tag byte, the
//! big-endian u64 correlation id, then the frame's fields, each length
//! prefixed. Header lists travel as a JSON array of `[name, value]` pairs
//! inside the binary frame, so arbitrary header sets round-trip without a
//! fixed schema.
//!
//! ```text
//! Request:  0x01 | id u64 | method u16+utf8 | url u32+utf8
//!                | headers u32+json | body u32+raw
//! Response: 0x02 | id u64 | status u16
//!                | headers u32+json | body u32+raw
//! ```
//!
//! The keepalive token is a text message, never a binary frame; receivers
//! must check for it before handing bytes to this module.

use thiserror::Error;

use crate::protocol::{FrameTag, RequestFrame, ResponseFrame, MAX_MESSAGE_SIZE};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame is truncated")]
    Truncated,

    #[error("unknown frame tag {0:#04x}")]
    UnknownTag(u8),

    #[error("unexpected frame tag {0:#04x}")]
    UnexpectedTag(u8),

    #[error("{0} field is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("length {0} exceeds maximum message size")]
    Oversize(usize),

    #[error("trailing bytes after frame")]
    TrailingBytes,

    #[error("malformed headers: {0}")]
    Headers(#[from] serde_json::Error),
}

pub fn encode_request(frame: &RequestFrame) -> Result<Vec<u8>, CodecError> {
    let headers = headers_to_json(&frame.headers)?;
    let mut buf = Vec::with_capacity(32 + frame.url.len() + headers.len() + frame.body.len());
    buf.push(FrameTag::Request as u8);
    buf.extend_from_slice(&frame.id.to_be_bytes());
    put_short_str(&mut buf, &frame.method)?;
    put_blob(&mut buf, frame.url.as_bytes())?;
    put_blob(&mut buf, &headers)?;
    put_blob(&mut buf, &frame.body)?;
    Ok(buf)
}

pub fn decode_request(buf: &[u8]) -> Result<RequestFrame, CodecError> {
    let mut cur = Cursor::new(buf)?;
    cur.expect_tag(FrameTag::Request)?;
    let id = cur.u64()?;
    let method = cur.short_str("method")?;
    let url = utf8("url", cur.blob()?)?;
    let headers = headers_from_json(cur.blob()?)?;
    let body = cur.blob()?.to_vec();
    cur.finish()?;
    Ok(RequestFrame { id, url, method, headers, body })
}

pub fn encode_response(frame: &ResponseFrame) -> Result<Vec<u8>, CodecError> {
    let headers = headers_to_json(&frame.headers)?;
    let mut buf = Vec::with_capacity(16 + headers.len() + frame.body.len());
    buf.push(FrameTag::Response as u8);
    buf.extend_from_slice(&frame.id.to_be_bytes());
    buf.extend_from_slice(&frame.status.to_be_bytes());
    put_blob(&mut buf, &headers)?;
    put_blob(&mut buf, &frame.body)?;
    Ok(buf)
}

pub fn decode_response(buf: &[u8]) -> Result<ResponseFrame, CodecError> {
    let mut cur = Cursor::new(buf)?;
    cur.expect_tag(FrameTag::Response)?;
    let id = cur.u64()?;
    let status = cur.u16()?;
    let headers = headers_from_json(cur.blob()?)?;
    let body = cur.blob()?.to_vec();
    cur.finish()?;
    Ok(ResponseFrame { id, status, headers, body })
}

fn headers_to_json(headers: &[(String, String)]) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(headers)?)
}

/// An absent headers blob (empty or JSON `null`) decodes to an empty list
/// so nothing downstream ever sees a missing map.
fn headers_from_json(blob: &[u8]) -> Result<Vec<(String, String)>, CodecError> {
    if blob.is_empty() {
        return Ok(Vec::new());
    }
    let parsed: Option<Vec<(String, String)>> = serde_json::from_slice(blob)?;
    Ok(parsed.unwrap_or_default())
}

fn utf8(field: &'static str, bytes: &[u8]) -> Result<String, CodecError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8(field))
}

fn put_short_str(buf: &mut Vec<u8>, s: &str) -> Result<(), CodecError> {
    let len = u16::try_from(s.len()).map_err(|_| CodecError::Oversize(s.len()))?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn put_blob(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<(), CodecError> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::Oversize(bytes.len()));
    }
    let len = u32::try_from(bytes.len()).map_err(|_| CodecError::Oversize(bytes.len()))?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Bounds-checked reader over one frame's bytes. Declared lengths are
/// validated against [`MAX_MESSAGE_SIZE`] before any slice is taken, so a
/// hostile length field cannot trigger a huge allocation.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Result<Self, CodecError> {
        if buf.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::Oversize(buf.len()));
        }
        Ok(Self { buf, pos: 0 })
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(n).ok_or(CodecError::Truncated)?;
        if end > self.buf.len() {
            return Err(CodecError::Truncated);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        let bytes = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(arr))
    }

    fn expect_tag(&mut self, expected: FrameTag) -> Result<(), CodecError> {
        let raw = self.u8()?;
        match FrameTag::from_u8(raw) {
            Some(tag) if tag == expected => Ok(()),
            Some(_) => Err(CodecError::UnexpectedTag(raw)),
            None => Err(CodecError::UnknownTag(raw)),
        }
    }

    /// u16-length-prefixed UTF-8, used for the method field.
    fn short_str(&mut self, field: &'static str) -> Result<String, CodecError> {
        let len = self.u16()? as usize;
        utf8(field, self.take(len)?)
    }

    /// u32-length-prefixed byte blob.
    fn blob(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.u32()? as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(CodecError::Oversize(len));
        }
        self.take(len)
    }

    fn finish(&self) -> Result<(), CodecError> {
        if self.pos != self.buf.len() {
            return Err(CodecError::TrailingBytes);
        }
        Ok(())
    }
}
